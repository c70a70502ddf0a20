// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! Helper library for the mssql OCF resource agents.
//!
//! Two binaries are built from this crate: `ag-helper` drives an
//! Availability Group replica through the cluster manager's lifecycle
//! actions (start, monitor, promote, demote, pre/post notifications), and
//! `fci-helper` reconciles a Failover Cluster Instance's virtual server
//! name. Each invocation performs a single action against the local SQL
//! Server instance and exits with an OCF code offset by 10.

pub mod commands;
pub mod credentials;
pub mod health;
pub mod log;
pub mod ocf;
pub mod sql;
