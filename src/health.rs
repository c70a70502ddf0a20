// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! health.rs
//!
//! Server health classification. `sp_server_diagnostics` reports
//! per-component health; the gateway folds its rows into a [`Diagnostics`]
//! tuple and [`diagnose`] turns that into a pass/fail with a severity.

use std::fmt;

/// Component states reported by one run of `sp_server_diagnostics`.
///
/// Each flag is true iff the corresponding row reported state 1 (clean).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    pub system: bool,
    pub resource: bool,
    pub query_processing: bool,
}

/// Instance health severity. Lower values are worse; callers compare
/// against a numeric threshold and reject anything at or below it.
///
/// There is no member with value 2: this classification cannot tell "down"
/// from "unresponsive", a single code covers both, and the wire values of
/// the remaining members are kept stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerHealth {
    /// The instance is down or refusing connections.
    DownOrUnresponsive = 1,
    /// `sp_server_diagnostics` detected a critical system error.
    CriticalError = 3,
    /// `sp_server_diagnostics` detected a moderate resource error.
    ModerateError = 4,
    /// `sp_server_diagnostics` detected an error that is neither moderate
    /// nor critical.
    AnyQualifiedError = 5,
}

impl From<ServerHealth> for u32 {
    fn from(health: ServerHealth) -> Self {
        health as u32
    }
}

/// The instance failed its health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUnhealthyError {
    pub health: ServerHealth,
    pub inner: String,
}

impl fmt::Display for ServerUnhealthyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.health {
            ServerHealth::AnyQualifiedError => "AnyQualified",
            ServerHealth::ModerateError => "Moderate",
            ServerHealth::CriticalError => "Critical",
            ServerHealth::DownOrUnresponsive => "Unresponsive or down",
        };
        write!(f, "{} {}", severity, self.inner)
    }
}

impl std::error::Error for ServerUnhealthyError {}

/// Classify a diagnostics tuple.
///
/// Failures are reported in priority order: a system error outranks a
/// resource error, which outranks a query-processing error.
pub fn diagnose(diagnostics: Diagnostics) -> Result<(), ServerUnhealthyError> {
    if !diagnostics.system {
        return Err(ServerUnhealthyError {
            health: ServerHealth::CriticalError,
            inner: "sp_server_diagnostics result indicates system error".to_string(),
        });
    }

    if !diagnostics.resource {
        return Err(ServerUnhealthyError {
            health: ServerHealth::ModerateError,
            inner: "sp_server_diagnostics result indicates resource error".to_string(),
        });
    }

    if !diagnostics.query_processing {
        return Err(ServerUnhealthyError {
            health: ServerHealth::AnyQualifiedError,
            inner: "sp_server_diagnostics result indicates query processing error".to_string(),
        });
    }

    Ok(())
}
