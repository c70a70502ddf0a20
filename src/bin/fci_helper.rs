// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! Called by the cluster manager's mssql Failover Cluster Instance
//! resource agent to check instance health and reconcile the virtual
//! server name. Exits with the action's OCF code offset by 10, or 1 on an
//! unexpected error.

use anyhow::anyhow;
use clap::Parser;

use mssql_ha_lib::commands::fci;
use mssql_ha_lib::log::Logger;
use mssql_ha_lib::ocf;

fn main() {
    let progress = Logger::stdout();
    let errors = Logger::stderr("ERROR: ");

    let cli = fci::Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => ocf::exit(&errors, 1, Some(&anyhow!("Unexpected error: {error}"))),
    };

    let outcome = runtime.block_on(fci::run(cli, &progress));

    // Tear the runtime down first so the connector task and the SQL
    // connection are gone before the process exits.
    drop(runtime);

    match outcome {
        Ok(completion) => ocf::ocf_exit(&errors, completion.code, completion.error.as_ref()),
        Err(error) => ocf::exit(&errors, 1, Some(&anyhow!("Unexpected error: {error}"))),
    }
}
