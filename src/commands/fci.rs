// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! The Failover Cluster Instance helper: a simpler sibling of the AG
//! dispatcher.
//!
//! An FCI's identity is its virtual server name, which must be reconciled
//! on whichever node currently owns the resource: `start` points the
//! instance's local server entry at the virtual name, `monitor` verifies
//! `@@SERVERNAME` matches it.

use anyhow::anyhow;
use clap::{Parser, ValueEnum};

use super::{
    completion_of, open_checked, ActionResult, Completion, Connection, ConnectionArgs, Failure,
};
use crate::credentials::read_credentials_file;
use crate::log::Logger;
use crate::ocf::OcfExitCodes;
use crate::sql::{get_local_server_name, set_local_server_name, ConnectOptions, SqlClient};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// The action to perform.
    #[arg(long, value_enum)]
    pub action: Option<Action>,

    /// The virtual server name that should be set on the SQL Server
    /// instance.
    #[arg(long)]
    pub virtual_server_name: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start the instance resource on this node.
    Start,
    /// Monitor the instance resource on this node.
    Monitor,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Monitor => "monitor",
        }
    }
}

/// Run one fci-helper invocation. `Err` means an unexpected error and exit
/// status 1; `Ok` carries the OCF completion.
pub async fn run(cli: Cli, progress: &Logger) -> anyhow::Result<Completion> {
    progress.line(format!(
        "fci-helper invoked with hostname [{}]; port [{}]; credentials-file [{}]; application-name [{}]; connection-timeout [{}]; health-threshold [{}]; action [{}]",
        cli.connection.hostname,
        cli.connection.port.unwrap_or(0),
        cli.connection
            .credentials_file
            .as_deref()
            .unwrap_or_else(|| std::path::Path::new(""))
            .display(),
        cli.connection.application_name.as_deref().unwrap_or(""),
        cli.connection.connection_timeout,
        cli.connection.health_threshold,
        cli.action.map(Action::as_str).unwrap_or(""),
    ));

    if cli.action.is_some() {
        progress.line(format!(
            "fci-helper invoked with virtual-server-name [{}]",
            cli.virtual_server_name.as_deref().unwrap_or(""),
        ));
    }

    if cli.connection.hostname.is_empty() {
        return Err(anyhow!("a valid hostname must be specified using --hostname"));
    }

    let port = match cli.connection.port {
        Some(port) if port != 0 => port,
        _ => return Err(anyhow!("a valid port number must be specified using --port")),
    };

    let credentials_file = match cli.connection.credentials_file {
        Some(ref path) if !path.as_os_str().is_empty() => path.clone(),
        _ => {
            return Err(anyhow!(
                "a valid path to a credentials file must be specified using --credentials-file"
            ))
        }
    };

    let application_name = match cli.connection.application_name {
        Some(ref name) if !name.is_empty() => name.clone(),
        _ => {
            return Err(anyhow!(
                "a valid application name must be specified using --application-name"
            ))
        }
    };

    let action = match cli.action {
        Some(action) => action,
        None => return Err(anyhow!("a valid action must be specified using --action")),
    };

    let virtual_server_name = match cli.virtual_server_name {
        Some(ref name) if !name.is_empty() => name.clone(),
        _ => {
            return Err(anyhow!(
                "a valid virtual server name must be specified using --virtual-server-name"
            ))
        }
    };

    let codes = OcfExitCodes::from_env()?;

    let credentials = match read_credentials_file(&credentials_file) {
        Ok(credentials) => credentials,
        Err(error) => {
            return Ok(Completion::failed(
                codes.err_args,
                anyhow!("Could not read credentials file: {error}"),
            ));
        }
    };

    let options = ConnectOptions {
        hostname: cli.connection.hostname.clone(),
        port,
        username: credentials.username,
        password: credentials.password,
        application_name,
        connect_timeout: cli.connection.connection_timeout(),
    };

    let mut db = match open_checked(
        &options,
        cli.connection.health_threshold,
        &codes,
        progress,
    )
    .await?
    {
        Connection::Open(db) => db,
        Connection::Refused(completion) => return Ok(completion),
    };

    let result = match action {
        Action::Start => start(&mut db, &virtual_server_name, &codes, progress).await,
        Action::Monitor => monitor(&mut db, &virtual_server_name, &codes, progress).await,
    };

    Ok(completion_of(result))
}

/// The OCF "start" action: reconcile the local server name, then verify
/// it via `monitor`.
async fn start(
    db: &mut SqlClient,
    virtual_server_name: &str,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    progress.line(format!(
        "Setting local server name to {virtual_server_name}..."
    ));

    if let Err(error) = set_local_server_name(db, virtual_server_name).await {
        return Err(Failure::new(
            codes.err_generic,
            anyhow!("Could not set local server name: {error}"),
        ));
    }

    monitor(db, virtual_server_name, codes, progress).await
}

/// The OCF "monitor" action: `@@SERVERNAME` must match the virtual server
/// name, case-insensitively.
async fn monitor(
    db: &mut SqlClient,
    virtual_server_name: &str,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    progress.line("Querying local server name...");

    let current = match get_local_server_name(db).await {
        Ok(name) => name,
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not query local server name: {error}"),
            ));
        }
    };

    progress.line(format!("Local server name is {current}"));

    if !current.eq_ignore_ascii_case(virtual_server_name) {
        return Err(Failure::new(
            codes.err_args,
            anyhow!("Expected local server name to be {virtual_server_name} but it was {current}"),
        ));
    }

    Ok(codes.success)
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::Action;

    #[test]
    fn action_names_match_the_resource_agent_vocabulary() {
        assert_eq!(Action::from_str("start", false).unwrap(), Action::Start);
        assert_eq!(Action::from_str("monitor", false).unwrap(), Action::Monitor);
        assert!(Action::from_str("promote", false).is_err());
    }
}
