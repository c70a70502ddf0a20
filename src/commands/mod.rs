// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! Command-line dispatch shared by the two helper binaries.
//!
//! Each binary performs exactly one action per invocation and exits with
//! an OCF code. Handlers resolve to an [`ActionResult`]; the binary's
//! `main` converts the [`Completion`] into a process exit so the tokio
//! runtime (and the SQL connection inside it) is torn down first.

pub mod ag;
pub mod fci;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::Args;

use crate::log::Logger;
use crate::ocf::{OcfExitCode, OcfExitCodes};
use crate::sql::{open_db_with_health_check, ConnectError, ConnectOptions, SqlClient};

/// Connection flags common to both helpers.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// The hostname of the SQL Server instance to connect to.
    #[arg(long, default_value = "localhost")]
    pub hostname: String,

    /// The port on which the instance is listening for logins.
    #[arg(long)]
    pub port: Option<u16>,

    /// The path to the credentials file.
    #[arg(long)]
    pub credentials_file: Option<PathBuf>,

    /// The application name to use for the T-SQL connection.
    #[arg(long)]
    pub application_name: Option<String>,

    /// The connection timeout in seconds. The helper retries connecting to
    /// the instance until this time elapses.
    #[arg(long, default_value_t = 30)]
    pub connection_timeout: u64,

    /// The instance health threshold. Health statuses at or below it fail
    /// the action; worse is lower.
    #[arg(long, default_value_t = 3)]
    pub health_threshold: u32,
}

impl ConnectionArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

/// How an action finished: the OCF code to exit with, plus the error to
/// print for failure outcomes.
pub struct Completion {
    pub code: OcfExitCode,
    pub error: Option<anyhow::Error>,
}

impl Completion {
    pub fn clean(code: OcfExitCode) -> Self {
        Completion { code, error: None }
    }

    pub fn failed(code: OcfExitCode, error: anyhow::Error) -> Self {
        Completion {
            code,
            error: Some(error),
        }
    }
}

/// An action failure carrying the OCF code to report.
pub struct Failure {
    pub code: OcfExitCode,
    pub error: anyhow::Error,
}

impl Failure {
    pub fn new(code: OcfExitCode, error: anyhow::Error) -> Self {
        Failure { code, error }
    }
}

/// Every handler resolves to an OCF exit code, with an error attached on
/// the failure side.
pub type ActionResult = Result<OcfExitCode, Failure>;

fn completion_of(result: ActionResult) -> Completion {
    match result {
        Ok(code) => Completion::clean(code),
        Err(failure) => Completion::failed(failure.code, failure.error),
    }
}

/// Outcome of the health-checked open after the threshold is applied.
enum Connection {
    Open(SqlClient),
    /// The invocation is over; exit with this completion.
    Refused(Completion),
}

/// Open the instance with the health check and apply `threshold`.
///
/// A health status at or below the threshold fails the action with
/// OCF_ERR_GENERIC. A worse-than-threshold status is logged and tolerated,
/// but only when the health check actually produced a live connection;
/// otherwise there is nothing to proceed with. Non-health errors propagate
/// as unexpected.
async fn open_checked(
    options: &ConnectOptions,
    threshold: u32,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> anyhow::Result<Connection> {
    let failure = match open_db_with_health_check(options, progress).await {
        Ok(db) => return Ok(Connection::Open(db)),
        Err(failure) => failure,
    };

    match failure.error {
        ConnectError::Unhealthy(error) => {
            let status = u32::from(error.health);
            if status <= threshold {
                return Ok(Connection::Refused(Completion::failed(
                    codes.err_generic,
                    anyhow!(
                        "Instance health status {status} is at or below the threshold value of {threshold}"
                    ),
                )));
            }

            progress.line(format!(
                "Instance health status {status} is greater than the threshold value of {threshold}"
            ));

            match failure.db {
                Some(db) => Ok(Connection::Open(db)),
                None => Ok(Connection::Refused(Completion::failed(
                    codes.err_generic,
                    anyhow!(
                        "Instance health status {status} was tolerated but no connection to the instance was established"
                    ),
                ))),
            }
        }
        ConnectError::Query(error) => Err(error.into()),
    }
}
