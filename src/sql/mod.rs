// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! SQL Server gateway: connection management and instance-level operations.
//!
//! Connections are opened over TDS with SQL authentication. The
//! health-checked open ([`open_db_with_health_check`]) runs a connector
//! task that retries until the caller's deadline, then probes the
//! connection with `sp_server_diagnostics`.

use std::time::Duration;

use tiberius::{AuthMethod, Client, Config, Query};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::health::{diagnose, Diagnostics, ServerHealth, ServerUnhealthyError};
use crate::log::Logger;

pub mod ag;

/// A live connection to a SQL Server instance.
pub type SqlClient = Client<Compat<TcpStream>>;

/// Everything needed to open a connection to one instance.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub application_name: String,
    /// Per-attempt connect timeout. [`open_db_with_health_check`] also uses
    /// it as the overall retry deadline.
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    fn to_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.hostname);
        config.port(self.port);
        config.authentication(AuthMethod::sql_server(&self.username, &self.password));
        config.application_name(&self.application_name);
        // The helpers talk to the instance they manage; there is no CA
        // bundle to validate the instance's certificate against.
        config.trust_cert();
        config
    }
}

/// Errors from a single gateway query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The query matched no rows. For AG queries this means the instance
    /// does not know the AG, or the local replica is not joined to it.
    #[error("no matching row")]
    NoRows,
    #[error(transparent)]
    Sql(#[from] tiberius::error::Error),
    /// A column was NULL or of an unexpected type.
    #[error("unexpected value in column {0}")]
    Column(&'static str),
}

/// Open a connection and complete the login round trip. Any failure,
/// including the per-attempt timeout, classifies as `DownOrUnresponsive`.
pub async fn open_db(options: &ConnectOptions) -> Result<SqlClient, ServerUnhealthyError> {
    let down = |inner: String| ServerUnhealthyError {
        health: ServerHealth::DownOrUnresponsive,
        inner,
    };

    match tokio::time::timeout(options.connect_timeout, connect(options)).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(error)) => Err(down(error.to_string())),
        Err(_) => Err(down(format!(
            "connection attempt to {}:{} timed out",
            options.hostname, options.port
        ))),
    }
}

async fn connect(options: &ConnectOptions) -> anyhow::Result<SqlClient> {
    let config = options.to_config();
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    let client = Client::connect(config, tcp.compat_write()).await?;
    Ok(client)
}

/// Why [`open_db_with_health_check`] did not return a healthy connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Unhealthy(ServerUnhealthyError),
    /// The diagnostics query itself failed; the instance's health is
    /// unknown.
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// A failed health-checked open.
///
/// `db` is `Some` when a connection was established but the instance was
/// diagnosed unhealthy; callers that tolerate the reported severity may
/// keep using it.
pub struct ConnectFailure {
    pub db: Option<SqlClient>,
    pub error: ConnectError,
}

/// Open a connection, retrying until `connect_timeout` elapses, then run
/// `sp_server_diagnostics` over it.
///
/// A connector task retries [`open_db`] with numbered attempts and a
/// one-second pause after each failure. The main flow waits for whichever
/// comes first: a delivered connection, a newer failure to remember, or
/// the deadline. On the deadline the last observed failure is returned, or
/// a synthesized `DownOrUnresponsive` timed-out error when no attempt
/// completed at all.
pub async fn open_db_with_health_check(
    options: &ConnectOptions,
    progress: &Logger,
) -> Result<SqlClient, ConnectFailure> {
    let deadline = tokio::time::Instant::now() + options.connect_timeout;

    let (db_tx, mut db_rx) = oneshot::channel::<SqlClient>();
    let (err_tx, mut err_rx) = watch::channel::<Option<ServerUnhealthyError>>(None);

    let connector = {
        let options = options.clone();
        let progress = progress.clone();
        async move {
            for attempt in 1u64.. {
                if db_tx.is_closed() {
                    // The main flow gave up; stop retrying.
                    return;
                }

                progress.line(format!(
                    "Attempt {} to connect to the instance at {}:{} and run sp_server_diagnostics",
                    attempt, options.hostname, options.port
                ));

                match open_db(&options).await {
                    Ok(db) => {
                        progress.line(format!(
                            "Connected to the instance at {}:{}",
                            options.hostname, options.port
                        ));
                        // The send only fails once the deadline has fired;
                        // dropping the returned client closes its socket.
                        let _ = db_tx.send(db);
                        return;
                    }
                    Err(error) => {
                        progress.line(format!("Attempt {attempt} returned error: {error}"));
                        err_tx.send_replace(Some(error));
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    };
    tokio::spawn(connector);

    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    let mut last_error: Option<ServerUnhealthyError> = None;
    let mut errors_open = true;

    loop {
        tokio::select! {
            delivered = &mut db_rx => {
                let mut db = match delivered {
                    Ok(db) => db,
                    // The connector cannot drop its sender without sending,
                    // short of a panic.
                    Err(_) => {
                        return Err(ConnectFailure {
                            db: None,
                            error: ConnectError::Unhealthy(ServerUnhealthyError {
                                health: ServerHealth::DownOrUnresponsive,
                                inner: "connection task exited unexpectedly".to_string(),
                            }),
                        });
                    }
                };

                match query_diagnostics(&mut db).await {
                    Ok(diagnostics) => match diagnose(diagnostics) {
                        Ok(()) => return Ok(db),
                        Err(error) => {
                            return Err(ConnectFailure {
                                db: Some(db),
                                error: ConnectError::Unhealthy(error),
                            });
                        }
                    },
                    Err(error) => {
                        let _ = db.close().await;
                        return Err(ConnectFailure { db: None, error: error.into() });
                    }
                }
            }
            changed = err_rx.changed(), if errors_open => {
                match changed {
                    Ok(()) => last_error = err_rx.borrow_and_update().clone(),
                    Err(_) => errors_open = false,
                }
            }
            () = &mut timeout => {
                let error = last_error.unwrap_or_else(|| ServerUnhealthyError {
                    health: ServerHealth::DownOrUnresponsive,
                    inner: format!(
                        "timed out while attempting to connect to the instance at {}:{} and run sp_server_diagnostics",
                        options.hostname, options.port
                    ),
                });
                return Err(ConnectFailure {
                    db: None,
                    error: ConnectError::Unhealthy(error),
                });
            }
        }
    }
}

/// Run `sp_server_diagnostics` once and fold its rows into a tuple.
/// Components other than system, resource and query_processing are
/// ignored.
pub async fn query_diagnostics(db: &mut SqlClient) -> Result<Diagnostics, QueryError> {
    let rows = db
        .simple_query("EXEC sp_server_diagnostics")
        .await?
        .into_first_result()
        .await?;

    let mut diagnostics = Diagnostics::default();
    for row in rows {
        let component: &str = row
            .try_get(2)?
            .ok_or(QueryError::Column("component_name"))?;
        let state: i32 = row.try_get(3)?.ok_or(QueryError::Column("state"))?;

        match component {
            "system" => diagnostics.system = state == 1,
            "resource" => diagnostics.resource = state == 1,
            "query_processing" => diagnostics.query_processing = state == 1,
            _ => {}
        }
    }

    Ok(diagnostics)
}

/// Mark the session as cluster-driven so downstream T-SQL can tell these
/// sessions apart from user ones.
pub async fn set_session_context_marker(db: &mut SqlClient) -> Result<(), QueryError> {
    db.simple_query(
        "EXEC sp_set_session_context @key = N'external_cluster', @value = N'yes', @read_only = 1",
    )
    .await?
    .into_results()
    .await?;
    Ok(())
}

/// Read `@@SERVERNAME`.
pub async fn get_local_server_name(db: &mut SqlClient) -> Result<String, QueryError> {
    let row = db
        .simple_query("SELECT @@SERVERNAME")
        .await?
        .into_row()
        .await?
        .ok_or(QueryError::NoRows)?;
    let name: &str = row.try_get(0)?.ok_or(QueryError::Column("@@SERVERNAME"))?;
    Ok(name.to_string())
}

/// Point the instance's local server entry at `server_name`.
///
/// Idempotent: when the `sys.servers` row 0 already carries the name
/// (case-insensitively), nothing is issued. Otherwise any existing row is
/// dropped with `sp_dropserver` and the name added with `sp_addserver`.
pub async fn set_local_server_name(
    db: &mut SqlClient,
    server_name: &str,
) -> Result<(), QueryError> {
    let row = db
        .simple_query("SELECT name FROM sys.servers WHERE server_id = 0")
        .await?
        .into_row()
        .await?;

    let current = match &row {
        Some(row) => {
            let name: &str = row.try_get(0)?.ok_or(QueryError::Column("name"))?;
            Some(name.to_string())
        }
        None => None,
    };

    if let Some(current) = current {
        if current.eq_ignore_ascii_case(server_name) {
            return Ok(());
        }

        let mut drop_server = Query::new("EXEC sp_dropserver @P1");
        drop_server.bind(current);
        drop_server.execute(db).await?;
    }

    let mut add_server = Query::new("EXEC sp_addserver @P1, local");
    add_server.bind(server_name);
    add_server.execute(db).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{open_db_with_health_check, ConnectError, ConnectOptions};
    use crate::health::ServerHealth;
    use crate::log::Logger;

    fn options(port: u16, timeout: Duration) -> ConnectOptions {
        ConnectOptions {
            hostname: "127.0.0.1".to_string(),
            port,
            username: "sa".to_string(),
            password: "unused".to_string(),
            application_name: "mssql-ha-test".to_string(),
            connect_timeout: timeout,
        }
    }

    fn unhealthy(error: ConnectError) -> crate::health::ServerUnhealthyError {
        match error {
            ConnectError::Unhealthy(error) => error,
            ConnectError::Query(error) => panic!("expected a health error, got {error}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_returns_the_last_observed_error() {
        // Bind and drop a listener so the port is known to refuse.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let progress = Logger::capture();
        let failure = open_db_with_health_check(&options(port, Duration::from_secs(2)), &progress)
            .await
            .err()
            .expect("connect must fail");

        assert!(failure.db.is_none());
        let error = unhealthy(failure.error);
        assert_eq!(error.health, ServerHealth::DownOrUnresponsive);
        // A refused attempt completed, so the synthesized timeout error must
        // not be the one reported.
        assert!(!error.inner.contains("timed out while attempting"));

        let lines = progress.captured();
        assert!(lines.iter().any(|line| line.contains(
            "Attempt 1 to connect to the instance"
        )));
        assert!(lines.iter().any(|line| line.contains("returned error")));
    }

    #[tokio::test]
    async fn hung_connection_synthesizes_a_timeout_error() {
        // A listener that accepts but never speaks TDS keeps the single
        // attempt in flight past the deadline.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let progress = Logger::capture();
        let failure = open_db_with_health_check(&options(port, Duration::from_secs(1)), &progress)
            .await
            .err()
            .expect("connect must fail");

        let error = unhealthy(failure.error);
        assert_eq!(error.health, ServerHealth::DownOrUnresponsive);
        // The per-attempt timeout and the overall deadline fire together
        // here, so either timeout wording is acceptable; both classify as
        // down-or-unresponsive.
        assert!(error.inner.contains("timed out"));

        hold.abort();
    }
}
