// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! The Availability Group helper: argument handling, dispatch, and the
//! OCF action handlers.
//!
//! One invocation performs one action. The interesting actions are
//! role transitions: role-changing DDL returns before the transition
//! settles, so the handlers poll the role afterwards, and `promote` only
//! issues its FAILOVER after checking the surviving replicas' sequence
//! numbers and the quorum witness count.

use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    completion_of, open_checked, ActionResult, Completion, Connection, ConnectionArgs, Failure,
};
use crate::credentials::read_credentials_file;
use crate::log::Logger;
use crate::ocf::OcfExitCodes;
use crate::sql::ag::{self, AvailabilityMode, Role};
use crate::sql::{set_session_context_marker, ConnectOptions, QueryError, SqlClient};

/// How many times role transitions and database states are polled, one
/// second apart, before giving up.
const ROLE_POLL_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// The name of the Availability Group.
    #[arg(long)]
    pub ag_name: Option<String>,

    /// The action to perform.
    #[arg(long, value_enum)]
    pub action: Option<Action>,

    /// The number of times to try waiting for databases to be ONLINE.
    #[arg(long, default_value_t = 60)]
    pub online_databases_retries: u32,

    /// Promote the replica on this node even if its availability mode is
    /// ASYNCHRONOUS_COMMIT.
    #[arg(long)]
    pub skip_precheck: bool,

    /// The sequence numbers of each replica as stored in the cluster, in
    /// the format produced by the cluster manager's attribute query.
    #[arg(long, default_value = "")]
    pub sequence_numbers: String,

    /// The name of the node that is being promoted.
    #[arg(long)]
    pub new_master: Option<String>,

    /// Explicit value for REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT.
    /// When -1, the value is derived from the number of SYNCHRONOUS_COMMIT
    /// replicas.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub required_synchronized_secondaries_to_commit: i64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start the replica on this node.
    Start,
    /// Stop the replica on this node.
    Stop,
    /// Monitor the replica on this node.
    Monitor,
    /// Handle a pre-start notification for a new clone.
    PreStart,
    /// Handle a post-stop notification for a stopped clone.
    PostStop,
    /// Report the sequence number of the replica on this node.
    PrePromote,
    /// Promote the replica on this node to primary.
    Promote,
    /// Demote the replica on this node to secondary.
    Demote,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Monitor => "monitor",
            Action::PreStart => "pre-start",
            Action::PostStop => "post-stop",
            Action::PrePromote => "pre-promote",
            Action::Promote => "promote",
            Action::Demote => "demote",
        }
    }
}

/// Run one ag-helper invocation: validate arguments, connect, dispatch the
/// action, and produce the completion. `Err` means an unexpected error and
/// exit status 1; `Ok` carries the OCF completion.
pub async fn run(
    cli: Cli,
    progress: &Logger,
    sequence_number_out: &Logger,
) -> anyhow::Result<Completion> {
    progress.line(format!(
        "ag-helper invoked with hostname [{}]; port [{}]; ag-name [{}]; credentials-file [{}]; application-name [{}]; connection-timeout [{}]; health-threshold [{}]; action [{}]",
        cli.connection.hostname,
        cli.connection.port.unwrap_or(0),
        cli.ag_name.as_deref().unwrap_or(""),
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

    match cli.action {
        Some(Action::Start) | Some(Action::Monitor) => progress.line(format!(
            "ag-helper invoked with online-databases-retries [{}]; required-synchronized-secondaries-to-commit [{}]",
            cli.online_databases_retries, cli.required_synchronized_secondaries_to_commit,
        )),
        Some(Action::PreStart) | Some(Action::PostStop) => progress.line(format!(
            "ag-helper invoked with required-synchronized-secondaries-to-commit [{}]",
            cli.required_synchronized_secondaries_to_commit,
        )),
        Some(Action::Promote) => progress.line(format!(
            "ag-helper invoked with skip-precheck [{}]; sequence-numbers [...]; new-master [{}]; required-synchronized-secondaries-to-commit [{}]",
            cli.skip_precheck,
            cli.new_master.as_deref().unwrap_or(""),
            cli.required_synchronized_secondaries_to_commit,
        )),
        _ => {}
    }

    if cli.connection.hostname.is_empty() {
        return Err(anyhow!("a valid hostname must be specified using --hostname"));
    }

    let port = match cli.connection.port {
        Some(port) if port != 0 => port,
        _ => return Err(anyhow!("a valid port number must be specified using --port")),
    };

    let ag_name = match cli.ag_name {
        Some(ref name) if !name.is_empty() => name.clone(),
        _ => return Err(anyhow!("a valid AG name must be specified using --ag-name")),
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

    let new_master = match (action, cli.new_master) {
        (Action::Promote, Some(ref name)) if !name.is_empty() => name.clone(),
        (Action::Promote, _) => {
            return Err(anyhow!("a valid hostname must be specified using --new-master"))
        }
        (_, name) => name.unwrap_or_default(),
    };

    let codes = OcfExitCodes::from_env()?;

    if action == Action::Stop {
        // "Stopping" an AG replica has no meaning; don't even connect to
        // the instance or run a health check.
        return Ok(Completion::clean(codes.success));
    }

    let rsstc_override = match cli.required_synchronized_secondaries_to_commit {
        -1 => None,
        value if value < 0 || value > i64::from(i32::MAX) => {
            return Ok(Completion::failed(
                codes.err_configured,
                anyhow!(
                    "--required-synchronized-secondaries-to-commit must be set to a valid integer between 0 and one less than the number of SYNCHRONOUS_COMMIT replicas (both inclusive)"
                ),
            ));
        }
        value => Some(value as u32),
    };

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

    progress.line("Setting session context...");
    if let Err(error) = set_session_context_marker(&mut db).await {
        return Ok(Completion::failed(
            codes.err_generic,
            anyhow!("Failed to set session context: {error}"),
        ));
    }

    let result = match action {
        Action::Start => {
            start(
                &mut db,
                &ag_name,
                cli.online_databases_retries,
                rsstc_override,
                &codes,
                progress,
            )
            .await
        }
        Action::Monitor => {
            monitor(
                &mut db,
                &ag_name,
                cli.online_databases_retries,
                rsstc_override,
                &codes,
                progress,
            )
            .await
        }
        Action::PreStart => pre_start(&mut db, &ag_name, rsstc_override, &codes, progress).await,
        Action::PostStop => post_stop(&mut db, &ag_name, rsstc_override, &codes, progress).await,
        Action::PrePromote => {
            pre_promote(&mut db, &ag_name, &codes, progress, sequence_number_out).await
        }
        Action::Promote => {
            promote(
                &mut db,
                &ag_name,
                &cli.sequence_numbers,
                &new_master,
                cli.skip_precheck,
                rsstc_override,
                &codes,
                progress,
            )
            .await
        }
        Action::Demote => demote(&mut db, &ag_name, &codes).await,
        Action::Stop => unreachable!("handled before connecting"),
    };

    Ok(completion_of(result))
}

/// The OCF "start" action: ensure the replica exists and has left
/// RESOLVING, then run `monitor` to confirm health.
async fn start(
    db: &mut SqlClient,
    ag_name: &str,
    online_databases_retries: u32,
    rsstc_override: Option<u32>,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    // Set the replica to SECONDARY, ignoring errors: with a single replica
    // in the AG the DDL fails but still promotes the replica, and any real
    // problem is caught by monitor() below.
    let _ = ag::set_role_to_secondary(db, ag_name).await;

    // The DDL returns before the role change settles. Wait it out: were the
    // previous role RESOLVING, monitor() would report OCF_NOT_RUNNING, and
    // the cluster manager treats that as a hard start failure.
    match wait_until_role_satisfies(db, ag_name, progress, |role| role != Role::Resolving).await {
        Ok(()) => {}
        Err(RolePollError::Query(QueryError::NoRows)) => {
            return Err(Failure::new(
                codes.err_args,
                anyhow!(
                    "sys.availability_groups does not contain a row for the AG. Local replica may not be joined to the AG."
                ),
            ));
        }
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Failed while waiting for local replica to be in SECONDARY role: {error}"),
            ));
        }
    }

    monitor(
        db,
        ag_name,
        online_databases_retries,
        rsstc_override,
        codes,
        progress,
    )
    .await
}

/// The OCF "monitor" action.
///
/// Reports OCF_SUCCESS for a secondary, OCF_RUNNING_MASTER for a healthy
/// primary (with databases ONLINE when DB_FAILOVER is ON, and RSSTC
/// reconciled), and OCF_NOT_RUNNING when the AG row is missing or the
/// replica is RESOLVING.
async fn monitor(
    db: &mut SqlClient,
    ag_name: &str,
    online_databases_retries: u32,
    rsstc_override: Option<u32>,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    progress.line(format!("Querying role of {ag_name} on this node..."));

    let (role, role_desc) = match ag::get_role(db, ag_name).await {
        Ok(found) => found,
        Err(QueryError::NoRows) => {
            progress.line(format!(
                "No row found in sys.availability_groups for {ag_name}."
            ));
            return Ok(codes.not_running);
        }
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not query replica role: {error}"),
            ));
        }
    };

    progress.line(format!(
        "{} is in {} ({}) role.",
        ag_name,
        role_desc,
        role.value()
    ));

    match role {
        Role::Primary => {
            progress.line(format!("Querying DB_FAILOVER setting of {ag_name}..."));

            let db_failover = match ag::get_db_failover_mode(db, ag_name).await {
                Ok(mode) => mode,
                Err(error) => {
                    return Err(Failure::new(
                        codes.err_generic,
                        anyhow!("Could not query DB_FAILOVER setting: {error}"),
                    ));
                }
            };

            progress.line(format!(
                "{} has DB_FAILOVER = {}.",
                ag_name,
                if db_failover { "ON" } else { "OFF" }
            ));

            if db_failover {
                if let Err(error) =
                    wait_for_databases_to_be_online(db, ag_name, online_databases_retries, progress)
                        .await
                {
                    return Err(Failure::new(
                        codes.err_generic,
                        anyhow!("Failed while waiting for databases to be online: {error}"),
                    ));
                }
            }

            if let Err(error) = reconcile_rsstc(db, ag_name, rsstc_override, progress).await {
                return Err(Failure::new(codes.err_generic, error));
            }

            Ok(codes.running_master)
        }
        // Neither primary nor secondary: the replica is waiting to be set
        // one way or the other via start / promote, so report not running.
        Role::Resolving => Ok(codes.not_running),
        Role::Secondary => Ok(codes.success),
    }
}

/// Pre-start notification: a clone is about to start. If this node is the
/// primary, a replica may have been added to the AG, so reconcile RSSTC.
async fn pre_start(
    db: &mut SqlClient,
    ag_name: &str,
    rsstc_override: Option<u32>,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    let primary = match is_primary(db, ag_name, progress).await {
        Ok(primary) => primary,
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not check if local replica is in PRIMARY role: {error}"),
            ));
        }
    };

    if primary {
        if let Err(error) = reconcile_rsstc(db, ag_name, rsstc_override, progress).await {
            return Err(Failure::new(codes.err_generic, error));
        }
    }

    Ok(codes.success)
}

/// Post-stop notification: a clone has stopped. If this node is the
/// primary, a replica may have been removed from the AG, so reconcile
/// RSSTC.
async fn post_stop(
    db: &mut SqlClient,
    ag_name: &str,
    rsstc_override: Option<u32>,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    let primary = match is_primary(db, ag_name, progress).await {
        Ok(primary) => primary,
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not check if local replica is in PRIMARY role: {error}"),
            ));
        }
    };

    if primary {
        if let Err(error) = reconcile_rsstc(db, ag_name, rsstc_override, progress).await {
            return Err(Failure::new(codes.err_generic, error));
        }
    }

    Ok(codes.success)
}

/// Pre-promote notification: report this replica's sequence number for the
/// cluster manager's attribute store.
async fn pre_promote(
    db: &mut SqlClient,
    ag_name: &str,
    codes: &OcfExitCodes,
    progress: &Logger,
    sequence_number_out: &Logger,
) -> ActionResult {
    progress.line(format!(
        "Querying sequence number of {ag_name} on this node..."
    ));

    let (mode, mode_desc) = match ag::get_availability_mode(db, ag_name).await {
        Ok(found) => found,
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not query availability mode of local replica: {error}"),
            ));
        }
    };

    // Only SYNCHRONOUS_COMMIT and CONFIGURATION_ONLY replicas have sequence
    // numbers that mean anything for promotion safety.
    let sequence_number = match mode {
        AvailabilityMode::SynchronousCommit | AvailabilityMode::ConfigurationOnly => {
            match ag::get_sequence_number(db, ag_name).await {
                Ok(sequence_number) => sequence_number,
                Err(error) => {
                    return Err(Failure::new(
                        codes.err_generic,
                        anyhow!("Could not query sequence number of local replica: {error}"),
                    ));
                }
            }
        }
        AvailabilityMode::AsynchronousCommit => {
            progress.line(format!(
                "Availability mode of {} on this node is {} ({}).",
                ag_name,
                mode_desc,
                mode.value()
            ));
            0
        }
    };

    progress.line(format!(
        "{} has sequence number 0x{:016X}",
        ag_name, sequence_number
    ));
    sequence_number_out.line(format!("{sequence_number}"));

    Ok(codes.success)
}

/// The OCF "promote" action: fail the AG over to this replica, but only
/// after the safety protocol passes.
#[allow(clippy::too_many_arguments)]
async fn promote(
    db: &mut SqlClient,
    ag_name: &str,
    sequence_numbers: &str,
    new_master: &str,
    skip_precheck: bool,
    rsstc_override: Option<u32>,
    codes: &OcfExitCodes,
    progress: &Logger,
) -> ActionResult {
    let primary = match is_primary(db, ag_name, progress).await {
        Ok(primary) => primary,
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not check if local replica is in PRIMARY role: {error}"),
            ));
        }
    };
    if primary {
        return Ok(codes.success);
    }

    if skip_precheck {
        progress.line("Skipping pre-check since --skip-precheck was specified.");
    } else {
        progress.line(format!(
            "Checking availability mode of {ag_name} on this node..."
        ));

        let (mode, mode_desc) = match ag::get_availability_mode(db, ag_name).await {
            Ok(found) => found,
            Err(error) => {
                return Err(Failure::new(
                    codes.err_generic,
                    anyhow!("Could not query availability mode of local replica: {error}"),
                ));
            }
        };

        if mode == AvailabilityMode::SynchronousCommit {
            progress.line(format!(
                "Availability mode of {ag_name} on this node is SYNCHRONOUS_COMMIT."
            ));
        } else {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!(
                    "Local replica has availability mode {} ({}), so it cannot be promoted to PRIMARY",
                    mode_desc,
                    mode.value()
                ),
            ));
        }
    }

    progress.line("Verifying local replica's sequence number vs all sequence numbers...");

    let tally = match tally_sequence_numbers(sequence_numbers, new_master, progress) {
        Ok(tally) => tally,
        Err(error) => return Err(Failure::new(codes.err_generic, error)),
    };

    progress.line(format!(
        "Max sequence number of all replicas of {} is {}",
        ag_name, tally.max
    ));
    progress.line(format!(
        "Sequence number of {} replica on {} is {}",
        ag_name, new_master, tally.new_master
    ));
    progress.line(format!("{} sequence numbers were found", tally.count));

    if tally.new_master < tally.max {
        return Err(Failure::new(
            codes.err_generic,
            anyhow!(
                "Local replica has sequence number {} but max sequence number is {}, so it cannot be promoted",
                tally.new_master,
                tally.max
            ),
        ));
    }

    if tally.new_master == 0 {
        return Err(Failure::new(
            codes.err_generic,
            anyhow!("Local replica has sequence number 0, so it cannot be promoted"),
        ));
    }

    progress.line("Querying number of SYNCHRONOUS_COMMIT replicas...");

    let num_sync_replicas = match ag::get_num_sync_commit_replicas(db, ag_name).await {
        Ok(count) => count,
        Err(error) => {
            return Err(Failure::new(
                codes.err_generic,
                anyhow!("Could not query number of SYNCHRONOUS_COMMIT replicas: {error}"),
            ));
        }
    };

    progress.line(format!(
        "{} has {} SYNCHRONOUS_COMMIT replicas.",
        ag_name, num_sync_replicas
    ));

    let required_value = rsstc_override
        .unwrap_or_else(|| required_synchronized_secondaries_to_commit(num_sync_replicas));

    // Count-based quorum witness: the cluster manager is trusted to have
    // delivered a sequence number for every reachable replica.
    let required_count = required_sequence_numbers(num_sync_replicas, required_value);
    if i64::from(tally.count) < required_count {
        return Err(Failure::new(
            codes.err_generic,
            anyhow!(
                "Expected to receive {} sequence numbers but only received {}. Not enough replicas are online to safely promote the local replica.",
                required_count,
                tally.count
            ),
        ));
    }

    progress.line(format!(
        "Changing role of {ag_name} on this node to primary..."
    ));

    if let Err(error) = ag::failover(db, ag_name).await {
        return Err(Failure::new(
            codes.failed_master,
            anyhow!("Could not promote local replica to PRIMARY role: {error}"),
        ));
    }

    // FAILOVER returns before the role change finishes.
    if let Err(error) =
        wait_until_role_satisfies(db, ag_name, progress, |role| role == Role::Primary).await
    {
        return Err(Failure::new(
            codes.failed_master,
            anyhow!("Failed while waiting for local replica to be in PRIMARY role: {error}"),
        ));
    }

    progress.line(format!("{ag_name} is now primary role."));

    if let Err(error) = set_rsstc(db, ag_name, required_value, progress).await {
        return Err(Failure::new(
            codes.err_generic,
            anyhow!("Could not set value of REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT: {error}"),
        ));
    }

    Ok(codes.success)
}

/// The OCF "demote" action: set the replica to SECONDARY role.
async fn demote(db: &mut SqlClient, ag_name: &str, codes: &OcfExitCodes) -> ActionResult {
    if let Err(error) = ag::set_role_to_secondary(db, ag_name).await {
        return Err(Failure::new(
            codes.err_generic,
            anyhow!("Could not set local replica to SECONDARY role: {error}"),
        ));
    }

    Ok(codes.success)
}

/// Sequence numbers reported by the surviving replicas, parsed from the
/// cluster manager's attribute dump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SequenceNumberTally {
    /// Highest value seen on any line.
    max: i64,
    /// Value reported for the node being promoted; 0 when absent.
    new_master: i64,
    /// Number of lines that parsed.
    count: u32,
}

static SEQUENCE_NUMBER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^name="[^"]+" host="([^"]+)" value="(\d+)"$"#)
        .expect("sequence number line pattern")
});

/// Parse the multi-line sequence-numbers blob. Lines that do not match the
/// expected shape are logged and ignored; a matched value that does not
/// fit in 64 bits is an error.
fn tally_sequence_numbers(
    blob: &str,
    new_master: &str,
    progress: &Logger,
) -> anyhow::Result<SequenceNumberTally> {
    let mut tally = SequenceNumberTally::default();

    for line in blob.split('\n') {
        progress.line(format!("Sequence number line [{line}]"));

        let Some(captures) = SEQUENCE_NUMBER_LINE.captures(line) else {
            progress.line("Line does not match expected syntax. Ignoring.");
            continue;
        };

        let host = &captures[1];
        let value: i64 = captures[2]
            .parse()
            .map_err(|error| anyhow!("Could not parse sequence number line: {error}"))?;

        if host == new_master {
            tally.new_master = value;
        }
        tally.max = tally.max.max(value);
        tally.count += 1;
    }

    Ok(tally)
}

/// Derive REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT from the number of
/// SYNCHRONOUS_COMMIT replicas.
///
/// Quorum is floor(n/2) + 1 replicas; the required secondaries are quorum
/// minus the primary itself. CONFIGURATION_ONLY replicas are excluded
/// because the server accounts for them internally. Two-replica groups are
/// special: a lone surviving secondary must not block writes on the
/// primary, so the requirement is zero.
fn required_synchronized_secondaries_to_commit(num_sync_replicas: u32) -> u32 {
    if num_sync_replicas == 2 {
        return 0;
    }

    num_sync_replicas / 2
}

/// Number of sequence-number witnesses needed before a promotion is safe.
/// Negative when an operator override exceeds the replica count, in which
/// case any witness count passes.
fn required_sequence_numbers(num_sync_replicas: u32, required_value: u32) -> i64 {
    i64::from(num_sync_replicas) - i64::from(required_value)
}

/// Bring REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT in line with either
/// the operator's override or the value derived from the replica count.
async fn reconcile_rsstc(
    db: &mut SqlClient,
    ag_name: &str,
    rsstc_override: Option<u32>,
    progress: &Logger,
) -> anyhow::Result<()> {
    match rsstc_override {
        None => calculate_and_set_rsstc(db, ag_name, progress).await.map_err(|error| {
            anyhow!(
                "Could not calculate and set value of REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT: {error}"
            )
        }),
        Some(value) => set_rsstc(db, ag_name, value, progress).await.map_err(|error| {
            anyhow!("Could not set value of REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT: {error}")
        }),
    }
}

async fn calculate_and_set_rsstc(
    db: &mut SqlClient,
    ag_name: &str,
    progress: &Logger,
) -> Result<(), QueryError> {
    progress.line("Querying number of SYNCHRONOUS_COMMIT replicas...");

    let num_sync_replicas = ag::get_num_sync_commit_replicas(db, ag_name).await?;

    progress.line(format!(
        "{} has {} SYNCHRONOUS_COMMIT replicas.",
        ag_name, num_sync_replicas
    ));

    set_rsstc(
        db,
        ag_name,
        required_synchronized_secondaries_to_commit(num_sync_replicas),
        progress,
    )
    .await
}

async fn set_rsstc(
    db: &mut SqlClient,
    ag_name: &str,
    value: u32,
    progress: &Logger,
) -> Result<(), QueryError> {
    progress.line(format!(
        "Setting REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT of {ag_name} to {value}..."
    ));

    // The range check on the override and the count query both cap the
    // value below i32::MAX.
    ag::set_required_synchronized_secondaries_to_commit(db, ag_name, value as i32).await
}

async fn is_primary(
    db: &mut SqlClient,
    ag_name: &str,
    progress: &Logger,
) -> Result<bool, QueryError> {
    progress.line(format!("Querying role of {ag_name} on this node..."));

    let (role, role_desc) = ag::get_role(db, ag_name).await?;

    progress.line(format!(
        "{} is in {} ({}) role.",
        ag_name,
        role_desc,
        role.value()
    ));

    Ok(role == Role::Primary)
}

#[derive(Debug, thiserror::Error)]
enum RolePollError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("role did not settle after {0} attempts")]
    TimedOut(u32),
}

/// Poll the local replica's role until `predicate` accepts it.
///
/// Role-changing DDL returns before the transition completes, so callers
/// poll. The poll is bounded so a transition that never settles cannot
/// block the cluster manager indefinitely.
async fn wait_until_role_satisfies(
    db: &mut SqlClient,
    ag_name: &str,
    progress: &Logger,
    predicate: impl Fn(Role) -> bool,
) -> Result<(), RolePollError> {
    for _ in 0..ROLE_POLL_ATTEMPTS {
        progress.line(format!("Querying role of {ag_name} on this node..."));

        let (role, role_desc) = ag::get_role(db, ag_name).await?;

        progress.line(format!(
            "{} is in {} ({}) role.",
            ag_name,
            role_desc,
            role.value()
        ));

        if predicate(role) {
            return Ok(());
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Err(RolePollError::TimedOut(ROLE_POLL_ATTEMPTS))
}

/// Wait for every database in the AG to come ONLINE, retrying once per
/// second and echoing the non-ONLINE summary as progress. On exhaustion
/// the latest summary (or query error) is the error.
async fn wait_for_databases_to_be_online(
    db: &mut SqlClient,
    ag_name: &str,
    retries: u32,
    progress: &Logger,
) -> anyhow::Result<()> {
    let mut last_error = None;

    for _ in 0..retries {
        match ag::get_database_states(db, ag_name).await {
            Err(error) => last_error = Some(anyhow!(error)),
            Ok(summary) if !summary.is_empty() => {
                progress.line(&summary);
                last_error = Some(anyhow!(summary));
            }
            Ok(_) => {
                progress.line("All databases are ONLINE.");
                return Ok(());
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    match last_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::{
        required_sequence_numbers, required_synchronized_secondaries_to_commit,
        tally_sequence_numbers, Action, SequenceNumberTally,
    };
    use crate::log::Logger;

    #[test]
    fn rsstc_follows_the_quorum_formula() {
        let expectations = [
            (0, 0),
            (1, 0),
            (2, 0),
            (3, 1),
            (4, 2),
            (5, 2),
            (6, 3),
            (7, 3),
        ];
        for (num_sync, required) in expectations {
            assert_eq!(
                required_synchronized_secondaries_to_commit(num_sync),
                required,
                "numSync = {num_sync}"
            );
        }
    }

    #[test]
    fn witness_requirement_subtracts_the_tolerated_secondaries() {
        assert_eq!(required_sequence_numbers(3, 1), 2);
        assert_eq!(required_sequence_numbers(2, 0), 2);
        assert_eq!(required_sequence_numbers(5, 2), 3);
        // An operator override above the replica count makes the
        // requirement trivially satisfiable rather than impossible.
        assert_eq!(required_sequence_numbers(3, 5), -2);
    }

    #[test]
    fn tally_parses_hosts_values_and_counts() {
        let progress = Logger::capture();
        let blob = "name=\"seq-ag1\" host=\"node1\" value=\"11\"\n\
                    name=\"seq-ag1\" host=\"node2\" value=\"12\"\n\
                    name=\"seq-ag1\" host=\"node3\" value=\"9\"";

        let tally = tally_sequence_numbers(blob, "node2", &progress).unwrap();
        assert_eq!(
            tally,
            SequenceNumberTally {
                max: 12,
                new_master: 12,
                count: 3,
            }
        );
    }

    #[test]
    fn tally_ignores_lines_that_do_not_match() {
        let progress = Logger::capture();
        let blob = "garbage\n\
                    name=\"seq\" host=\"node1\" value=\"3\"\n\
                    name=\"seq\" host=\"node2\" value=\"not a number\"\n";

        let tally = tally_sequence_numbers(blob, "node1", &progress).unwrap();
        assert_eq!(tally.count, 1);
        assert_eq!(tally.max, 3);
        assert_eq!(tally.new_master, 3);

        let ignored = progress
            .captured()
            .iter()
            .filter(|line| line.contains("does not match expected syntax"))
            .count();
        // The garbage line, the non-numeric value line, and the trailing
        // empty line are all ignored.
        assert_eq!(ignored, 3);
    }

    #[test]
    fn tally_reports_zero_for_an_absent_new_master() {
        let progress = Logger::capture();
        let blob = "name=\"seq\" host=\"node1\" value=\"10\"";

        let tally = tally_sequence_numbers(blob, "node9", &progress).unwrap();
        assert_eq!(tally.new_master, 0);
        assert_eq!(tally.max, 10);
    }

    #[test]
    fn tally_fails_on_a_matched_value_that_overflows() {
        let progress = Logger::capture();
        // Matches the line shape but does not fit in an i64.
        let blob = "name=\"seq\" host=\"node1\" value=\"99999999999999999999\"";

        let error = tally_sequence_numbers(blob, "node1", &progress).unwrap_err();
        assert!(error
            .to_string()
            .contains("Could not parse sequence number line"));
    }

    #[test]
    fn lagging_new_master_is_detected_before_any_ddl() {
        // The monotonicity precondition works purely on the tally.
        let progress = Logger::capture();
        let blob = "name=\"seq\" host=\"a\" value=\"10\"\n\
                    name=\"seq\" host=\"b\" value=\"9\"";

        let tally = tally_sequence_numbers(blob, "b", &progress).unwrap();
        assert!(tally.new_master < tally.max);
    }

    #[test]
    fn action_names_match_the_resource_agent_vocabulary() {
        for (input, expected) in [
            ("start", Action::Start),
            ("stop", Action::Stop),
            ("monitor", Action::Monitor),
            ("pre-start", Action::PreStart),
            ("post-stop", Action::PostStop),
            ("pre-promote", Action::PrePromote),
            ("promote", Action::Promote),
            ("demote", Action::Demote),
        ] {
            assert_eq!(Action::from_str(input, false).unwrap(), expected);
            assert_eq!(expected.as_str(), input);
        }
    }
}
