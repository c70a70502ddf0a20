// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! Availability Group queries and DDL.
//!
//! Every operation keys on the AG name. Queries about the local replica
//! join `sys.dm_hadr_availability_replica_states` restricted to
//! `is_local = 1`. Values are bound as parameters; names spliced into DDL
//! go through [`quote_name`].

use tiberius::Query;

use super::{QueryError, SqlClient};

/// An AG replica's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Neither primary nor secondary; the replica is waiting to be set one
    /// way or the other.
    Resolving = 0,
    Primary = 1,
    Secondary = 2,
}

impl Role {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = QueryError;

    fn try_from(value: u8) -> Result<Self, QueryError> {
        match value {
            0 => Ok(Role::Resolving),
            1 => Ok(Role::Primary),
            2 => Ok(Role::Secondary),
            _ => Err(QueryError::Column("role")),
        }
    }
}

/// An AG replica's availability (commit) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityMode {
    AsynchronousCommit = 0,
    SynchronousCommit = 1,
    /// Holds AG configuration but no user databases.
    ConfigurationOnly = 4,
}

impl AvailabilityMode {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AvailabilityMode {
    type Error = QueryError;

    fn try_from(value: u8) -> Result<Self, QueryError> {
        match value {
            0 => Ok(AvailabilityMode::AsynchronousCommit),
            1 => Ok(AvailabilityMode::SynchronousCommit),
            4 => Ok(AvailabilityMode::ConfigurationOnly),
            _ => Err(QueryError::Column("availability_mode")),
        }
    }
}

/// An AG replica's seeding mode. Read-only for the helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedingMode {
    Automatic = 0,
    Manual = 1,
}

impl SeedingMode {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SeedingMode {
    type Error = QueryError;

    fn try_from(value: u8) -> Result<Self, QueryError> {
        match value {
            0 => Ok(SeedingMode::Automatic),
            1 => Ok(SeedingMode::Manual),
            _ => Err(QueryError::Column("seeding_mode")),
        }
    }
}

async fn one_row(
    db: &mut SqlClient,
    sql: &'static str,
    ag_name: &str,
) -> Result<tiberius::Row, QueryError> {
    let mut query = Query::new(sql);
    query.bind(ag_name);
    query
        .query(db)
        .await?
        .into_row()
        .await?
        .ok_or(QueryError::NoRows)
}

/// Role of the local replica, with the server's textual description.
pub async fn get_role(db: &mut SqlClient, ag_name: &str) -> Result<(Role, String), QueryError> {
    let row = one_row(
        db,
        "SELECT ars.role, ars.role_desc
         FROM
             sys.availability_groups ag
             INNER JOIN sys.dm_hadr_availability_replica_states ars ON ars.group_id = ag.group_id AND ars.is_local = 1
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    let role: u8 = row.try_get(0)?.ok_or(QueryError::Column("role"))?;
    let role_desc: &str = row.try_get(1)?.ok_or(QueryError::Column("role_desc"))?;
    Ok((Role::try_from(role)?, role_desc.to_string()))
}

/// Availability mode of the local replica, with the server's textual
/// description.
pub async fn get_availability_mode(
    db: &mut SqlClient,
    ag_name: &str,
) -> Result<(AvailabilityMode, String), QueryError> {
    let row = one_row(
        db,
        "SELECT ar.availability_mode, ar.availability_mode_desc
         FROM
             sys.availability_groups ag
             INNER JOIN sys.dm_hadr_availability_replica_states ars ON ars.group_id = ag.group_id AND ars.is_local = 1
             INNER JOIN sys.availability_replicas ar ON ar.replica_id = ars.replica_id
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    let mode: u8 = row
        .try_get(0)?
        .ok_or(QueryError::Column("availability_mode"))?;
    let mode_desc: &str = row
        .try_get(1)?
        .ok_or(QueryError::Column("availability_mode_desc"))?;
    Ok((AvailabilityMode::try_from(mode)?, mode_desc.to_string()))
}

/// Seeding mode of the local replica, with the server's textual
/// description.
pub async fn get_seeding_mode(
    db: &mut SqlClient,
    ag_name: &str,
) -> Result<(SeedingMode, String), QueryError> {
    let row = one_row(
        db,
        "SELECT ar.seeding_mode, ar.seeding_mode_desc
         FROM
             sys.availability_groups ag
             INNER JOIN sys.dm_hadr_availability_replica_states ars ON ars.group_id = ag.group_id AND ars.is_local = 1
             INNER JOIN sys.availability_replicas ar ON ar.replica_id = ars.replica_id
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    let mode: u8 = row.try_get(0)?.ok_or(QueryError::Column("seeding_mode"))?;
    let mode_desc: &str = row
        .try_get(1)?
        .ok_or(QueryError::Column("seeding_mode_desc"))?;
    Ok((SeedingMode::try_from(mode)?, mode_desc.to_string()))
}

/// Name of the local replica of the AG.
pub async fn get_current_replica_name(
    db: &mut SqlClient,
    ag_name: &str,
) -> Result<String, QueryError> {
    let row = one_row(
        db,
        "SELECT ar.replica_server_name
         FROM
             sys.availability_groups ag
             INNER JOIN sys.dm_hadr_availability_replica_states ars ON ars.group_id = ag.group_id AND ars.is_local = 1
             INNER JOIN sys.availability_replicas ar ON ar.replica_id = ars.replica_id
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    let name: &str = row
        .try_get(0)?
        .ok_or(QueryError::Column("replica_server_name"))?;
    Ok(name.to_string())
}

/// Name of the AG's current primary replica.
pub async fn get_primary_replica_name(
    db: &mut SqlClient,
    ag_name: &str,
) -> Result<String, QueryError> {
    let row = one_row(
        db,
        "SELECT ags.primary_replica
         FROM
             sys.availability_groups ag
             INNER JOIN sys.dm_hadr_availability_group_states ags ON ags.group_id = ag.group_id
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    let name: &str = row.try_get(0)?.ok_or(QueryError::Column("primary_replica"))?;
    Ok(name.to_string())
}

/// The AG's DB_FAILOVER setting: `true` means ON.
pub async fn get_db_failover_mode(db: &mut SqlClient, ag_name: &str) -> Result<bool, QueryError> {
    let row = one_row(
        db,
        "SELECT ag.db_failover
         FROM
             sys.availability_groups ag
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    row.try_get(0)?.ok_or(QueryError::Column("db_failover"))
}

/// The local replica's configuration sequence number. Incremented by the
/// server on every AG configuration change.
pub async fn get_sequence_number(db: &mut SqlClient, ag_name: &str) -> Result<i64, QueryError> {
    let row = one_row(
        db,
        "SELECT ag.sequence_number
         FROM
             sys.availability_groups ag
         WHERE
             ag.name = @P1",
        ag_name,
    )
    .await?;

    row.try_get(0)?.ok_or(QueryError::Column("sequence_number"))
}

/// Number of SYNCHRONOUS_COMMIT replicas in the AG.
pub async fn get_num_sync_commit_replicas(
    db: &mut SqlClient,
    ag_name: &str,
) -> Result<u32, QueryError> {
    let mut query = Query::new(
        "SELECT COUNT(*)
         FROM
             sys.availability_replicas ar
             INNER JOIN sys.availability_groups ag ON ar.group_id = ag.group_id
         WHERE ag.name = @P1 AND ar.availability_mode = @P2",
    );
    query.bind(ag_name);
    query.bind(i32::from(AvailabilityMode::SynchronousCommit.value()));

    let row = query
        .query(db)
        .await?
        .into_row()
        .await?
        .ok_or(QueryError::NoRows)?;
    let count: i32 = row.try_get(0)?.ok_or(QueryError::Column("count"))?;
    u32::try_from(count).map_err(|_| QueryError::Column("count"))
}

/// Summary of databases in the AG that are not ONLINE, one
/// `<count> databases are <state>` clause per state joined with `", "`.
/// Empty when everything is ONLINE.
pub async fn get_database_states(db: &mut SqlClient, ag_name: &str) -> Result<String, QueryError> {
    let mut query = Query::new(
        "SELECT d.state, d.state_desc, COUNT(*) FROM
             sys.availability_groups ag
             INNER JOIN sys.dm_hadr_database_replica_states drs ON drs.group_id = ag.group_id AND drs.is_local = 1
             INNER JOIN sys.databases d ON d.database_id = drs.database_id
         WHERE
             ag.name = @P1 AND d.state <> 0
         GROUP BY d.state, d.state_desc",
    );
    query.bind(ag_name);

    let rows = query.query(db).await?.into_first_result().await?;

    let mut clauses = Vec::new();
    for row in rows {
        let state_desc: &str = row.try_get(1)?.ok_or(QueryError::Column("state_desc"))?;
        let count: i32 = row.try_get(2)?.ok_or(QueryError::Column("count"))?;
        clauses.push(format!("{count} databases are {state_desc}"));
    }

    Ok(clauses.join(", "))
}

/// `ALTER AVAILABILITY GROUP … SET (ROLE = SECONDARY)`.
pub async fn set_role_to_secondary(db: &mut SqlClient, ag_name: &str) -> Result<(), QueryError> {
    exec_ddl(
        db,
        format!(
            "ALTER AVAILABILITY GROUP {} SET (ROLE = SECONDARY)",
            quote_name(ag_name)
        ),
    )
    .await
}

/// `ALTER AVAILABILITY GROUP … FAILOVER`.
pub async fn failover(db: &mut SqlClient, ag_name: &str) -> Result<(), QueryError> {
    exec_ddl(
        db,
        format!("ALTER AVAILABILITY GROUP {} FAILOVER", quote_name(ag_name)),
    )
    .await
}

/// `ALTER AVAILABILITY GROUP … FORCE_FAILOVER_ALLOW_DATA_LOSS`.
pub async fn force_failover(db: &mut SqlClient, ag_name: &str) -> Result<(), QueryError> {
    exec_ddl(
        db,
        format!(
            "ALTER AVAILABILITY GROUP {} FORCE_FAILOVER_ALLOW_DATA_LOSS",
            quote_name(ag_name)
        ),
    )
    .await
}

/// `DROP AVAILABILITY GROUP …`.
pub async fn drop_availability_group(db: &mut SqlClient, ag_name: &str) -> Result<(), QueryError> {
    exec_ddl(db, format!("DROP AVAILABILITY GROUP {}", quote_name(ag_name))).await
}

/// Grant the replica permission to create databases of the AG it is
/// missing.
pub async fn grant_create_any_database(
    db: &mut SqlClient,
    ag_name: &str,
) -> Result<(), QueryError> {
    exec_ddl(
        db,
        format!(
            "ALTER AVAILABILITY GROUP {} GRANT CREATE ANY DATABASE",
            quote_name(ag_name)
        ),
    )
    .await
}

/// Set REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT, but only when the AG
/// does not already carry the value: the guard keeps repeated
/// reconciliation from issuing no-op ALTERs.
pub async fn set_required_synchronized_secondaries_to_commit(
    db: &mut SqlClient,
    ag_name: &str,
    new_value: i32,
) -> Result<(), QueryError> {
    let mut query = Query::new(rsstc_update_batch(ag_name, new_value));
    query.bind(ag_name);
    query.bind(new_value);
    query.execute(db).await?;
    Ok(())
}

fn rsstc_update_batch(ag_name: &str, new_value: i32) -> String {
    format!(
        "DECLARE @num_ags INT;
         SELECT @num_ags = COUNT(*) FROM sys.availability_groups WHERE name = @P1 AND required_synchronized_secondaries_to_commit = @P2;
         IF @num_ags = 0
             ALTER AVAILABILITY GROUP {} SET (REQUIRED_SYNCHRONIZED_SECONDARIES_TO_COMMIT = {})
         ;",
        quote_name(ag_name),
        new_value
    )
}

async fn exec_ddl(db: &mut SqlClient, sql: String) -> Result<(), QueryError> {
    db.simple_query(sql).await?.into_results().await?;
    Ok(())
}

/// Equivalent of T-SQL `QUOTENAME` with `[` as the quote character.
pub fn quote_name(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}
