//! Patch history table and the store the migration engine runs against.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_postgres::Client;

use crate::db::{execute_in_transaction, quote_ident};
use crate::error::{DriftError, Result};

/// Lifecycle of a patch: `TODO → WIP → DONE`, with `WIP → ERROR` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PatchStatus {
    Todo,
    Wip,
    Done,
    Error,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStatus::Todo => "TODO",
            PatchStatus::Wip => "WIP",
            PatchStatus::Done => "DONE",
            PatchStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchStatus {
    type Err = DriftError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "TODO" => Ok(PatchStatus::Todo),
            "WIP" => Ok(PatchStatus::Wip),
            "DONE" => Ok(PatchStatus::Done),
            "ERROR" => Ok(PatchStatus::Error),
            other => Err(DriftError::IntegrityError(format!(
                "Unknown patch status '{}' in history table",
                other
            ))),
        }
    }
}

/// A row from the history table.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRecord {
    pub version: String,
    pub name: String,
    pub status: PatchStatus,
    pub last_message: Option<String>,
    pub script: Option<String>,
    pub applied_on: Option<NaiveDateTime>,
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Create the history table if it does not exist.
pub async fn create_history_table(client: &Client, schema: &str, table: &str) -> Result<()> {
    let sql = format!(
        r#"
CREATE TABLE IF NOT EXISTS {fq} (
    "version"      VARCHAR(17) NOT NULL,
    "name"         VARCHAR NOT NULL,
    "status"       VARCHAR(5) NOT NULL DEFAULT '',
    "last_message" VARCHAR NULL,
    "script"       VARCHAR NOT NULL DEFAULT '',
    "applied_on"   TIMESTAMP NULL,
    CONSTRAINT {pkey} PRIMARY KEY ("version")
);
"#,
        fq = qualified(schema, table),
        pkey = quote_ident(&format!("{}_pkey", table)),
    );

    client.batch_execute(&sql).await?;
    Ok(())
}

pub async fn history_table_exists(client: &Client, schema: &str, table: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )",
            &[&schema, &table],
        )
        .await?;

    Ok(row.get::<_, bool>(0))
}

fn record_from_row(row: &tokio_postgres::Row) -> Result<PatchRecord> {
    Ok(PatchRecord {
        version: row.get(0),
        name: row.get(1),
        status: row.get::<_, String>(2).parse()?,
        last_message: row.get(3),
        script: row.get(4),
        applied_on: row.get(5),
    })
}

/// History rows matching a patch. More than one means the table is corrupt.
pub async fn find_patch_records(
    client: &Client,
    schema: &str,
    table: &str,
    version: &str,
    name: &str,
) -> Result<Vec<PatchRecord>> {
    let sql = format!(
        "SELECT \"version\", \"name\", \"status\", \"last_message\", \"script\", \"applied_on\" \
         FROM {} WHERE \"version\" = $1 AND \"name\" = $2",
        qualified(schema, table)
    );
    let rows = client.query(&sql, &[&version, &name]).await?;
    rows.iter().map(record_from_row).collect()
}

/// Every history row, oldest version first.
pub async fn get_all_records(client: &Client, schema: &str, table: &str) -> Result<Vec<PatchRecord>> {
    let sql = format!(
        "SELECT \"version\", \"name\", \"status\", \"last_message\", \"script\", \"applied_on\" \
         FROM {} ORDER BY \"version\"",
        qualified(schema, table)
    );
    let rows = client.query(&sql, &[]).await?;
    rows.iter().map(record_from_row).collect()
}

/// Register a patch as `TODO` unless its version is already known.
///
/// A version already registered under another name is a conflict.
pub async fn register_patch(
    client: &Client,
    schema: &str,
    table: &str,
    version: &str,
    name: &str,
) -> Result<()> {
    let fq = qualified(schema, table);
    let sql = format!(
        "INSERT INTO {fq} (\"version\", \"name\", \"status\", \"last_message\", \"script\", \"applied_on\") \
         VALUES ($1, $2, $3, '', '', NULL) \
         ON CONFLICT (\"version\") DO NOTHING",
        fq = fq,
    );
    client
        .execute(&sql, &[&version, &name, &PatchStatus::Todo.as_str()])
        .await?;

    let sql = format!("SELECT \"name\" FROM {} WHERE \"version\" = $1", fq);
    let row = client.query_one(&sql, &[&version]).await?;
    let registered: String = row.get(0);
    check_registration(version, name, &registered)
}

fn check_registration(version: &str, name: &str, registered: &str) -> Result<()> {
    if registered != name {
        return Err(DriftError::IntegrityError(format!(
            "Patch version {} is already registered with name '{}', not '{}'",
            version, registered, name
        )));
    }
    Ok(())
}

/// Move a patch to `status`, stamping `applied_on`.
pub async fn update_status(
    client: &Client,
    schema: &str,
    table: &str,
    version: &str,
    status: PatchStatus,
    message: &str,
    script: &str,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET \"status\" = $1, \"last_message\" = $2, \"script\" = $3, \
         \"applied_on\" = LOCALTIMESTAMP WHERE \"version\" = $4",
        qualified(schema, table)
    );
    client
        .execute(&sql, &[&status.as_str(), &message, &script, &version])
        .await?;
    Ok(())
}

/// Persistence and execution seam of the migration engine.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Create the history table if needed.
    async fn prepare(&self) -> Result<()>;

    async fn find(&self, version: &str, name: &str) -> Result<Vec<PatchRecord>>;

    async fn register(&self, version: &str, name: &str) -> Result<()>;

    async fn update_status(
        &self,
        version: &str,
        status: PatchStatus,
        message: &str,
        script: &str,
    ) -> Result<()>;

    /// Run one statement block against the migrated database.
    async fn execute(&self, sql: &str) -> Result<()>;
}

/// The history table of a live database, with blocks run on the same connection.
pub struct PgMigrationStore<'a> {
    client: &'a Client,
    schema: String,
    table: String,
}

impl<'a> PgMigrationStore<'a> {
    pub fn new(client: &'a Client, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore<'_> {
    async fn prepare(&self) -> Result<()> {
        if !history_table_exists(self.client, &self.schema, &self.table).await? {
            tracing::info!(schema = %self.schema, table = %self.table, "Creating history table");
            create_history_table(self.client, &self.schema, &self.table).await?;
        }
        Ok(())
    }

    async fn find(&self, version: &str, name: &str) -> Result<Vec<PatchRecord>> {
        find_patch_records(self.client, &self.schema, &self.table, version, name).await
    }

    async fn register(&self, version: &str, name: &str) -> Result<()> {
        register_patch(self.client, &self.schema, &self.table, version, name).await
    }

    async fn update_status(
        &self,
        version: &str,
        status: PatchStatus,
        message: &str,
        script: &str,
    ) -> Result<()> {
        update_status(
            self.client,
            &self.schema,
            &self.table,
            version,
            status,
            message,
            script,
        )
        .await
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let elapsed = execute_in_transaction(self.client, sql).await?;
        tracing::debug!(elapsed_ms = elapsed, "Block executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            PatchStatus::Todo,
            PatchStatus::Wip,
            PatchStatus::Done,
            PatchStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<PatchStatus>().unwrap(), status);
        }
        assert_eq!("DONE ".parse::<PatchStatus>().unwrap(), PatchStatus::Done);
        assert!("done?".parse::<PatchStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serialized(PatchStatus::Wip), "WIP");
    }

    fn serialized(status: PatchStatus) -> String {
        // The CLI emits statuses through serde; the rename must match Display.
        toml::Value::try_from(std::collections::BTreeMap::from([("s", status)]))
            .unwrap()
            .get("s")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap()
    }

    #[test]
    fn test_conflicting_registration() {
        assert!(check_registration("1", "init", "init").is_ok());
        let err = check_registration("1", "init", "other").unwrap_err();
        assert!(matches!(err, DriftError::IntegrityError(ref m) if m.contains("'other'")));
    }
}
