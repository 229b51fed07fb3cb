//! Database connection, TLS support, advisory locking, and block execution.

use std::future::Future;

use tokio_postgres::Client;

use crate::config::{DatabaseConfig, SslMode};
use crate::error::{DriftError, Result};

/// Quote a SQL identifier.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Used for the configured history table, which is interpolated into DDL.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DriftError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DriftError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// PostgreSQL server version, as reported by `server_version_num`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode `server_version_num` (e.g. `90605` or `120005`).
    pub fn from_version_num(num: u32) -> Self {
        if num >= 100_000 {
            Self::new(num / 10_000, num % 10_000)
        } else {
            Self::new(num / 10_000, (num / 100) % 100)
        }
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Read the server version of a connected database.
pub async fn server_version(client: &Client) -> Result<ServerVersion> {
    let row = client
        .query_one("SHOW server_version_num", &[])
        .await
        .map_err(|e| DriftError::introspection("server version", e))?;
    let raw: String = row.get(0);
    let num = raw.trim().parse::<u32>().map_err(|_| DriftError::IntrospectionError {
        object: "server version".to_string(),
        reason: format!("unexpected server_version_num '{}'", raw),
    })?;
    Ok(ServerVersion::from_version_num(num))
}

/// Session settings that shape the text form of dates, times, intervals and floats.
pub const TEXT_OUTPUT_SETTINGS: &str = "SET TimeZone = 'UTC'; \
     SET DateStyle = 'ISO, YMD'; \
     SET IntervalStyle = 'postgres'; \
     SET extra_float_digits = 3";

/// Pin the session's output formats so both sides render equal values as equal text.
pub async fn pin_text_output(client: &Client) -> Result<()> {
    client
        .batch_execute(TEXT_OUTPUT_SETTINGS)
        .await
        .map_err(|e| DriftError::introspection("session settings", e))
}

/// Build a rustls ClientConfig using the Mozilla CA bundle.
fn make_rustls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Authentication failures are permanent and never retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

fn spawn_connection<F>(connection: F)
where
    F: Future<Output = std::result::Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "Database connection error");
        }
    });
}

async fn connect_once(
    conn_string: &str,
    ssl_mode: &SslMode,
    connect_timeout_secs: u32,
) -> std::result::Result<Client, tokio_postgres::Error> {
    let connect_fut = async {
        match ssl_mode {
            SslMode::Disable => {
                let (client, connection) =
                    tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                spawn_connection(connection);
                Ok(client)
            }
            SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config());
                let (client, connection) = tokio_postgres::connect(conn_string, tls).await?;
                spawn_connection(connection);
                Ok(client)
            }
            SslMode::Prefer => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config());
                match tokio_postgres::connect(conn_string, tls).await {
                    Ok((client, connection)) => {
                        spawn_connection(connection);
                        Ok(client)
                    }
                    Err(_) => {
                        tracing::debug!("TLS connection failed, falling back to plaintext");
                        let (client, connection) =
                            tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                        spawn_connection(connection);
                        Ok(client)
                    }
                }
            }
        }
    };

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(
            std::time::Duration::from_secs(connect_timeout_secs as u64),
            connect_fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(tokio_postgres::Error::__private_api_timeout()),
        }
    } else {
        connect_fut.await
    }
}

/// Connect with default settings (TLS preferred, no retries).
pub async fn connect(conn_string: &str) -> Result<Client> {
    connect_with_config(conn_string, &SslMode::Prefer, 0, 30, 0).await
}

/// Connect one side of the comparison using its configuration.
pub async fn connect_database(config: &DatabaseConfig, side: &str) -> Result<Client> {
    let conn_string = config.connection_string(side)?;
    tracing::debug!(side, "Connecting");
    connect_with_config(
        &conn_string,
        &config.ssl_mode,
        config.connect_retries,
        config.connect_timeout_secs,
        config.statement_timeout_secs,
    )
    .await
}

/// Connect to the database, retrying up to `retries` times with exponential backoff + jitter.
///
/// Each retry waits `min(2^attempt, 30)s + rand(0..1000ms)` before the next attempt.
pub async fn connect_with_config(
    conn_string: &str,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
    statement_timeout_secs: u32,
) -> Result<Client> {
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt.min(5), 30);
            let delay = std::time::Duration::from_secs(base_delay)
                + std::time::Duration::from_millis(fastrand::u64(0..1000));
            tracing::info!(
                attempt = attempt + 1,
                max_attempts = retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match connect_once(conn_string, ssl_mode, connect_timeout_secs).await {
            Ok(client) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Connected successfully after retry");
                }
                if statement_timeout_secs > 0 {
                    let timeout_sql =
                        format!("SET statement_timeout = '{}s'", statement_timeout_secs);
                    client.batch_execute(&timeout_sql).await?;
                }
                return Ok(client);
            }
            Err(e) => {
                if is_permanent_error(&e) {
                    tracing::error!(error = %e, "Permanent connection error, not retrying");
                    return Err(DriftError::DatabaseError(e));
                }
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(DriftError::DatabaseError(e)),
        None => Err(DriftError::ConfigError("No connection attempt was made".to_string())),
    }
}

/// Take the session-level advisory lock guarding the history table.
pub async fn acquire_advisory_lock(client: &Client, table_name: &str) -> Result<()> {
    let lock_id = advisory_lock_id(table_name);
    tracing::info!(lock_id, table = %table_name, "Acquiring advisory lock");

    client
        .execute("SELECT pg_advisory_lock($1)", &[&lock_id])
        .await
        .map_err(|e| DriftError::LockError(crate::error::format_db_error(&e)))?;
    Ok(())
}

pub async fn release_advisory_lock(client: &Client, table_name: &str) -> Result<()> {
    let lock_id = advisory_lock_id(table_name);
    tracing::debug!(lock_id, table = %table_name, "Releasing advisory lock");

    client
        .execute("SELECT pg_advisory_unlock($1)", &[&lock_id])
        .await
        .map_err(|e| DriftError::LockError(crate::error::format_db_error(&e)))?;
    Ok(())
}

/// Stable lock id across builds; CRC32 of the qualified table name.
fn advisory_lock_id(table_name: &str) -> i64 {
    crc32fast::hash(table_name.as_bytes()) as i64
}

/// Execute a statement block inside BEGIN/COMMIT, rolling back on failure.
/// Returns the execution time in milliseconds.
pub async fn execute_in_transaction(client: &Client, sql: &str) -> Result<i32> {
    let start = std::time::Instant::now();

    client.batch_execute("BEGIN").await?;

    match client.batch_execute(sql).await {
        Ok(()) => {
            client.batch_execute("COMMIT").await?;
        }
        Err(e) => {
            if let Err(rollback_err) = client.batch_execute("ROLLBACK").await {
                tracing::warn!(error = %rollback_err, "Failed to rollback transaction");
            }
            return Err(DriftError::DatabaseError(e));
        }
    }

    Ok(start.elapsed().as_millis() as i32)
}
