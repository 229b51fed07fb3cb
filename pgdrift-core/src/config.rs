use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DriftError, Result};
use crate::snapshot::QualifiedName;

/// SSL/TLS connection mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Try TLS first, fall back to plaintext.
    #[default]
    Prefer,
    /// Require TLS, fail if the handshake fails.
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = DriftError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" | "required" => Ok(SslMode::Require),
            _ => Err(DriftError::ConfigError(format!(
                "Invalid SSL mode '{}'. Use 'disable', 'prefer', or 'require'.",
                s
            ))),
        }
    }
}

/// Top-level configuration, immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct DriftConfig {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
    pub compare: CompareSettings,
    pub migration: MigrationSettings,
}

/// Connection settings for one side of the comparison.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub application_name: String,
    pub connect_retries: u32,
    pub ssl_mode: SslMode,
    pub connect_timeout_secs: u32,
    pub statement_timeout_secs: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            application_name: "pgdrift".to_string(),
            connect_retries: 0,
            ssl_mode: SslMode::Prefer,
            connect_timeout_secs: 30,
            statement_timeout_secs: 0,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("connect_retries", &self.connect_retries)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    /// Build a connection string for this side.
    ///
    /// Prefers `url` if set; otherwise builds a key/value string from the
    /// individual fields. `side` only appears in error messages.
    pub fn connection_string(&self, side: &str) -> Result<String> {
        if let Some(ref url) = self.url {
            return Ok(with_application_name(url, &self.application_name));
        }

        let host = self.host.as_deref().unwrap_or("localhost");
        let port = self.port.unwrap_or(5432);
        let user = self.user.as_deref().ok_or_else(|| {
            DriftError::ConfigError(format!("Database user is required for {}", side))
        })?;
        let database = self.database.as_deref().ok_or_else(|| {
            DriftError::ConfigError(format!("Database name is required for {}", side))
        })?;

        let mut conn = format!("host={} port={} user={} dbname={}", host, port, user, database);
        if let Some(ref password) = self.password {
            conn.push_str(&format!(" password={}", password));
        }
        Ok(with_application_name(&conn, &self.application_name))
    }
}

fn with_application_name(conn: &str, application_name: &str) -> String {
    if application_name.is_empty() || conn.contains("application_name") {
        return conn.to_string();
    }
    if conn.contains("://") {
        let sep = if conn.contains('?') { '&' } else { '?' };
        format!("{}{}application_name={}", conn, sep, application_name)
    } else {
        format!("{} application_name={}", conn, application_name)
    }
}

/// Settings for the compare command.
#[derive(Debug, Clone)]
pub struct CompareSettings {
    pub author: Option<String>,
    pub author_from_git: bool,
    pub output_directory: PathBuf,
    pub schema: SchemaCompareSettings,
    pub data: DataCompareSettings,
}

impl Default for CompareSettings {
    fn default() -> Self {
        Self {
            author: None,
            author_from_git: false,
            output_directory: PathBuf::from("patches"),
            schema: SchemaCompareSettings::default(),
            data: DataCompareSettings::default(),
        }
    }
}

/// Structural comparison options.
#[derive(Debug, Clone)]
pub struct SchemaCompareSettings {
    /// Schemas to compare. Empty means every non-system schema.
    pub namespaces: Vec<String>,
    pub idempotent_script: bool,
    /// Roles whose privileges are compared. Empty means all roles.
    pub roles: Vec<String>,
    pub drop_missing_table: bool,
    pub drop_missing_view: bool,
    pub drop_missing_function: bool,
}

impl Default for SchemaCompareSettings {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            idempotent_script: true,
            roles: Vec::new(),
            drop_missing_table: false,
            drop_missing_view: false,
            drop_missing_function: false,
        }
    }
}

/// Record comparison options.
#[derive(Debug, Clone, Default)]
pub struct DataCompareSettings {
    pub enable: bool,
    pub tables: Vec<TableCompareConfig>,
}

/// A table whose rows are synchronized, matched on `key_fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCompareConfig {
    pub table_name: String,
    pub table_schema: String,
    pub key_fields: Vec<String>,
}

impl TableCompareConfig {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.table_schema, &self.table_name)
    }
}

/// Patch application settings.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub history_table_schema: String,
    pub history_table_name: String,
    pub patches_directory: PathBuf,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            history_table_schema: "public".to_string(),
            history_table_name: "migrations".to_string(),
            patches_directory: PathBuf::from("patches"),
        }
    }
}

// ── TOML deserialization structs ──

#[derive(Deserialize, Default)]
struct TomlConfig {
    source: Option<TomlDatabaseConfig>,
    target: Option<TomlDatabaseConfig>,
    compare: Option<TomlCompareSettings>,
    migration: Option<TomlMigrationSettings>,
}

#[derive(Deserialize, Default)]
struct TomlDatabaseConfig {
    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    application_name: Option<String>,
    connect_retries: Option<u32>,
    ssl_mode: Option<String>,
    connect_timeout: Option<u32>,
    statement_timeout: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TomlCompareSettings {
    author: Option<String>,
    author_from_git: Option<bool>,
    output_directory: Option<String>,
    schema: Option<TomlSchemaCompare>,
    data: Option<TomlDataCompare>,
}

#[derive(Deserialize, Default)]
struct TomlSchemaCompare {
    namespaces: Option<Vec<String>>,
    idempotent_script: Option<bool>,
    roles: Option<Vec<String>>,
    drop_missing_table: Option<bool>,
    drop_missing_view: Option<bool>,
    drop_missing_function: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TomlDataCompare {
    enable: Option<bool>,
    tables: Option<Vec<TomlTableCompare>>,
}

#[derive(Deserialize)]
struct TomlTableCompare {
    table_name: String,
    table_schema: Option<String>,
    table_key_fields: Vec<String>,
}

#[derive(Deserialize, Default)]
struct TomlMigrationSettings {
    history_table_schema: Option<String>,
    history_table_name: Option<String>,
    patches_directory: Option<String>,
}

/// CLI overrides that take highest priority.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub source_url: Option<String>,
    pub target_url: Option<String>,
    pub patches_directory: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub history_table_schema: Option<String>,
    pub history_table_name: Option<String>,
    pub connect_retries: Option<u32>,
    pub ssl_mode: Option<String>,
    pub connect_timeout: Option<u32>,
    pub statement_timeout: Option<u32>,
}

impl DriftConfig {
    /// Load configuration with the following priority (highest wins):
    /// 1. CLI arguments
    /// 2. Environment variables
    /// 3. TOML config file
    /// 4. Built-in defaults
    pub fn load(config_path: Option<&str>, overrides: &CliOverrides) -> Result<Self> {
        let mut config = DriftConfig::default();

        let toml_path = config_path.unwrap_or("pgdrift.toml");
        if let Ok(content) = std::fs::read_to_string(toml_path) {
            #[cfg(unix)]
            warn_if_world_readable(Path::new(toml_path));

            let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
                DriftError::ConfigError(format!(
                    "Failed to parse config file '{}': {}",
                    toml_path, e
                ))
            })?;
            config.apply_toml(toml_config);
        } else if config_path.is_some() {
            return Err(DriftError::ConfigError(format!(
                "Config file '{}' not found",
                toml_path
            )));
        }

        config.apply_env();
        config.apply_cli(overrides);
        config.validate()?;

        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        crate::db::validate_identifier(&self.migration.history_table_schema)?;
        crate::db::validate_identifier(&self.migration.history_table_name)?;

        for table in &self.compare.data.tables {
            if table.key_fields.is_empty() {
                return Err(DriftError::ConfigError(format!(
                    "Table {} needs at least one key field for data comparison",
                    table.qualified_name()
                )));
            }
        }

        for db in [&mut self.source, &mut self.target] {
            if db.connect_retries > 20 {
                db.connect_retries = 20;
                tracing::warn!("connect_retries capped at 20");
            }
        }
        Ok(())
    }

    fn apply_toml(&mut self, toml: TomlConfig) {
        if let Some(db) = toml.source {
            apply_toml_database(&mut self.source, db);
        }
        if let Some(db) = toml.target {
            apply_toml_database(&mut self.target, db);
        }

        if let Some(c) = toml.compare {
            if let Some(v) = c.author { self.compare.author = Some(v); }
            if let Some(v) = c.author_from_git { self.compare.author_from_git = v; }
            if let Some(v) = c.output_directory { self.compare.output_directory = PathBuf::from(v); }

            if let Some(s) = c.schema {
                let schema = &mut self.compare.schema;
                if let Some(v) = s.namespaces { schema.namespaces = v; }
                if let Some(v) = s.idempotent_script { schema.idempotent_script = v; }
                if let Some(v) = s.roles { schema.roles = v; }
                if let Some(v) = s.drop_missing_table { schema.drop_missing_table = v; }
                if let Some(v) = s.drop_missing_view { schema.drop_missing_view = v; }
                if let Some(v) = s.drop_missing_function { schema.drop_missing_function = v; }
            }

            if let Some(d) = c.data {
                if let Some(v) = d.enable { self.compare.data.enable = v; }
                if let Some(tables) = d.tables {
                    self.compare.data.tables = tables
                        .into_iter()
                        .map(|t| TableCompareConfig {
                            table_name: t.table_name,
                            table_schema: t.table_schema.unwrap_or_else(|| "public".to_string()),
                            key_fields: t.table_key_fields,
                        })
                        .collect();
                }
            }
        }

        if let Some(m) = toml.migration {
            if let Some(v) = m.history_table_schema { self.migration.history_table_schema = v; }
            if let Some(v) = m.history_table_name { self.migration.history_table_name = v; }
            if let Some(v) = m.patches_directory { self.migration.patches_directory = PathBuf::from(v); }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PGDRIFT_SOURCE_URL") {
            self.source.url = Some(v);
        }
        if let Ok(v) = std::env::var("PGDRIFT_TARGET_URL") {
            self.target.url = Some(v);
        }
        if let Ok(v) = std::env::var("PGDRIFT_SSL_MODE") {
            if let Ok(mode) = v.parse::<SslMode>() {
                self.source.ssl_mode = mode.clone();
                self.target.ssl_mode = mode;
            }
        }
        if let Ok(v) = std::env::var("PGDRIFT_CONNECT_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.source.connect_retries = n;
                self.target.connect_retries = n;
            }
        }
        if let Ok(v) = std::env::var("PGDRIFT_PATCHES_DIRECTORY") {
            self.migration.patches_directory = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PGDRIFT_OUTPUT_DIRECTORY") {
            self.compare.output_directory = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PGDRIFT_HISTORY_TABLE_SCHEMA") {
            self.migration.history_table_schema = v;
        }
        if let Ok(v) = std::env::var("PGDRIFT_HISTORY_TABLE_NAME") {
            self.migration.history_table_name = v;
        }
        if let Ok(v) = std::env::var("PGDRIFT_AUTHOR") {
            self.compare.author = Some(v);
        }
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(ref v) = overrides.source_url {
            self.source.url = Some(v.clone());
        }
        if let Some(ref v) = overrides.target_url {
            self.target.url = Some(v.clone());
        }
        if let Some(ref v) = overrides.patches_directory {
            self.migration.patches_directory = v.clone();
        }
        if let Some(ref v) = overrides.output_directory {
            self.compare.output_directory = v.clone();
        }
        if let Some(ref v) = overrides.history_table_schema {
            self.migration.history_table_schema = v.clone();
        }
        if let Some(ref v) = overrides.history_table_name {
            self.migration.history_table_name = v.clone();
        }
        for db in [&mut self.source, &mut self.target] {
            if let Some(v) = overrides.connect_retries {
                db.connect_retries = v;
            }
            if let Some(ref v) = overrides.ssl_mode {
                if let Ok(mode) = v.parse() {
                    db.ssl_mode = mode;
                }
            }
            if let Some(v) = overrides.connect_timeout {
                db.connect_timeout_secs = v;
            }
            if let Some(v) = overrides.statement_timeout {
                db.statement_timeout_secs = v;
            }
        }
    }
}

fn apply_toml_database(target: &mut DatabaseConfig, db: TomlDatabaseConfig) {
    if let Some(v) = db.url { target.url = Some(v); }
    if let Some(v) = db.host { target.host = Some(v); }
    if let Some(v) = db.port { target.port = Some(v); }
    if let Some(v) = db.user { target.user = Some(v); }
    if let Some(v) = db.password { target.password = Some(v); }
    if let Some(v) = db.database { target.database = Some(v); }
    if let Some(v) = db.application_name { target.application_name = v; }
    if let Some(v) = db.connect_retries { target.connect_retries = v; }
    if let Some(v) = db.ssl_mode {
        if let Ok(mode) = v.parse() {
            target.ssl_mode = mode;
        }
    }
    if let Some(v) = db.connect_timeout { target.connect_timeout_secs = v; }
    if let Some(v) = db.statement_timeout { target.statement_timeout_secs = v; }
}

/// The config file holds passwords; warn when group or others can read it.
#[cfg(unix)]
fn warn_if_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{:o}", mode),
                "Config file has overly permissive permissions. Consider chmod 600."
            );
        }
    }
}
