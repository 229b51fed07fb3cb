pub mod catalog;
pub mod change;
pub mod commands;
pub mod config;
pub mod data_diff;
pub mod db;
pub mod emit;
pub mod error;
pub mod history;
pub mod patch;
pub mod progress;
pub mod records;
pub mod schema_diff;
pub mod snapshot;

use std::fmt;

use config::DriftConfig;
use error::{DriftError, Result};
use progress::ProgressSink;
use tokio_postgres::Client;

pub use commands::compare::CompareReport;
pub use commands::info::PatchInfo;
pub use commands::migrate::{MigrateDetail, MigrateReport};
pub use commands::save::SaveReport;
pub use config::CliOverrides;
pub use history::PatchStatus;

/// One of the two compared databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Target => "target",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main entry point for the pgdrift library.
///
/// Create a `PgDrift` instance with a config and the sides a command needs,
/// then call its methods to compare databases or apply patches.
pub struct PgDrift {
    pub config: DriftConfig,
    source: Option<Client>,
    target: Option<Client>,
}

impl PgDrift {
    /// Connect to the requested sides concurrently.
    ///
    /// If `connect_retries` is configured, each side retries with exponential backoff.
    pub async fn new(config: DriftConfig, sides: &[Side]) -> Result<Self> {
        let wants = |side| sides.contains(&side);
        let (source, target) = tokio::try_join!(
            async {
                if wants(Side::Source) {
                    db::connect_database(&config.source, Side::Source.as_str())
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
            async {
                if wants(Side::Target) {
                    db::connect_database(&config.target, Side::Target.as_str())
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
        )?;
        Ok(Self {
            config,
            source,
            target,
        })
    }

    /// Create an instance over existing connections.
    pub fn with_clients(config: DriftConfig, source: Option<Client>, target: Option<Client>) -> Self {
        Self {
            config,
            source,
            target,
        }
    }

    fn client(&self, side: Side) -> Result<&Client> {
        let client = match side {
            Side::Source => self.source.as_ref(),
            Side::Target => self.target.as_ref(),
        };
        client.ok_or_else(|| DriftError::ConfigError(format!("No {} connection was opened", side)))
    }

    /// Diff SOURCE against TARGET and write a patch called `name`.
    pub async fn compare(&self, name: &str, progress: &dyn ProgressSink) -> Result<CompareReport> {
        commands::compare::execute(
            self.client(Side::Source)?,
            self.client(Side::Target)?,
            &self.config.compare,
            name,
            progress,
        )
        .await
    }

    /// Apply pending patches to `side`.
    pub async fn migrate(
        &self,
        side: Side,
        replay: bool,
        progress: &dyn ProgressSink,
    ) -> Result<MigrateReport> {
        commands::migrate::execute(self.client(side)?, &self.config.migration, replay, progress)
            .await
    }

    /// Mark a patch file as applied on `side` without running it.
    pub async fn save(&self, side: Side, file: &str) -> Result<SaveReport> {
        commands::save::execute(self.client(side)?, &self.config.migration, file).await
    }

    /// Show patch status information for `side`.
    pub async fn info(&self, side: Side) -> Result<Vec<PatchInfo>> {
        commands::info::execute(self.client(side)?, &self.config.migration).await
    }
}
