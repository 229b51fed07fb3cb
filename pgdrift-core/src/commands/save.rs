use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_postgres::Client;

use crate::config::MigrationSettings;
use crate::error::{DriftError, Result};
use crate::history::{MigrationStore, PatchStatus, PgMigrationStore};
use crate::patch::{parse_patch_filename, PatchFile};

const SAVED_MESSAGE: &str = "Registered without execution";

#[derive(Debug, Serialize)]
pub struct SaveReport {
    pub version: String,
    pub name: String,
    /// Status before the save; `TODO` when the patch was unknown.
    pub previous_status: PatchStatus,
}

/// Execute the save command: mark a patch `DONE` without running it.
pub async fn execute(
    client: &Client,
    settings: &MigrationSettings,
    file: &str,
) -> Result<SaveReport> {
    let patch = resolve_patch(&settings.patches_directory, file)?;
    let store = PgMigrationStore::new(
        client,
        &settings.history_table_schema,
        &settings.history_table_name,
    );
    run_save(&store, &patch).await
}

/// Find `file` as given, or inside the patches directory.
fn resolve_patch(directory: &Path, file: &str) -> Result<PatchFile> {
    let given = PathBuf::from(file);
    let path = if given.is_file() {
        given
    } else {
        directory.join(file)
    };

    if !path.is_file() {
        return Err(DriftError::ConfigError(format!(
            "Patch file '{}' not found in '{}'",
            file,
            directory.display()
        )));
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| DriftError::ConfigError(format!("Invalid patch path '{}'", file)))?;
    let (version, name) = parse_patch_filename(&file_name)?;

    Ok(PatchFile {
        version,
        name,
        file_name,
        path,
    })
}

pub async fn run_save(store: &dyn MigrationStore, patch: &PatchFile) -> Result<SaveReport> {
    store.prepare().await?;

    let records = store.find(&patch.version, &patch.name).await?;
    if records.len() > 1 {
        return Err(DriftError::IntegrityError(format!(
            "Found {} history records for patch {} ({})",
            records.len(),
            patch.version,
            patch.name
        )));
    }
    let previous_status = records
        .first()
        .map(|r| r.status)
        .unwrap_or(PatchStatus::Todo);

    store.register(&patch.version, &patch.name).await?;
    store
        .update_status(&patch.version, PatchStatus::Done, SAVED_MESSAGE, "")
        .await?;

    tracing::info!(version = %patch.version, name = %patch.name, previous = %previous_status, "Patch saved as DONE");

    Ok(SaveReport {
        version: patch.version.clone(),
        name: patch.name.clone(),
        previous_status,
    })
}
