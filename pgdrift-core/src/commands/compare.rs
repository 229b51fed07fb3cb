use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;

use crate::catalog;
use crate::change::{added_columns, ChangeBlock};
use crate::config::CompareSettings;
use crate::data_diff::compare_records;
use crate::db;
use crate::error::{DriftError, Result};
use crate::patch::{patch_file_name, render_patch};
use crate::progress::ProgressSink;
use crate::records::collect_records;
use crate::schema_diff::{compare_schemas, DiffOptions};

/// Report returned after a compare operation.
#[derive(Debug, Serialize)]
pub struct CompareReport {
    /// The written patch; `None` when the databases already match.
    pub file: Option<PathBuf>,
    pub schema_blocks: usize,
    pub data_blocks: usize,
}

/// Execute the compare command: diff both databases and write a patch named `name`.
pub async fn execute(
    source: &Client,
    target: &Client,
    settings: &CompareSettings,
    name: &str,
    progress: &dyn ProgressSink,
) -> Result<CompareReport> {
    validate_patch_name(name)?;

    let (schema_blocks, data_blocks) = diff(source, target, settings, progress).await?;

    let mut blocks = schema_blocks.clone();
    blocks.extend(data_blocks.iter().cloned());
    let author = resolve_author(settings);
    let file = write_patch(settings, name, &blocks, &author, Utc::now())?;

    match &file {
        Some(path) => tracing::info!(
            file = %path.display(),
            schema_blocks = schema_blocks.len(),
            data_blocks = data_blocks.len(),
            "Patch written"
        ),
        None => tracing::info!("No differences found, no patch written"),
    }

    Ok(CompareReport {
        file,
        schema_blocks: schema_blocks.len(),
        data_blocks: data_blocks.len(),
    })
}

/// Compute the structural blocks, then the data blocks, for SOURCE → TARGET.
///
/// Both sessions get [`db::TEXT_OUTPUT_SETTINGS`] first, so values read as text
/// compare equal whatever the servers' defaults are.
pub async fn diff(
    source: &Client,
    target: &Client,
    settings: &CompareSettings,
    progress: &dyn ProgressSink,
) -> Result<(Vec<ChangeBlock>, Vec<ChangeBlock>)> {
    tokio::try_join!(db::pin_text_output(source), db::pin_text_output(target))?;
    let (source_version, target_version) =
        tokio::try_join!(db::server_version(source), db::server_version(target))?;
    tracing::debug!(source = %source_version, target = %target_version, "Server versions");

    let namespaces = &settings.schema.namespaces;
    let (source_snapshot, target_snapshot) = tokio::try_join!(
        catalog::collect(source, namespaces, source_version, progress),
        catalog::collect(target, namespaces, target_version, progress),
    )?;

    let schema_blocks = compare_schemas(
        &source_snapshot,
        &target_snapshot,
        &DiffOptions::from(&settings.schema),
        progress,
    );

    let data_blocks = if settings.data.enable && !settings.data.tables.is_empty() {
        let tables = &settings.data.tables;
        let (source_records, target_records) = tokio::try_join!(
            collect_records(source, tables, source_version, progress),
            collect_records(target, tables, target_version, progress),
        )?;
        compare_records(
            tables,
            &source_records,
            &target_records,
            &added_columns(&schema_blocks),
            progress,
        )
    } else {
        Vec::new()
    };

    Ok((schema_blocks, data_blocks))
}

fn validate_patch_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DriftError::ConfigError(format!(
            "Invalid patch name '{}': use letters, digits, '_' or '-'",
            name
        )));
    }
    Ok(())
}

/// Configured author, else `git config user.name` when enabled, else `$USER`.
fn resolve_author(settings: &CompareSettings) -> String {
    if let Some(author) = settings.author.as_deref().filter(|a| !a.is_empty()) {
        return author.to_string();
    }
    if settings.author_from_git {
        match git_user_name() {
            Some(name) => return name,
            None => tracing::warn!("Could not read user.name from git config"),
        }
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn git_user_name() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["config", "user.name"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Render `blocks` into `output_directory`. Nothing is written for an empty diff.
fn write_patch(
    settings: &CompareSettings,
    name: &str,
    blocks: &[ChangeBlock],
    author: &str,
    created: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if blocks.iter().all(ChangeBlock::is_empty) {
        return Ok(None);
    }

    std::fs::create_dir_all(&settings.output_directory)?;
    let path = settings
        .output_directory
        .join(patch_file_name(created, name));
    let content = render_patch(blocks, settings.schema.idempotent_script, author, created);
    std::fs::write(&path, content)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOperation;
    use crate::patch::{parse_blocks, scan_patches};
    use chrono::TimeZone;

    fn settings(dir: &std::path::Path) -> CompareSettings {
        CompareSettings {
            output_directory: dir.join("out"),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_patch_name() {
        assert!(validate_patch_name("add_users-2").is_ok());
        assert!(validate_patch_name("").is_err());
        assert!(validate_patch_name("../escape").is_err());
        assert!(validate_patch_name("with space").is_err());
    }

    #[test]
    fn test_configured_author_wins() {
        let settings = CompareSettings {
            author: Some("Ada".to_string()),
            author_from_git: true,
            ..Default::default()
        };
        assert_eq!(resolve_author(&settings), "Ada");
    }

    #[test]
    fn test_empty_diff_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let written = write_patch(&settings, "noop", &[], "me", Utc::now()).unwrap();
        assert!(written.is_none());
        assert!(!settings.output_directory.exists());
    }

    #[test]
    fn test_written_patch_is_discoverable_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();

        let mut block = ChangeBlock::new("CREATE SCHEMA \"app\"");
        block.operations.push(ChangeOperation::CreateSchema {
            schema: "app".to_string(),
            owner: "postgres".to_string(),
        });

        let path = write_patch(&settings, "init", &[block], "me", created)
            .unwrap()
            .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20240301083000000_init.sql"
        );

        let patches = scan_patches(&settings.output_directory).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].version, "20240301083000000");

        let blocks = parse_blocks(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "CREATE SCHEMA \"app\"");
        assert!(blocks[0].sql.contains("CREATE SCHEMA"));
    }
}
