use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_postgres::Client;

use crate::config::MigrationSettings;
use crate::error::Result;
use crate::history::{self, PatchRecord, PatchStatus};
use crate::patch::{scan_patches, PatchFile};

/// Combined view of a patch (file + history).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchInfo {
    pub version: String,
    pub name: String,
    pub status: PatchStatus,
    pub last_message: Option<String>,
    pub applied_on: Option<NaiveDateTime>,
    /// False when the history knows a patch whose file is gone.
    pub on_disk: bool,
}

/// Execute the info command: merge patch files and history into one list.
pub async fn execute(client: &Client, settings: &MigrationSettings) -> Result<Vec<PatchInfo>> {
    let schema = &settings.history_table_schema;
    let table = &settings.history_table_name;

    let patches = scan_patches(&settings.patches_directory)?;
    let records = if history::history_table_exists(client, schema, table).await? {
        history::get_all_records(client, schema, table).await?
    } else {
        Vec::new()
    };

    Ok(merge(&patches, records))
}

fn merge(patches: &[PatchFile], records: Vec<PatchRecord>) -> Vec<PatchInfo> {
    let mut by_version: HashMap<String, PatchRecord> = records
        .into_iter()
        .map(|r| (r.version.clone(), r))
        .collect();

    let mut infos: Vec<PatchInfo> = patches
        .iter()
        .map(|patch| match by_version.remove(&patch.version) {
            Some(record) if record.name == patch.name => PatchInfo {
                version: record.version,
                name: record.name,
                status: record.status,
                last_message: record.last_message.filter(|m| !m.is_empty()),
                applied_on: record.applied_on,
                on_disk: true,
            },
            other => {
                // A version registered under another name is left for migrate to report.
                if let Some(record) = other {
                    by_version.insert(record.version.clone(), record);
                }
                PatchInfo {
                    version: patch.version.clone(),
                    name: patch.name.clone(),
                    status: PatchStatus::Todo,
                    last_message: None,
                    applied_on: None,
                    on_disk: true,
                }
            }
        })
        .collect();

    infos.extend(by_version.into_values().map(|record| PatchInfo {
        version: record.version,
        name: record.name,
        status: record.status,
        last_message: record.last_message.filter(|m| !m.is_empty()),
        applied_on: record.applied_on,
        on_disk: false,
    }));

    infos.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn patch(version: &str, name: &str) -> PatchFile {
        PatchFile {
            version: version.to_string(),
            name: name.to_string(),
            file_name: format!("{}_{}.sql", version, name),
            path: PathBuf::from(format!("{}_{}.sql", version, name)),
        }
    }

    fn record(version: &str, name: &str, status: PatchStatus, message: &str) -> PatchRecord {
        PatchRecord {
            version: version.to_string(),
            name: name.to_string(),
            status,
            last_message: Some(message.to_string()),
            script: Some(String::new()),
            applied_on: None,
        }
    }

    #[test]
    fn test_unregistered_patches_are_todo() {
        let infos = merge(&[patch("001", "init")], Vec::new());
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].status, PatchStatus::Todo);
        assert!(infos[0].on_disk);
    }

    #[test]
    fn test_merge_with_history() {
        let infos = merge(
            &[patch("001", "init"), patch("002", "users"), patch("003", "data")],
            vec![
                record("001", "init", PatchStatus::Done, ""),
                record("002", "users", PatchStatus::Error, "relation missing"),
                record("000", "gone", PatchStatus::Done, ""),
            ],
        );

        let summary: Vec<(&str, PatchStatus, bool)> = infos
            .iter()
            .map(|i| (i.version.as_str(), i.status, i.on_disk))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("000", PatchStatus::Done, false),
                ("001", PatchStatus::Done, true),
                ("002", PatchStatus::Error, true),
                ("003", PatchStatus::Todo, true),
            ]
        );
        assert_eq!(infos[1].last_message, None);
        assert_eq!(infos[2].last_message.as_deref(), Some("relation missing"));
    }

    #[test]
    fn test_name_mismatch_keeps_both_rows() {
        let infos = merge(
            &[patch("001", "init")],
            vec![record("001", "other", PatchStatus::Done, "")],
        );
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|i| i.name == "init" && i.status == PatchStatus::Todo));
        assert!(infos.iter().any(|i| i.name == "other" && !i.on_disk));
    }
}
