use std::path::Path;

use serde::Serialize;
use tokio_postgres::Client;

use crate::config::MigrationSettings;
use crate::db;
use crate::error::{error_message, DriftError, Result};
use crate::history::{MigrationStore, PatchStatus, PgMigrationStore};
use crate::patch::{scan_patches, PatchFile};
use crate::progress::ProgressSink;

/// Report returned after a migrate operation.
#[derive(Debug, Default, Serialize)]
pub struct MigrateReport {
    pub patches_applied: usize,
    pub patches_skipped: usize,
    pub total_time_ms: i32,
    pub details: Vec<MigrateDetail>,
}

#[derive(Debug, Serialize)]
pub struct MigrateDetail {
    pub version: String,
    pub name: String,
    pub blocks: usize,
    /// Whether this run resumed a `WIP` or `ERROR` patch.
    pub replayed: bool,
    pub execution_time_ms: i32,
}

/// Execute the migrate command against a live connection.
///
/// The run holds an advisory lock on the history table for its whole duration.
pub async fn execute(
    client: &Client,
    settings: &MigrationSettings,
    replay: bool,
    progress: &dyn ProgressSink,
) -> Result<MigrateReport> {
    let lock_name = format!(
        "{}.{}",
        settings.history_table_schema, settings.history_table_name
    );

    db::acquire_advisory_lock(client, &lock_name).await?;

    let store = PgMigrationStore::new(
        client,
        &settings.history_table_schema,
        &settings.history_table_name,
    );
    let result = run_migrate(&store, &settings.patches_directory, replay, progress).await;

    // Always release the advisory lock
    if let Err(e) = db::release_advisory_lock(client, &lock_name).await {
        tracing::warn!(error = %e, "Failed to release advisory lock");
    }

    match &result {
        Ok(report) => {
            tracing::info!(
                patches_applied = report.patches_applied,
                patches_skipped = report.patches_skipped,
                total_time_ms = report.total_time_ms,
                "Migrate completed"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "Migrate failed");
        }
    }

    result
}

/// Apply every pending patch in `directory`, in file name order.
///
/// Stops at the first patch that is in an unsafe state or fails.
pub async fn run_migrate(
    store: &dyn MigrationStore,
    directory: &Path,
    replay: bool,
    progress: &dyn ProgressSink,
) -> Result<MigrateReport> {
    store.prepare().await?;

    let patches = scan_patches(directory)?;
    let total = patches.len();
    let mut report = MigrateReport::default();

    for (i, patch) in patches.iter().enumerate() {
        let records = store.find(&patch.version, &patch.name).await?;
        if records.len() > 1 {
            return Err(DriftError::IntegrityError(format!(
                "Found {} history records for patch {} ({})",
                records.len(),
                patch.version,
                patch.name
            )));
        }

        let status = records
            .first()
            .map(|r| r.status)
            .unwrap_or(PatchStatus::Todo);

        let replayed = match status {
            PatchStatus::Done => {
                tracing::info!(version = %patch.version, name = %patch.name, "Patch already applied, skipping");
                report.patches_skipped += 1;
                progress.report(&format!("Skipped {}", patch.file_name), (i + 1) as f64 / total as f64);
                continue;
            }
            PatchStatus::Wip | PatchStatus::Error if !replay => {
                return Err(DriftError::PatchStateError {
                    version: patch.version.clone(),
                    name: patch.name.clone(),
                    status,
                });
            }
            PatchStatus::Wip | PatchStatus::Error => {
                tracing::warn!(version = %patch.version, name = %patch.name, status = %status, "Replaying patch");
                true
            }
            PatchStatus::Todo => false,
        };

        let detail = apply_patch(store, patch, replayed).await?;
        report.patches_applied += 1;
        report.total_time_ms += detail.execution_time_ms;
        report.details.push(detail);
        progress.report(&format!("Applied {}", patch.file_name), (i + 1) as f64 / total as f64);
    }

    Ok(report)
}

async fn apply_patch(
    store: &dyn MigrationStore,
    patch: &PatchFile,
    replayed: bool,
) -> Result<MigrateDetail> {
    let blocks = patch.read_blocks()?;
    store.register(&patch.version, &patch.name).await?;

    tracing::info!(version = %patch.version, name = %patch.name, blocks = blocks.len(), "Applying patch");
    let start = std::time::Instant::now();

    for block in &blocks {
        store
            .update_status(&patch.version, PatchStatus::Wip, &block.label, &block.sql)
            .await?;

        if let Err(e) = store.execute(&block.sql).await {
            let reason = error_message(&e);
            tracing::error!(version = %patch.version, label = %block.label, reason = %reason, "Patch block failed");
            store
                .update_status(&patch.version, PatchStatus::Error, &reason, &block.sql)
                .await?;
            return Err(DriftError::ExecutionError {
                version: patch.version.clone(),
                name: patch.name.clone(),
                label: block.label.clone(),
                reason,
            });
        }
    }

    store
        .update_status(&patch.version, PatchStatus::Done, "", "")
        .await?;

    Ok(MigrateDetail {
        version: patch.version.clone(),
        name: patch.name.clone(),
        blocks: blocks.len(),
        replayed,
        execution_time_ms: start.elapsed().as_millis() as i32,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::history::PatchRecord;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// History table and database held in memory.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub records: Mutex<Vec<PatchRecord>>,
        pub executed: Mutex<Vec<String>>,
        /// Blocks containing this text fail.
        pub fail_on: Option<String>,
    }

    impl MemoryStore {
        pub fn with_record(version: &str, name: &str, status: PatchStatus) -> Self {
            let store = Self::default();
            store.records.lock().unwrap().push(PatchRecord {
                version: version.to_string(),
                name: name.to_string(),
                status,
                last_message: None,
                script: None,
                applied_on: None,
            });
            store
        }

        pub fn record(&self, version: &str) -> PatchRecord {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.version == version)
                .cloned()
                .unwrap()
        }
    }

    #[async_trait]
    impl MigrationStore for MemoryStore {
        async fn prepare(&self) -> Result<()> {
            Ok(())
        }

        async fn find(&self, version: &str, name: &str) -> Result<Vec<PatchRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.version == version && r.name == name)
                .cloned()
                .collect())
        }

        async fn register(&self, version: &str, name: &str) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            if !records.iter().any(|r| r.version == version) {
                records.push(PatchRecord {
                    version: version.to_string(),
                    name: name.to_string(),
                    status: PatchStatus::Todo,
                    last_message: Some(String::new()),
                    script: Some(String::new()),
                    applied_on: None,
                });
            }
            Ok(())
        }

        async fn update_status(
            &self,
            version: &str,
            status: PatchStatus,
            message: &str,
            script: &str,
        ) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            for record in records.iter_mut().filter(|r| r.version == version) {
                record.status = status;
                record.last_message = Some(message.to_string());
                record.script = Some(script.to_string());
            }
            Ok(())
        }

        async fn execute(&self, sql: &str) -> Result<()> {
            if let Some(fail) = &self.fail_on {
                if sql.contains(fail.as_str()) {
                    return Err(DriftError::ConfigError(format!("boom at {}", fail)));
                }
            }
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(())
        }
    }

    fn write_patch(dir: &Path, file_name: &str, blocks: &[(&str, &str)]) {
        let mut content = String::from("/*** header ***/\n");
        for (label, sql) in blocks {
            content.push_str(&format!("\n--- BEGIN {} ---\n{}\n--- END {} ---\n", label, sql, label));
        }
        std::fs::write(dir.join(file_name), content).unwrap();
    }

    #[tokio::test]
    async fn test_applies_pending_patches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_patch(dir.path(), "002_second.sql", &[("B", "SELECT 2;")]);
        write_patch(dir.path(), "001_first.sql", &[("A", "SELECT 1;")]);

        let store = MemoryStore::default();
        let report = run_migrate(&store, dir.path(), false, &NoProgress).await.unwrap();

        assert_eq!(report.patches_applied, 2);
        assert_eq!(report.details[0].version, "001");
        assert_eq!(
            *store.executed.lock().unwrap(),
            vec!["SELECT 1;\n".to_string(), "SELECT 2;\n".to_string()]
        );
        assert_eq!(store.record("001").status, PatchStatus::Done);
        assert_eq!(store.record("002").status, PatchStatus::Done);
    }

    #[tokio::test]
    async fn test_done_patch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_patch(dir.path(), "001_first.sql", &[("A", "SELECT 1;")]);

        let store = MemoryStore::with_record("001", "first", PatchStatus::Done);
        let report = run_migrate(&store, dir.path(), false, &NoProgress).await.unwrap();

        assert_eq!(report.patches_applied, 0);
        assert_eq!(report.patches_skipped, 1);
        assert!(store.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wip_patch_requires_replay() {
        let dir = tempfile::tempdir().unwrap();
        write_patch(dir.path(), "001_first.sql", &[("A", "SELECT 1;")]);

        let store = MemoryStore::with_record("001", "first", PatchStatus::Wip);
        let err = run_migrate(&store, dir.path(), false, &NoProgress).await.unwrap_err();

        match err {
            DriftError::PatchStateError { version, name, status } => {
                assert_eq!(version, "001");
                assert_eq!(name, "first");
                assert_eq!(status, PatchStatus::Wip);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(store.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        write_patch(dir.path(), "001_first.sql", &[("A", "SELECT 1;")]);

        let store = MemoryStore::with_record("001", "first", PatchStatus::Error);
        let report = run_migrate(&store, dir.path(), true, &NoProgress).await.unwrap();

        assert!(report.details[0].replayed);
        let record = store.record("001");
        assert_eq!(record.status, PatchStatus::Done);
        assert_eq!(record.last_message.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_failing_block_marks_error_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        write_patch(
            dir.path(),
            "001_first.sql",
            &[("A", "SELECT 1;"), ("B", "SELECT broken;"), ("C", "SELECT 3;")],
        );
        write_patch(dir.path(), "002_second.sql", &[("D", "SELECT 4;")]);

        let store = MemoryStore {
            fail_on: Some("broken".to_string()),
            ..Default::default()
        };
        let err = run_migrate(&store, dir.path(), false, &NoProgress).await.unwrap_err();

        match err {
            DriftError::ExecutionError { version, label, reason, .. } => {
                assert_eq!(version, "001");
                assert_eq!(label, "B");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {}", other),
        }

        let record = store.record("001");
        assert_eq!(record.status, PatchStatus::Error);
        assert_eq!(record.script.as_deref(), Some("SELECT broken;\n"));
        assert!(record.last_message.unwrap().contains("boom"));
        assert_eq!(*store.executed.lock().unwrap(), vec!["SELECT 1;\n".to_string()]);
        assert!(store.find("002", "second").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_history_records_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_patch(dir.path(), "001_first.sql", &[("A", "SELECT 1;")]);

        let store = MemoryStore::with_record("001", "first", PatchStatus::Done);
        let duplicate = store.record("001");
        store.records.lock().unwrap().push(duplicate);

        let err = run_migrate(&store, dir.path(), false, &NoProgress).await.unwrap_err();
        assert!(matches!(err, DriftError::IntegrityError(_)));
    }

    #[tokio::test]
    async fn test_unterminated_block_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("001_first.sql"),
            "--- BEGIN A ---\nSELECT 1;\n--- END A ---\n--- BEGIN B ---\nSELECT 2;\n",
        )
        .unwrap();

        let store = MemoryStore::default();
        let err = run_migrate(&store, dir.path(), false, &NoProgress).await.unwrap_err();

        assert!(matches!(err, DriftError::IntegrityError(ref m) if m.contains("001_first.sql")));
        assert!(store.executed.lock().unwrap().is_empty());
        assert!(store.records.lock().unwrap().is_empty());
    }
}
