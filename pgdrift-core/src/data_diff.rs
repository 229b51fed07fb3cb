//! Data diff: reconcile the rows of configured tables, matched by row hash.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::change::{ChangeBlock, ChangeOperation, ColumnValue};
use crate::config::TableCompareConfig;
use crate::progress::{ProgressSink, Steps};
use crate::records::{Record, RecordSet};
use crate::snapshot::QualifiedName;

/// Compare source and target rows for every configured table.
///
/// `new_columns` lists columns the structural diff adds to target; their source
/// values are carried into updates even though target rows lack them.
pub fn compare_records(
    tables: &[TableCompareConfig],
    source: &IndexMap<QualifiedName, RecordSet>,
    target: &IndexMap<QualifiedName, RecordSet>,
    new_columns: &HashMap<QualifiedName, HashSet<String>>,
    progress: &dyn ProgressSink,
) -> Vec<ChangeBlock> {
    let mut steps = Steps::new(progress, tables.len());
    let missing = RecordSet::missing();
    let no_new_columns = HashSet::new();
    let mut blocks = Vec::new();

    for table in tables {
        let name = table.qualified_name();
        let source_set = source.get(&name).unwrap_or(&missing);
        let target_set = target.get(&name).unwrap_or(&missing);
        let added = new_columns.get(&name).unwrap_or(&no_new_columns);

        let mut block = ChangeBlock::new(format!("SYNCHRONIZE TABLE {} RECORDS", name));
        block.operations = compare_table(&name, &table.key_fields, source_set, target_set, added);
        if !block.is_empty() {
            blocks.push(block);
        }
        steps.advance(&format!("Compared records of {}", name));
    }

    blocks
}

fn compare_table(
    table: &QualifiedName,
    key_fields: &[String],
    source: &RecordSet,
    target: &RecordSet,
    new_columns: &HashSet<String>,
) -> Vec<ChangeOperation> {
    let mut ops = Vec::new();

    if !source.exists {
        ops.push(ChangeOperation::ErrorComment {
            message: format!("Table {} not found on SOURCE database for comparison!", table),
        });
        return ops;
    }
    if !target.exists {
        ops.push(ChangeOperation::ErrorComment {
            message: format!("Table {} not found on TARGET database for comparison!", table),
        });
    }

    // A missing target table is created from the source definition.
    let overriding_system_value = if target.exists {
        target.has_always_identity()
    } else {
        source.has_always_identity()
    };

    let source_counts = hash_counts(&source.rows);
    let target_counts = hash_counts(&target.rows);
    let mut target_rows: HashMap<&str, &Record> = HashMap::new();
    for row in &target.rows {
        target_rows.entry(row.row_hash.as_str()).or_insert(row);
    }

    let mut handled: HashSet<&str> = HashSet::new();
    let mut changed = false;

    for row in &source.rows {
        let hash = row.row_hash.as_str();
        if !handled.insert(hash) {
            continue;
        }
        if source_counts[hash] > 1 {
            ops.push(duplicate_comment("SOURCE", table, key_fields, row));
            continue;
        }
        if target_counts.get(hash).copied().unwrap_or(0) > 1 {
            ops.push(duplicate_comment("TARGET", table, key_fields, row));
            continue;
        }

        match target_rows.get(hash) {
            None => {
                let values = source
                    .fields
                    .iter()
                    .map(|f| ColumnValue::new(&f.name, f.category, row.value(&f.name).map(str::to_string)))
                    .collect();
                ops.push(ChangeOperation::InsertRow {
                    table: table.clone(),
                    values,
                    overriding_system_value,
                });
                changed = true;
            }
            Some(existing) => {
                let changes: Vec<ColumnValue> = source
                    .fields
                    .iter()
                    .filter(|f| match existing.values.get(&f.name) {
                        Some(current) => current.as_deref() != row.value(&f.name),
                        None => new_columns.contains(&f.name),
                    })
                    .map(|f| ColumnValue::new(&f.name, f.category, row.value(&f.name).map(str::to_string)))
                    .collect();
                if !changes.is_empty() {
                    ops.push(ChangeOperation::UpdateRow {
                        table: table.clone(),
                        changes,
                        keys: key_values(source, key_fields, row),
                    });
                    changed = true;
                }
            }
        }
    }

    for row in &target.rows {
        let hash = row.row_hash.as_str();
        if !handled.insert(hash) {
            continue;
        }
        if target_counts[hash] > 1 {
            ops.push(duplicate_comment("TARGET", table, key_fields, row));
            continue;
        }
        ops.push(ChangeOperation::DeleteRow {
            table: table.clone(),
            keys: key_values(target, key_fields, row),
        });
        changed = true;
    }

    if changed {
        for sequence in &source.sequences {
            ops.push(ChangeOperation::RebaseSequence {
                table: table.clone(),
                column: sequence.column.clone(),
            });
        }
    }

    ops
}

fn hash_counts(rows: &[Record]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for row in rows {
        *counts.entry(row.row_hash.as_str()).or_insert(0) += 1;
    }
    counts
}

fn key_values(set: &RecordSet, key_fields: &[String], row: &Record) -> Vec<ColumnValue> {
    key_fields
        .iter()
        .map(|k| {
            let category = set.field(k).map(|f| f.category).unwrap_or('S');
            ColumnValue::new(k, category, row.value(k).map(str::to_string))
        })
        .collect()
}

fn duplicate_comment(
    side: &str,
    table: &QualifiedName,
    key_fields: &[String],
    row: &Record,
) -> ChangeOperation {
    let keys: Vec<String> = key_fields
        .iter()
        .map(|k| format!("{}={}", k, row.value(k).unwrap_or("NULL")))
        .collect();
    ChangeOperation::ErrorComment {
        message: format!(
            "Too many records found in {} database for table {} and key fields ({})!",
            side,
            table,
            keys.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::records::{Field, TableSequence};
    use crate::snapshot::Identity;

    fn config() -> TableCompareConfig {
        TableCompareConfig {
            table_name: "t".to_string(),
            table_schema: "public".to_string(),
            key_fields: vec!["id".to_string()],
        }
    }

    fn fields(names: &[&str]) -> Vec<Field> {
        names
            .iter()
            .map(|n| Field {
                name: n.to_string(),
                data_type_id: if *n == "id" { 23 } else { 25 },
                category: if *n == "id" { 'N' } else { 'S' },
            })
            .collect()
    }

    fn row(values: &[(&str, Option<&str>)]) -> Record {
        let values = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect();
        Record::new(values, &["id".to_string()])
    }

    fn set(field_names: &[&str], rows: Vec<Record>) -> RecordSet {
        RecordSet {
            exists: true,
            fields: fields(field_names),
            rows,
            sequences: vec![TableSequence { column: "id".to_string(), identity: None }],
        }
    }

    fn single(set: RecordSet) -> IndexMap<QualifiedName, RecordSet> {
        let mut map = IndexMap::new();
        map.insert(config().qualified_name(), set);
        map
    }

    fn compare(source: RecordSet, target: RecordSet) -> Vec<ChangeBlock> {
        compare_records(
            &[config()],
            &single(source),
            &single(target),
            &HashMap::new(),
            &NoProgress,
        )
    }

    fn ops(blocks: &[ChangeBlock]) -> Vec<ChangeOperation> {
        blocks.iter().flat_map(|b| b.operations.clone()).collect()
    }

    /// Apply row operations to an in-memory record set.
    fn apply(target: &mut RecordSet, operations: &[ChangeOperation]) {
        let keys = vec!["id".to_string()];
        let matches = |record: &Record, key: &[ColumnValue]| {
            key.iter().all(|k| record.value(&k.name) == k.value.as_deref())
        };
        for op in operations {
            match op {
                ChangeOperation::InsertRow { values, .. } => {
                    let values = values.iter().map(|v| (v.name.clone(), v.value.clone())).collect();
                    target.rows.push(Record::new(values, &keys));
                }
                ChangeOperation::UpdateRow { changes, keys: key, .. } => {
                    for record in target.rows.iter_mut().filter(|r| matches(r, key)) {
                        for change in changes {
                            record.values.insert(change.name.clone(), change.value.clone());
                        }
                        *record = Record::new(record.values.clone(), &keys);
                    }
                }
                ChangeOperation::DeleteRow { keys: key, .. } => {
                    target.rows.retain(|r| !matches(r, key));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_insert_update_delete_and_rebase() {
        let source = set(
            &["id", "name"],
            vec![
                row(&[("id", Some("1")), ("name", Some("same"))]),
                row(&[("id", Some("2")), ("name", Some("new"))]),
                row(&[("id", Some("3")), ("name", Some("fresh"))]),
            ],
        );
        let target = set(
            &["id", "name"],
            vec![
                row(&[("id", Some("1")), ("name", Some("same"))]),
                row(&[("id", Some("2")), ("name", Some("old"))]),
                row(&[("id", Some("4")), ("name", Some("gone"))]),
            ],
        );

        let blocks = compare(source, target);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "SYNCHRONIZE TABLE \"public\".\"t\" RECORDS");

        let ops = ops(&blocks);
        assert_eq!(ops.len(), 4);
        assert!(matches!(&ops[0], ChangeOperation::UpdateRow { changes, keys, .. }
            if changes.len() == 1 && changes[0].name == "name" && keys[0].value.as_deref() == Some("2")));
        assert!(matches!(&ops[1], ChangeOperation::InsertRow { values, overriding_system_value: false, .. }
            if values.len() == 2 && values[0].value.as_deref() == Some("3")));
        assert!(matches!(&ops[2], ChangeOperation::DeleteRow { keys, .. } if keys[0].value.as_deref() == Some("4")));
        assert!(matches!(&ops[3], ChangeOperation::RebaseSequence { column, .. } if column == "id"));
    }

    #[test]
    fn test_applying_operations_makes_sync_idempotent() {
        let source = set(
            &["id", "name"],
            vec![
                row(&[("id", Some("1")), ("name", Some("a\r\nb"))]),
                row(&[("id", Some("2")), ("name", None)]),
                row(&[("id", Some("5")), ("name", Some("x"))]),
            ],
        );
        let mut target = set(
            &["id", "name"],
            vec![
                row(&[("id", Some("1")), ("name", Some("a\nb"))]),
                row(&[("id", Some("2")), ("name", Some("was set"))]),
                row(&[("id", Some("9")), ("name", Some("extra"))]),
            ],
        );

        let first = ops(&compare(source.clone(), target.clone()));
        assert!(!first.is_empty());
        apply(&mut target, &first);

        assert!(compare(source, target).is_empty());
    }

    #[test]
    fn test_identical_tables_produce_nothing() {
        let rows = vec![row(&[("id", Some("1")), ("name", Some("a"))])];
        assert!(compare(set(&["id", "name"], rows.clone()), set(&["id", "name"], rows)).is_empty());
    }

    #[test]
    fn test_duplicate_source_hash_reports_once_and_skips() {
        let source = set(
            &["id", "name"],
            vec![
                row(&[("id", Some("1")), ("name", Some("a"))]),
                row(&[("id", Some("1")), ("name", Some("b"))]),
            ],
        );
        let target = set(&["id", "name"], vec![]);

        let ops = ops(&compare(source, target));
        let comments: Vec<&ChangeOperation> = ops
            .iter()
            .filter(|op| matches!(op, ChangeOperation::ErrorComment { .. }))
            .collect();
        assert_eq!(comments.len(), 1);
        assert!(matches!(comments[0], ChangeOperation::ErrorComment { message }
            if message.contains("SOURCE") && message.contains("id=1")));
        assert!(!ops.iter().any(|op| matches!(op, ChangeOperation::InsertRow { .. })));
        // Nothing was written, so sequences stay as they are.
        assert!(!ops.iter().any(|op| matches!(op, ChangeOperation::RebaseSequence { .. })));
    }

    #[test]
    fn test_duplicate_target_hash_is_not_deleted() {
        let source = set(&["id", "name"], vec![row(&[("id", Some("1")), ("name", Some("a"))])]);
        let target = set(
            &["id", "name"],
            vec![
                row(&[("id", Some("1")), ("name", Some("a"))]),
                row(&[("id", Some("1")), ("name", Some("b"))]),
                row(&[("id", Some("7")), ("name", Some("c"))]),
                row(&[("id", Some("7")), ("name", Some("d"))]),
            ],
        );

        let ops = ops(&compare(source, target));
        let comments = ops
            .iter()
            .filter(|op| matches!(op, ChangeOperation::ErrorComment { message } if message.contains("TARGET")))
            .count();
        assert_eq!(comments, 2);
        assert!(!ops.iter().any(|op| matches!(op, ChangeOperation::DeleteRow { .. } | ChangeOperation::UpdateRow { .. })));
    }

    #[test]
    fn test_missing_tables_are_reported() {
        let blocks = compare(RecordSet::missing(), set(&["id"], vec![]));
        assert_eq!(
            ops(&blocks),
            vec![ChangeOperation::ErrorComment {
                message: "Table \"public\".\"t\" not found on SOURCE database for comparison!".to_string()
            }]
        );

        let source = set(&["id"], vec![row(&[("id", Some("1"))])]);
        let ops = ops(&compare(source, RecordSet::missing()));
        assert!(matches!(&ops[0], ChangeOperation::ErrorComment { message } if message.contains("TARGET")));
        assert!(matches!(&ops[1], ChangeOperation::InsertRow { .. }));
    }

    #[test]
    fn test_always_identity_sets_overriding_flag() {
        let source = set(&["id"], vec![row(&[("id", Some("1"))])]);
        let mut target = set(&["id"], vec![]);
        target.sequences = vec![TableSequence {
            column: "id".to_string(),
            identity: Some(Identity::Always),
        }];

        let ops = ops(&compare(source, target));
        assert!(matches!(&ops[0], ChangeOperation::InsertRow { overriding_system_value: true, .. }));
    }

    #[test]
    fn test_new_columns_are_carried_into_updates() {
        let source = set(
            &["id", "name", "note"],
            vec![row(&[("id", Some("1")), ("name", Some("a")), ("note", Some("hello"))])],
        );
        let target = set(&["id", "name"], vec![row(&[("id", Some("1")), ("name", Some("a"))])]);

        // Without the structural change the column is unknown on target and skipped.
        assert!(compare(source.clone(), target.clone()).is_empty());

        let mut new_columns = HashMap::new();
        new_columns.insert(config().qualified_name(), HashSet::from(["note".to_string()]));
        let blocks = compare_records(&[config()], &single(source), &single(target), &new_columns, &NoProgress);
        let ops = ops(&blocks);
        assert!(matches!(&ops[0], ChangeOperation::UpdateRow { changes, .. }
            if changes.len() == 1 && changes[0].name == "note" && changes[0].value.as_deref() == Some("hello")));
    }
}
