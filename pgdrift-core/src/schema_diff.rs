//! Structural diff: compute ordered change blocks that move TARGET toward SOURCE.
//!
//! Categories are visited in a fixed order: schemas, tables, views, materialized
//! views, functions, sequences. Within a category, objects are visited in source
//! order and target-only objects follow.
//!
//! Altering a column first drops every target constraint, index and view that
//! depends on it. Those drops are remembered so the later constraint/index/view
//! passes neither drop them twice nor forget to recreate them.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::change::{
    ChangeBlock, ChangeOperation, ColumnChanges, GrantObject, IdentityChange, OwnedObject,
};
use crate::config::SchemaCompareSettings;
use crate::db::quote_ident;
use crate::progress::{ProgressSink, Steps};
use crate::snapshot::{
    ColumnDef, IndexDef, Privilege, Privileges, QualifiedName, SchemaSnapshot, TableDef, ViewDef,
};

/// Policy knobs for the structural diff.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Restrict privilege comparison to these roles. Empty means every role.
    pub roles: Vec<String>,
    pub drop_missing_table: bool,
    pub drop_missing_view: bool,
    pub drop_missing_function: bool,
}

impl DiffOptions {
    fn includes_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r == role)
    }
}

impl From<&SchemaCompareSettings> for DiffOptions {
    fn from(settings: &SchemaCompareSettings) -> Self {
        Self {
            roles: settings.roles.clone(),
            drop_missing_table: settings.drop_missing_table,
            drop_missing_view: settings.drop_missing_view,
            drop_missing_function: settings.drop_missing_function,
        }
    }
}

/// Whether a constraint or index definition mentions `column`.
///
/// A textual heuristic, not a parser: after the first `(` it looks for
/// `column,`, `column)` or the quoted identifier. It can report false positives
/// (which only cost an unneeded drop and re-add). It misses columns used inside
/// expressions, such as `CHECK ((qty > 0))`, so those constraints are not
/// dropped before a column change.
pub fn references_column(definition: &str, column: &str) -> bool {
    let Some(start) = definition.find('(') else {
        return false;
    };
    let body = &definition[start..];
    body.contains(&format!("{},", column))
        || body.contains(&format!("{})", column))
        || body.contains(&quote_ident(column))
}

/// Compare two snapshots. Comparing a snapshot with itself yields no blocks.
pub fn compare_schemas(
    source: &SchemaSnapshot,
    target: &SchemaSnapshot,
    options: &DiffOptions,
    progress: &dyn ProgressSink,
) -> Vec<ChangeBlock> {
    let mut diff = SchemaDiff {
        source,
        target,
        options,
        blocks: Vec::new(),
        dropped_constraints: HashMap::new(),
        dropped_indexes: HashMap::new(),
        dropped_views: HashSet::new(),
    };
    let mut steps = Steps::new(progress, 6);

    diff.diff_schemas();
    steps.advance("Schemas compared");
    diff.diff_tables();
    steps.advance("Tables compared");
    diff.diff_views();
    steps.advance("Views compared");
    diff.diff_materialized_views();
    steps.advance("Materialized views compared");
    diff.diff_functions();
    steps.advance("Functions compared");
    diff.diff_sequences();
    steps.advance("Sequences compared");

    tracing::debug!(blocks = diff.blocks.len(), "Structural diff complete");
    diff.blocks
}

struct SchemaDiff<'a> {
    source: &'a SchemaSnapshot,
    target: &'a SchemaSnapshot,
    options: &'a DiffOptions,
    blocks: Vec<ChangeBlock>,
    dropped_constraints: HashMap<QualifiedName, HashSet<String>>,
    dropped_indexes: HashMap<QualifiedName, HashSet<String>>,
    dropped_views: HashSet<QualifiedName>,
}

impl<'a> SchemaDiff<'a> {
    fn push(&mut self, block: ChangeBlock) {
        if !block.is_empty() {
            self.blocks.push(block);
        }
    }

    fn diff_schemas(&mut self) {
        let (source, target) = (self.source, self.target);
        for (schema, def) in &source.schemas {
            if !target.schemas.contains_key(schema) {
                let mut block = ChangeBlock::new(format!("CREATE SCHEMA {}", quote_ident(schema)));
                block.operations.push(ChangeOperation::CreateSchema {
                    schema: schema.clone(),
                    owner: def.owner.clone(),
                });
                self.push(block);
            }
        }
    }

    fn diff_tables(&mut self) {
        let (source, target) = (self.source, self.target);

        for (name, table) in &source.tables {
            match target.tables.get(name) {
                None => {
                    let mut definition = table.clone();
                    definition
                        .privileges
                        .retain(|role, _| self.options.includes_role(role) && *role != table.owner);
                    let mut block = ChangeBlock::new(format!("CREATE TABLE {}", name));
                    block.operations.push(ChangeOperation::CreateTable {
                        table: name.clone(),
                        definition,
                    });
                    self.push(block);
                }
                Some(target_table) => {
                    let mut ops = Vec::new();
                    self.diff_columns(name, table, target_table, &mut ops);
                    self.diff_constraints(name, table, target_table, &mut ops);
                    self.diff_indexes(name, &table.indexes, &target_table.indexes, &mut ops);

                    if table.options.with_oids != target_table.options.with_oids {
                        ops.push(ChangeOperation::SetOids {
                            table: name.clone(),
                            with_oids: table.options.with_oids,
                        });
                    }

                    self.diff_table_privileges(
                        GrantObject::Table(name.clone()),
                        &table.privileges,
                        &target_table.privileges,
                        &mut ops,
                    );
                    if table.owner != target_table.owner {
                        ops.push(ChangeOperation::ChangeOwner {
                            object: OwnedObject::Table(name.clone()),
                            owner: table.owner.clone(),
                        });
                    }

                    let mut block = ChangeBlock::new(format!("ALTER TABLE {}", name));
                    block.operations = ops;
                    self.push(block);
                }
            }
        }

        if self.options.drop_missing_table {
            for name in target.tables.keys() {
                if !source.tables.contains_key(name) {
                    let mut block = ChangeBlock::new(format!("DROP TABLE {}", name));
                    block.operations.push(ChangeOperation::DropTable { table: name.clone() });
                    self.push(block);
                }
            }
        }
    }

    fn diff_columns(
        &mut self,
        table: &QualifiedName,
        source_table: &TableDef,
        target_table: &TableDef,
        ops: &mut Vec<ChangeOperation>,
    ) {
        for (column, source_column) in &source_table.columns {
            match target_table.columns.get(column) {
                Some(target_column) => {
                    let changes = column_changes(source_column, target_column);
                    if changes.any() {
                        self.drop_column_dependents(table, target_table, column, ops);
                        ops.push(ChangeOperation::AlterColumn {
                            table: table.clone(),
                            column: column.clone(),
                            definition: source_column.clone(),
                            changes,
                        });
                    }
                }
                None => ops.push(ChangeOperation::AddColumn {
                    table: table.clone(),
                    column: column.clone(),
                    definition: source_column.clone(),
                }),
            }
        }

        for column in target_table.columns.keys() {
            if !source_table.columns.contains_key(column) {
                self.drop_column_dependents(table, target_table, column, ops);
                ops.push(ChangeOperation::DropColumn {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    /// Drop every target object pinned to `column`, remembering each drop.
    fn drop_column_dependents(
        &mut self,
        table: &QualifiedName,
        target_table: &TableDef,
        column: &str,
        ops: &mut Vec<ChangeOperation>,
    ) {
        let dropped = self.dropped_constraints.entry(table.clone()).or_default();
        for (name, constraint) in &target_table.constraints {
            if references_column(&constraint.definition, column) && dropped.insert(name.clone()) {
                ops.push(ChangeOperation::DropConstraint {
                    table: table.clone(),
                    name: name.clone(),
                });
            }
        }

        let dropped = self.dropped_indexes.entry(table.clone()).or_default();
        for (name, index) in &target_table.indexes {
            if references_column(&index.definition, column) && dropped.insert(name.clone()) {
                ops.push(ChangeOperation::DropIndex {
                    index: QualifiedName::new(&table.schema, name),
                });
            }
        }

        let target = self.target;
        for (name, view) in &target.views {
            if view.depends_on(table, column) && self.dropped_views.insert(name.clone()) {
                ops.push(ChangeOperation::DropView { view: name.clone() });
            }
        }
        for (name, view) in &target.materialized_views {
            if view.depends_on(table, column) && self.dropped_views.insert(name.clone()) {
                ops.push(ChangeOperation::DropMaterializedView { view: name.clone() });
            }
        }
    }

    fn diff_constraints(
        &mut self,
        table: &QualifiedName,
        source_table: &TableDef,
        target_table: &TableDef,
        ops: &mut Vec<ChangeOperation>,
    ) {
        let dropped = self.dropped_constraints.entry(table.clone()).or_default();

        for (name, constraint) in &source_table.constraints {
            let add = ChangeOperation::AddConstraint {
                table: table.clone(),
                name: name.clone(),
                definition: constraint.clone(),
            };
            match target_table.constraints.get(name) {
                Some(existing) if existing.definition != constraint.definition => {
                    if dropped.insert(name.clone()) {
                        ops.push(ChangeOperation::DropConstraint {
                            table: table.clone(),
                            name: name.clone(),
                        });
                    }
                    ops.push(add);
                }
                Some(_) => {
                    if dropped.contains(name) {
                        ops.push(add);
                    }
                }
                None => ops.push(add),
            }
        }

        for name in target_table.constraints.keys() {
            if !source_table.constraints.contains_key(name) && dropped.insert(name.clone()) {
                ops.push(ChangeOperation::DropConstraint {
                    table: table.clone(),
                    name: name.clone(),
                });
            }
        }
    }

    fn diff_indexes(
        &mut self,
        owner: &QualifiedName,
        source_indexes: &IndexMap<String, IndexDef>,
        target_indexes: &IndexMap<String, IndexDef>,
        ops: &mut Vec<ChangeOperation>,
    ) {
        let dropped = self.dropped_indexes.entry(owner.clone()).or_default();

        for (name, index) in source_indexes {
            let qualified = QualifiedName::new(&owner.schema, name);
            match target_indexes.get(name) {
                Some(existing) if existing.definition != index.definition => {
                    if dropped.insert(name.clone()) {
                        ops.push(ChangeOperation::ChangeIndex {
                            index: qualified,
                            definition: index.definition.clone(),
                        });
                    } else {
                        ops.push(ChangeOperation::CreateIndex {
                            index: qualified,
                            definition: index.definition.clone(),
                        });
                    }
                }
                Some(_) => {
                    if dropped.contains(name) {
                        ops.push(ChangeOperation::CreateIndex {
                            index: qualified,
                            definition: index.definition.clone(),
                        });
                    }
                }
                None => ops.push(ChangeOperation::CreateIndex {
                    index: qualified,
                    definition: index.definition.clone(),
                }),
            }
        }

        for name in target_indexes.keys() {
            if !source_indexes.contains_key(name) && dropped.insert(name.clone()) {
                ops.push(ChangeOperation::DropIndex {
                    index: QualifiedName::new(&owner.schema, name),
                });
            }
        }
    }

    /// Per-role capability differences. A role missing on target gets its full grant set.
    fn privilege_changes(
        &self,
        source: &Privileges,
        target: &Privileges,
    ) -> Vec<(String, Vec<(Privilege, bool)>)> {
        let mut result = Vec::new();
        for (role, privileges) in source {
            if !self.options.includes_role(role) {
                continue;
            }
            let changes: Vec<(Privilege, bool)> = match target.get(role) {
                None => privileges
                    .iter()
                    .filter(|(_, granted)| **granted)
                    .map(|(p, g)| (*p, *g))
                    .collect(),
                Some(existing) => privileges
                    .iter()
                    .filter(|(p, g)| existing.get(*p) != Some(*g))
                    .map(|(p, g)| (*p, *g))
                    .collect(),
            };
            if !changes.is_empty() {
                result.push((role.clone(), changes));
            }
        }
        result
    }

    fn diff_table_privileges(
        &self,
        object: GrantObject,
        source: &Privileges,
        target: &Privileges,
        ops: &mut Vec<ChangeOperation>,
    ) {
        for (role, changes) in self.privilege_changes(source, target) {
            ops.push(ChangeOperation::GrantChange {
                object: object.clone(),
                role,
                changes,
            });
        }
    }

    /// Operations that create a view from scratch, including owner and grants.
    fn create_view_ops(
        &self,
        name: &QualifiedName,
        view: &ViewDef,
        materialized: bool,
        ops: &mut Vec<ChangeOperation>,
    ) {
        if materialized {
            ops.push(ChangeOperation::CreateMaterializedView {
                view: name.clone(),
                definition: view.definition.clone(),
            });
            for (index, def) in &view.indexes {
                ops.push(ChangeOperation::CreateIndex {
                    index: QualifiedName::new(&name.schema, index),
                    definition: def.definition.clone(),
                });
            }
        } else {
            ops.push(ChangeOperation::CreateView {
                view: name.clone(),
                definition: view.definition.clone(),
            });
        }

        if !view.owner.is_empty() {
            ops.push(ChangeOperation::ChangeOwner {
                object: if materialized {
                    OwnedObject::MaterializedView(name.clone())
                } else {
                    OwnedObject::View(name.clone())
                },
                owner: view.owner.clone(),
            });
        }
        self.diff_table_privileges(
            GrantObject::Table(name.clone()),
            &granted_to_others(&view.privileges, &view.owner),
            &Privileges::new(),
            ops,
        );
    }

    fn diff_views(&mut self) {
        self.diff_view_category(false);
    }

    fn diff_materialized_views(&mut self) {
        self.diff_view_category(true);
    }

    fn diff_view_category(&mut self, materialized: bool) {
        let (source, target) = (self.source, self.target);
        let (source_views, target_views, kind) = if materialized {
            (&source.materialized_views, &target.materialized_views, "MATERIALIZED VIEW")
        } else {
            (&source.views, &target.views, "VIEW")
        };
        let drop_op = |view: &QualifiedName| {
            if materialized {
                ChangeOperation::DropMaterializedView { view: view.clone() }
            } else {
                ChangeOperation::DropView { view: view.clone() }
            }
        };

        for (name, view) in source_views {
            let mut ops = Vec::new();
            let action = match target_views.get(name) {
                None => {
                    self.create_view_ops(name, view, materialized, &mut ops);
                    "CREATE"
                }
                Some(existing) if existing.definition != view.definition => {
                    if self.dropped_views.insert(name.clone()) {
                        ops.push(drop_op(name));
                    }
                    self.create_view_ops(name, view, materialized, &mut ops);
                    "ALTER"
                }
                Some(existing) => {
                    if self.dropped_views.contains(name) {
                        self.create_view_ops(name, view, materialized, &mut ops);
                    } else {
                        if materialized {
                            self.diff_indexes(name, &view.indexes, &existing.indexes, &mut ops);
                        }
                        self.diff_table_privileges(
                            GrantObject::Table(name.clone()),
                            &view.privileges,
                            &existing.privileges,
                            &mut ops,
                        );
                        if view.owner != existing.owner {
                            ops.push(ChangeOperation::ChangeOwner {
                                object: if materialized {
                                    OwnedObject::MaterializedView(name.clone())
                                } else {
                                    OwnedObject::View(name.clone())
                                },
                                owner: view.owner.clone(),
                            });
                        }
                    }
                    "ALTER"
                }
            };
            let mut block = ChangeBlock::new(format!("{} {} {}", action, kind, name));
            block.operations = ops;
            self.push(block);
        }

        if self.options.drop_missing_view {
            for name in target_views.keys() {
                if !source_views.contains_key(name) && !self.dropped_views.contains(name) {
                    let mut block = ChangeBlock::new(format!("DROP {} {}", kind, name));
                    block.operations.push(drop_op(name));
                    self.push(block);
                }
            }
        }
    }

    fn diff_functions(&mut self) {
        let (source, target) = (self.source, self.target);

        for (name, function) in &source.functions {
            let mut ops = Vec::new();
            let create = |ops: &mut Vec<ChangeOperation>| {
                ops.push(ChangeOperation::CreateFunction {
                    function: name.clone(),
                    definition: function.definition.clone(),
                });
                if !function.owner.is_empty() {
                    ops.push(ChangeOperation::ChangeOwner {
                        object: OwnedObject::Function(name.clone()),
                        owner: function.owner.clone(),
                    });
                }
            };

            let (action, target_privileges) = match target.functions.get(name) {
                None => {
                    create(&mut ops);
                    ("CREATE", None)
                }
                Some(existing) if existing.definition != function.definition => {
                    ops.push(ChangeOperation::DropFunction { function: name.clone() });
                    create(&mut ops);
                    ("ALTER", None)
                }
                Some(existing) => {
                    if function.owner != existing.owner {
                        ops.push(ChangeOperation::ChangeOwner {
                            object: OwnedObject::Function(name.clone()),
                            owner: function.owner.clone(),
                        });
                    }
                    ("ALTER", Some(&existing.privileges))
                }
            };

            let changes = match target_privileges {
                Some(existing) => self.privilege_changes(&function.privileges, existing),
                None => self.privilege_changes(
                    &granted_to_others(&function.privileges, &function.owner),
                    &Privileges::new(),
                ),
            };
            for (role, changes) in changes {
                ops.push(ChangeOperation::GrantFunctionChange {
                    function: name.clone(),
                    role,
                    changes,
                });
            }

            let mut block = ChangeBlock::new(format!("{} FUNCTION {}", action, name));
            block.operations = ops;
            self.push(block);
        }

        if self.options.drop_missing_function {
            for name in target.functions.keys() {
                if !source.functions.contains_key(name) {
                    let mut block = ChangeBlock::new(format!("DROP FUNCTION {}", name));
                    block.operations.push(ChangeOperation::DropFunction { function: name.clone() });
                    self.push(block);
                }
            }
        }
    }

    /// Owned sequences are created with their serial column; only alterations are diffed.
    fn diff_sequences(&mut self) {
        let (source, target) = (self.source, self.target);

        for (name, sequence) in &source.sequences {
            let Some(existing) = target.sequences.get(name) else {
                continue;
            };
            let mut ops = Vec::new();
            if !sequence.same_parameters(existing) {
                ops.push(ChangeOperation::AlterSequence {
                    sequence: name.clone(),
                    definition: sequence.clone(),
                });
            }
            self.diff_table_privileges(
                GrantObject::Sequence(name.clone()),
                &sequence.privileges,
                &existing.privileges,
                &mut ops,
            );
            if sequence.owner != existing.owner {
                ops.push(ChangeOperation::ChangeOwner {
                    object: OwnedObject::Sequence(name.clone()),
                    owner: sequence.owner.clone(),
                });
            }
            let mut block = ChangeBlock::new(format!("ALTER SEQUENCE {}", name));
            block.operations = ops;
            self.push(block);
        }
    }
}

/// Privileges of every role except `owner`, who holds them all on a new object.
fn granted_to_others(privileges: &Privileges, owner: &str) -> Privileges {
    privileges
        .iter()
        .filter(|(role, _)| role.as_str() != owner)
        .map(|(role, set)| (role.clone(), set.clone()))
        .collect()
}

fn column_changes(source: &ColumnDef, target: &ColumnDef) -> ColumnChanges {
    let identity = match (source.identity, target.identity) {
        (Some(wanted), None) => Some(IdentityChange::Add(wanted)),
        (Some(wanted), Some(current)) if wanted != current => Some(IdentityChange::Set(wanted)),
        (None, Some(_)) => Some(IdentityChange::Drop),
        _ => None,
    };
    ColumnChanges {
        nullable: source.nullable != target.nullable,
        data_type: !source.same_type(target),
        default: source.default != target.default,
        identity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{render, WARN_SET_NOT_NULL};
    use crate::progress::NoProgress;
    use crate::snapshot::{
        ConstraintDef, FunctionDef, FunctionName, Identity, PrivilegeSet, SchemaDef,
        SequenceDef, ViewDependency,
    };

    fn column(data_type: &str, nullable: bool) -> ColumnDef {
        ColumnDef {
            nullable,
            data_type: data_type.to_string(),
            data_type_id: 0,
            data_type_category: if data_type == "int4" { 'N' } else { 'S' },
            precision: None,
            scale: None,
            default: None,
            identity: None,
        }
    }

    fn t() -> QualifiedName {
        QualifiedName::new("public", "t")
    }

    fn table_t() -> TableDef {
        let mut table = TableDef {
            owner: "app".to_string(),
            ..Default::default()
        };
        table.columns.insert("id".to_string(), column("int4", false));
        table.columns.insert("name".to_string(), column("varchar", true));
        table
    }

    fn privileges(granted: &[Privilege]) -> PrivilegeSet {
        Privilege::TABLE
            .iter()
            .map(|p| (*p, granted.contains(p)))
            .collect()
    }

    fn rich_snapshot() -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::default();
        snapshot.schemas.insert("public".to_string(), SchemaDef { owner: "postgres".to_string() });

        let mut table = table_t();
        table.constraints.insert(
            "t_pkey".to_string(),
            ConstraintDef {
                constraint_type: "p".to_string(),
                definition: "PRIMARY KEY (id)".to_string(),
            },
        );
        table.indexes.insert(
            "t_name_idx".to_string(),
            IndexDef {
                definition: "CREATE INDEX t_name_idx ON public.t USING btree (name)".to_string(),
            },
        );
        table
            .privileges
            .insert("reader".to_string(), privileges(&[Privilege::Select]));
        snapshot.tables.insert(t(), table);

        let view = ViewDef {
            definition: " SELECT t.name FROM t;".to_string(),
            owner: "app".to_string(),
            dependencies: vec![ViewDependency {
                schema: "public".to_string(),
                table: "t".to_string(),
                column: "name".to_string(),
            }],
            ..Default::default()
        };
        snapshot.views.insert(QualifiedName::new("public", "v"), view);

        let mut function_privileges = Privileges::new();
        function_privileges.insert(
            "reader".to_string(),
            [(Privilege::Execute, true)].into_iter().collect(),
        );
        snapshot.functions.insert(
            FunctionName::new(QualifiedName::new("public", "f"), "integer"),
            FunctionDef {
                definition: "CREATE OR REPLACE FUNCTION public.f(integer) ...".to_string(),
                owner: "app".to_string(),
                arg_types: "integer".to_string(),
                privileges: function_privileges,
            },
        );
        snapshot.sequences.insert(
            QualifiedName::new("public", "t_id_seq"),
            SequenceDef {
                owner: "app".to_string(),
                start_value: 1,
                min_value: 1,
                max_value: i64::MAX,
                increment: 1,
                cache_size: 1,
                is_cycle: false,
                owned_by: Some("t.id".to_string()),
                privileges: Privileges::new(),
            },
        );
        snapshot
    }

    fn diff(source: &SchemaSnapshot, target: &SchemaSnapshot) -> Vec<ChangeBlock> {
        compare_schemas(source, target, &DiffOptions::default(), &NoProgress)
    }

    fn ops(blocks: &[ChangeBlock]) -> Vec<&ChangeOperation> {
        blocks.iter().flat_map(|b| b.operations.iter()).collect()
    }

    #[test]
    fn test_references_column() {
        assert!(references_column("PRIMARY KEY (id)", "id"));
        assert!(references_column("UNIQUE (id, name)", "id"));
        assert!(references_column(
            "CREATE INDEX i ON public.t USING btree (\"Mixed Case\")",
            "Mixed Case"
        ));
        assert!(!references_column("PRIMARY KEY (id)", "name"));
        assert!(!references_column("CHECK stuff", "stuff"));
        assert!(!references_column("CHECK ((qty > 0))", "qty"));
    }

    #[test]
    fn test_self_comparison_is_empty() {
        let snapshot = rich_snapshot();
        assert!(diff(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_missing_table_is_created_in_one_operation() {
        let mut source = SchemaSnapshot::default();
        source.tables.insert(t(), table_t());
        let target = SchemaSnapshot::default();

        let blocks = diff(&source, &target);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label, "CREATE TABLE \"public\".\"t\"");
        assert_eq!(blocks[0].operations.len(), 1);
        assert!(matches!(blocks[0].operations[0], ChangeOperation::CreateTable { .. }));

        let sql = render(&blocks[0].operations[0], false);
        assert!(sql.contains("CREATE TABLE \"public\".\"t\""));
        assert!(sql.contains("\"id\" int4 NOT NULL"));
        assert!(sql.contains("\"name\" varchar NULL"));
    }

    #[test]
    fn test_nullable_to_not_null_without_default() {
        let mut source = SchemaSnapshot::default();
        let mut target = SchemaSnapshot::default();
        let mut table = table_t();
        target.tables.insert(t(), table.clone());
        table.columns.get_mut("name").unwrap().nullable = false;
        source.tables.insert(t(), table);

        let blocks = diff(&source, &target);
        let all = ops(&blocks);
        assert_eq!(all.len(), 1);
        assert!(matches!(all[0], ChangeOperation::AlterColumn { column, .. } if column == "name"));

        let sql = render(all[0], true);
        assert!(sql.contains("SET NOT NULL"));
        assert!(sql.contains(WARN_SET_NOT_NULL));
    }

    #[test]
    fn test_type_change_cascades_dependents_before_alter() {
        let target = rich_snapshot();
        let mut source = target.clone();
        source
            .tables
            .get_mut(&t())
            .unwrap()
            .columns
            .get_mut("name")
            .unwrap()
            .data_type = "text".to_string();

        let blocks = diff(&source, &target);
        let table_ops = &blocks[0].operations;
        let position = |pred: &dyn Fn(&ChangeOperation) -> bool| table_ops.iter().position(pred);

        let drop_index = position(&|op| matches!(op, ChangeOperation::DropIndex { index } if index.name == "t_name_idx")).unwrap();
        let drop_view = position(&|op| matches!(op, ChangeOperation::DropView { .. })).unwrap();
        let alter = position(&|op| matches!(op, ChangeOperation::AlterColumn { .. })).unwrap();
        let recreate_index = position(&|op| matches!(op, ChangeOperation::CreateIndex { index, .. } if index.name == "t_name_idx")).unwrap();

        assert!(drop_index < alter);
        assert!(drop_view < alter);
        assert!(alter < recreate_index);
        // The primary key does not mention `name` and stays untouched.
        assert!(!table_ops.iter().any(|op| matches!(op, ChangeOperation::DropConstraint { .. })));

        // The view is recreated in its own block, not dropped a second time.
        let view_block = blocks.iter().find(|b| b.label.contains("VIEW")).unwrap();
        assert_eq!(view_block.label, "ALTER VIEW \"public\".\"v\"");
        assert!(matches!(view_block.operations[0], ChangeOperation::CreateView { .. }));
        assert!(!view_block.operations.iter().any(|op| matches!(op, ChangeOperation::DropView { .. })));
    }

    #[test]
    fn test_constraint_on_altered_column_is_dropped_once_and_readded() {
        let target = rich_snapshot();
        let mut source = target.clone();
        let table = source.tables.get_mut(&t()).unwrap();
        table.columns.get_mut("id").unwrap().data_type = "int8".to_string();
        table.constraints.get_mut("t_pkey").unwrap().definition = "PRIMARY KEY (id) DEFERRABLE".to_string();

        let blocks = diff(&source, &target);
        let table_ops = &blocks[0].operations;
        let drops = table_ops
            .iter()
            .filter(|op| matches!(op, ChangeOperation::DropConstraint { name, .. } if name == "t_pkey"))
            .count();
        let adds: Vec<usize> = table_ops
            .iter()
            .enumerate()
            .filter(|(_, op)| matches!(op, ChangeOperation::AddConstraint { name, .. } if name == "t_pkey"))
            .map(|(i, _)| i)
            .collect();
        let alter = table_ops
            .iter()
            .position(|op| matches!(op, ChangeOperation::AlterColumn { .. }))
            .unwrap();
        assert_eq!(drops, 1);
        assert_eq!(adds.len(), 1);
        assert!(adds[0] > alter);
    }

    #[test]
    fn test_target_only_objects_respect_drop_policy() {
        let target = rich_snapshot();
        let mut source = target.clone();
        source.tables.clear();
        source.views.clear();
        source.functions.clear();
        source.sequences.clear();

        assert!(diff(&source, &target).is_empty());

        let options = DiffOptions {
            drop_missing_table: true,
            drop_missing_view: true,
            drop_missing_function: true,
            ..Default::default()
        };
        let blocks = compare_schemas(&source, &target, &options, &NoProgress);
        let labels: Vec<&str> = blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "DROP TABLE \"public\".\"t\"",
                "DROP VIEW \"public\".\"v\"",
                "DROP FUNCTION \"public\".\"f\"(integer)",
            ]
        );
    }

    #[test]
    fn test_privileges_diff_per_capability_and_role_filter() {
        let target = rich_snapshot();
        let mut source = target.clone();
        let table = source.tables.get_mut(&t()).unwrap();
        table.privileges.insert(
            "reader".to_string(),
            privileges(&[Privilege::Select, Privilege::Insert]),
        );
        table
            .privileges
            .insert("writer".to_string(), privileges(&[Privilege::Update]));

        let blocks = diff(&source, &target);
        let grants: Vec<_> = ops(&blocks)
            .into_iter()
            .filter_map(|op| match op {
                ChangeOperation::GrantChange { role, changes, .. } => Some((role.clone(), changes.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            grants,
            vec![
                ("reader".to_string(), vec![(Privilege::Insert, true)]),
                ("writer".to_string(), vec![(Privilege::Update, true)]),
            ]
        );

        let options = DiffOptions {
            roles: vec!["writer".to_string()],
            ..Default::default()
        };
        let blocks = compare_schemas(&source, &target, &options, &NoProgress);
        assert_eq!(ops(&blocks).len(), 1);
    }

    #[test]
    fn test_new_objects_do_not_grant_to_their_owner() {
        let mut source = rich_snapshot();
        let owner_all = privileges(&Privilege::TABLE);
        source
            .tables
            .get_mut(&t())
            .unwrap()
            .privileges
            .insert("app".to_string(), owner_all.clone());
        let view = source.views.get_mut(&QualifiedName::new("public", "v")).unwrap();
        view.privileges.insert("app".to_string(), owner_all);
        view.privileges
            .insert("reader".to_string(), privileges(&[Privilege::Select]));
        let f = FunctionName::new(QualifiedName::new("public", "f"), "integer");
        source.functions.get_mut(&f).unwrap().privileges.insert(
            "app".to_string(),
            [(Privilege::Execute, true)].into_iter().collect(),
        );
        let mut target = SchemaSnapshot::default();
        target.schemas = source.schemas.clone();

        let blocks = diff(&source, &target);
        let all = ops(&blocks);
        let created = all
            .iter()
            .find_map(|op| match op {
                ChangeOperation::CreateTable { definition, .. } => Some(definition),
                _ => None,
            })
            .unwrap();
        assert!(!created.privileges.contains_key("app"));
        assert!(created.privileges.contains_key("reader"));

        let grantees: Vec<&str> = all
            .iter()
            .filter_map(|op| match op {
                ChangeOperation::GrantChange { role, .. }
                | ChangeOperation::GrantFunctionChange { role, .. } => Some(role.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(grantees, vec!["reader", "reader"]);
    }

    #[test]
    fn test_changed_function_is_dropped_and_recreated() {
        let target = rich_snapshot();
        let mut source = target.clone();
        let name = FunctionName::new(QualifiedName::new("public", "f"), "integer");
        source.functions.get_mut(&name).unwrap().definition =
            "CREATE OR REPLACE FUNCTION public.f(integer) -- v2".to_string();

        let blocks = diff(&source, &target);
        assert_eq!(blocks.len(), 1);
        let ops = &blocks[0].operations;
        assert!(matches!(ops[0], ChangeOperation::DropFunction { .. }));
        assert!(matches!(ops[1], ChangeOperation::CreateFunction { .. }));
        assert!(ops.iter().any(|op| matches!(op, ChangeOperation::GrantFunctionChange { .. })));
    }

    #[test]
    fn test_new_schema_and_column_and_oids() {
        let target = rich_snapshot();
        let mut source = target.clone();
        source.schemas.insert("sales".to_string(), SchemaDef { owner: "app".to_string() });
        let table = source.tables.get_mut(&t()).unwrap();
        table.columns.insert("note".to_string(), column("text", true));
        table.options.with_oids = true;

        let blocks = diff(&source, &target);
        assert_eq!(blocks[0].label, "CREATE SCHEMA \"sales\"");
        assert_eq!(blocks[1].label, "ALTER TABLE \"public\".\"t\"");
        assert!(matches!(blocks[1].operations[0], ChangeOperation::AddColumn { ref column, .. } if column == "note"));
        assert!(blocks[1]
            .operations
            .iter()
            .any(|op| matches!(op, ChangeOperation::SetOids { with_oids: true, .. })));
    }

    #[test]
    fn test_identity_and_sequence_changes() {
        let target = rich_snapshot();
        let mut source = target.clone();
        source
            .tables
            .get_mut(&t())
            .unwrap()
            .columns
            .get_mut("id")
            .unwrap()
            .identity = Some(Identity::Always);
        source
            .sequences
            .get_mut(&QualifiedName::new("public", "t_id_seq"))
            .unwrap()
            .increment = 10;

        let blocks = diff(&source, &target);
        assert!(ops(&blocks).iter().any(|op| matches!(
            op,
            ChangeOperation::AlterColumn { changes, .. }
                if changes.identity == Some(IdentityChange::Add(Identity::Always))
        )));
        assert_eq!(blocks.last().unwrap().label, "ALTER SEQUENCE \"public\".\"t_id_seq\"");
    }
}
