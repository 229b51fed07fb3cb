//! Typed change operations produced by the diff engines.
//!
//! An operation carries only what the emitter needs to render it; it is not SQL.

use std::collections::{HashMap, HashSet};

use crate::snapshot::{
    ColumnDef, ConstraintDef, FunctionName, Identity, Privilege, QualifiedName, SequenceDef,
    TableDef,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOperation {
    CreateSchema {
        schema: String,
        owner: String,
    },
    CreateTable {
        table: QualifiedName,
        definition: TableDef,
    },
    DropTable {
        table: QualifiedName,
    },
    AddColumn {
        table: QualifiedName,
        column: String,
        definition: ColumnDef,
    },
    AlterColumn {
        table: QualifiedName,
        column: String,
        /// Desired (source) definition.
        definition: ColumnDef,
        changes: ColumnChanges,
    },
    DropColumn {
        table: QualifiedName,
        column: String,
    },
    AddConstraint {
        table: QualifiedName,
        name: String,
        definition: ConstraintDef,
    },
    DropConstraint {
        table: QualifiedName,
        name: String,
    },
    CreateIndex {
        index: QualifiedName,
        definition: String,
    },
    /// Drop and recreate an index whose definition changed.
    ChangeIndex {
        index: QualifiedName,
        definition: String,
    },
    DropIndex {
        index: QualifiedName,
    },
    SetOids {
        table: QualifiedName,
        with_oids: bool,
    },
    GrantChange {
        object: GrantObject,
        role: String,
        changes: Vec<(Privilege, bool)>,
    },
    GrantFunctionChange {
        function: FunctionName,
        role: String,
        changes: Vec<(Privilege, bool)>,
    },
    ChangeOwner {
        object: OwnedObject,
        owner: String,
    },
    CreateView {
        view: QualifiedName,
        definition: String,
    },
    DropView {
        view: QualifiedName,
    },
    CreateMaterializedView {
        view: QualifiedName,
        definition: String,
    },
    DropMaterializedView {
        view: QualifiedName,
    },
    CreateFunction {
        function: FunctionName,
        definition: String,
    },
    DropFunction {
        function: FunctionName,
    },
    AlterSequence {
        sequence: QualifiedName,
        definition: SequenceDef,
    },
    InsertRow {
        table: QualifiedName,
        values: Vec<ColumnValue>,
        overriding_system_value: bool,
    },
    UpdateRow {
        table: QualifiedName,
        changes: Vec<ColumnValue>,
        keys: Vec<ColumnValue>,
    },
    DeleteRow {
        table: QualifiedName,
        keys: Vec<ColumnValue>,
    },
    RebaseSequence {
        table: QualifiedName,
        column: String,
    },
    /// A data anomaly reported inline in the patch.
    ErrorComment {
        message: String,
    },
}

/// Which aspects of a column differ between source and target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnChanges {
    pub nullable: bool,
    pub data_type: bool,
    pub default: bool,
    pub identity: Option<IdentityChange>,
}

impl ColumnChanges {
    pub fn any(&self) -> bool {
        self.nullable || self.data_type || self.default || self.identity.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    Add(Identity),
    Set(Identity),
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantObject {
    /// Tables, views and materialized views all grant `ON TABLE`.
    Table(QualifiedName),
    Sequence(QualifiedName),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedObject {
    Table(QualifiedName),
    View(QualifiedName),
    MaterializedView(QualifiedName),
    Function(FunctionName),
    Sequence(QualifiedName),
}

/// One column's value in a row operation, with the type category that decides
/// how it is written as a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnValue {
    pub name: String,
    pub category: char,
    pub value: Option<String>,
}

impl ColumnValue {
    pub fn new(name: impl Into<String>, category: char, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            category,
            value,
        }
    }
}

/// Operations that belong together under one `--- BEGIN label ---` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBlock {
    pub label: String,
    pub operations: Vec<ChangeOperation>,
}

impl ChangeBlock {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            operations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Columns added by a structural diff, per table.
///
/// The data diff treats values for these columns as changes even though the
/// target rows do not have them yet.
pub fn added_columns(blocks: &[ChangeBlock]) -> HashMap<QualifiedName, HashSet<String>> {
    let mut added: HashMap<QualifiedName, HashSet<String>> = HashMap::new();
    for op in blocks.iter().flat_map(|b| b.operations.iter()) {
        if let ChangeOperation::AddColumn { table, column, .. } = op {
            added.entry(table.clone()).or_default().insert(column.clone());
        }
    }
    added
}
