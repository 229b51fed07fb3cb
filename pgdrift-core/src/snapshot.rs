//! Schema snapshot: the point-in-time description of one database's compared objects.
//!
//! Maps are insertion-ordered ([`IndexMap`]) and filled from catalog queries that
//! carry an `ORDER BY`, so iterating a snapshot is deterministic.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;

use crate::db::quote_ident;

/// A schema-qualified object name. Displays as `"schema"."name"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

/// Functions are overloaded by argument types, so those are part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionName {
    pub name: QualifiedName,
    pub arg_types: String,
}

impl FunctionName {
    pub fn new(name: QualifiedName, arg_types: impl Into<String>) -> Self {
        Self {
            name,
            arg_types: arg_types.into(),
        }
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.arg_types)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    References,
    Trigger,
    Execute,
    Usage,
}

impl Privilege {
    pub const TABLE: [Privilege; 7] = [
        Privilege::Select,
        Privilege::Insert,
        Privilege::Update,
        Privilege::Delete,
        Privilege::Truncate,
        Privilege::References,
        Privilege::Trigger,
    ];
    pub const FUNCTION: [Privilege; 1] = [Privilege::Execute];
    pub const SEQUENCE: [Privilege; 3] = [Privilege::Select, Privilege::Usage, Privilege::Update];

    pub fn as_sql(&self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::Truncate => "TRUNCATE",
            Privilege::References => "REFERENCES",
            Privilege::Trigger => "TRIGGER",
            Privilege::Execute => "EXECUTE",
            Privilege::Usage => "USAGE",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Capability → granted, for one role on one object.
pub type PrivilegeSet = BTreeMap<Privilege, bool>;

/// Role name → privileges held on an object.
pub type Privileges = IndexMap<String, PrivilegeSet>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    pub schemas: IndexMap<String, SchemaDef>,
    pub tables: IndexMap<QualifiedName, TableDef>,
    pub views: IndexMap<QualifiedName, ViewDef>,
    pub materialized_views: IndexMap<QualifiedName, ViewDef>,
    pub functions: IndexMap<FunctionName, FunctionDef>,
    pub sequences: IndexMap<QualifiedName, SequenceDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDef {
    pub owner: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableDef {
    pub columns: IndexMap<String, ColumnDef>,
    pub constraints: IndexMap<String, ConstraintDef>,
    pub indexes: IndexMap<String, IndexDef>,
    pub privileges: Privileges,
    pub options: TableOptions,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub with_oids: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Always,
    ByDefault,
}

impl Identity {
    /// Decode `pg_attribute.attidentity`.
    pub fn from_catalog(flag: &str) -> Option<Self> {
        match flag {
            "a" => Some(Identity::Always),
            "d" => Some(Identity::ByDefault),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Identity::Always => "ALWAYS",
            Identity::ByDefault => "BY DEFAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub nullable: bool,
    pub data_type: String,
    pub data_type_id: u32,
    pub data_type_category: char,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub default: Option<String>,
    pub identity: Option<Identity>,
}

impl ColumnDef {
    /// Type name with its modifiers, e.g. `varchar(20)` or `numeric(10,2)`.
    pub fn type_sql(&self) -> String {
        match (self.precision, self.scale) {
            (Some(p), Some(s)) => format!("{}({},{})", self.data_type, p, s),
            (Some(p), None) => format!("{}({})", self.data_type, p),
            _ => self.data_type.clone(),
        }
    }

    pub fn same_type(&self, other: &ColumnDef) -> bool {
        self.data_type == other.data_type
            && self.precision == other.precision
            && self.scale == other.scale
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDef {
    /// `pg_constraint.contype`: p, f, u, c, x.
    pub constraint_type: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub definition: String,
}

/// A (table, column) pair a view reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDependency {
    pub schema: String,
    pub table: String,
    pub column: String,
}

/// Plain and materialized views share a definition shape; only materialized
/// views carry indexes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewDef {
    pub definition: String,
    pub owner: String,
    pub privileges: Privileges,
    pub dependencies: Vec<ViewDependency>,
    pub indexes: IndexMap<String, IndexDef>,
}

impl ViewDef {
    pub fn depends_on(&self, table: &QualifiedName, column: &str) -> bool {
        self.dependencies
            .iter()
            .any(|d| d.schema == table.schema && d.table == table.name && d.column == column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub definition: String,
    pub owner: String,
    pub arg_types: String,
    pub privileges: Privileges,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDef {
    pub owner: String,
    pub start_value: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub increment: i64,
    pub cache_size: i64,
    pub is_cycle: bool,
    /// `table.column` owning the sequence.
    pub owned_by: Option<String>,
    pub privileges: Privileges,
}

impl SequenceDef {
    pub fn same_parameters(&self, other: &SequenceDef) -> bool {
        self.start_value == other.start_value
            && self.min_value == other.min_value
            && self.max_value == other.max_value
            && self.increment == other.increment
            && self.cache_size == other.cache_size
            && self.is_cycle == other.is_cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name_display_quotes_both_parts() {
        assert_eq!(QualifiedName::new("public", "t").to_string(), "\"public\".\"t\"");
        assert_eq!(
            QualifiedName::new("My Schema", "a\"b").to_string(),
            "\"My Schema\".\"a\"\"b\""
        );
    }

    #[test]
    fn test_function_name_includes_arguments() {
        let f = FunctionName::new(QualifiedName::new("public", "add"), "integer, integer");
        assert_eq!(f.to_string(), "\"public\".\"add\"(integer, integer)");
    }

    #[test]
    fn test_column_type_sql() {
        let mut col = ColumnDef {
            nullable: true,
            data_type: "numeric".to_string(),
            data_type_id: 1700,
            data_type_category: 'N',
            precision: Some(10),
            scale: Some(2),
            default: None,
            identity: None,
        };
        assert_eq!(col.type_sql(), "numeric(10,2)");
        col.scale = None;
        assert_eq!(col.type_sql(), "numeric(10)");
        col.precision = None;
        assert_eq!(col.type_sql(), "numeric");
    }

    #[test]
    fn test_view_dependency_lookup() {
        let view = ViewDef {
            dependencies: vec![ViewDependency {
                schema: "public".to_string(),
                table: "t".to_string(),
                column: "name".to_string(),
            }],
            ..Default::default()
        };
        let t = QualifiedName::new("public", "t");
        assert!(view.depends_on(&t, "name"));
        assert!(!view.depends_on(&t, "id"));
        assert!(!view.depends_on(&QualifiedName::new("other", "t"), "name"));
    }
}
