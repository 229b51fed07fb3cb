//! Row reader: materialize the rows of the tables selected for data comparison.
//!
//! Values are read in PostgreSQL's text form through the simple query
//! protocol, so every column type round-trips without a Rust-side decoder.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::try_join_all;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tokio_postgres::{Client, SimpleQueryMessage};

use crate::config::TableCompareConfig;
use crate::db::{quote_ident, ServerVersion};
use crate::error::{DriftError, Result};
use crate::progress::ProgressSink;
use crate::snapshot::{Identity, QualifiedName};

/// A column of a compared table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type_id: u32,
    /// `pg_type.typcategory`, which decides how a value is written as a literal.
    pub category: char,
}

/// One row, with its key-derived identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub row_hash: String,
    pub values: IndexMap<String, Option<String>>,
}

impl Record {
    /// Build a record and derive its hash from `key_fields`.
    pub fn new(values: IndexMap<String, Option<String>>, key_fields: &[String]) -> Self {
        let keys: Vec<Option<&str>> = key_fields
            .iter()
            .map(|k| values.get(k).and_then(|v| v.as_deref()))
            .collect();
        Self {
            row_hash: row_hash(&keys),
            values,
        }
    }

    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(|v| v.as_deref())
    }
}

/// A sequence feeding one of the table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSequence {
    pub column: String,
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    pub exists: bool,
    pub fields: Vec<Field>,
    pub rows: Vec<Record>,
    pub sequences: Vec<TableSequence>,
}

impl RecordSet {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether inserts must override an `ALWAYS` identity column.
    pub fn has_always_identity(&self) -> bool {
        self.sequences
            .iter()
            .any(|s| s.identity == Some(Identity::Always))
    }
}

/// Hash of the key-field values in declared order.
///
/// Values are length-prefixed and NULL has its own marker, so distinct key
/// tuples never share an encoding.
pub fn row_hash(keys: &[Option<&str>]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        match key {
            Some(value) => {
                hasher.update(b"v");
                hasher.update((value.len() as u64).to_be_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update(b"n"),
        }
    }
    hex::encode(hasher.finalize())
}

/// Read the rows of every configured table, concurrently on one connection.
pub async fn collect_records(
    client: &Client,
    tables: &[TableCompareConfig],
    version: ServerVersion,
    progress: &dyn ProgressSink,
) -> Result<IndexMap<QualifiedName, RecordSet>> {
    let done = AtomicUsize::new(0);
    let total = tables.len();

    let sets = try_join_all(tables.iter().map(|table| {
        let done = &done;
        async move {
            let set = collect_table(client, table, version).await?;
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            progress.report(
                &format!("Collected records for table {}", table.qualified_name()),
                finished as f64 / total as f64,
            );
            Ok::<_, DriftError>((table.qualified_name(), set))
        }
    }))
    .await?;

    Ok(sets.into_iter().collect())
}

async fn collect_table(
    client: &Client,
    table: &TableCompareConfig,
    version: ServerVersion,
) -> Result<RecordSet> {
    let name = table.qualified_name();
    let object = format!("records of {}", name);

    let exists: bool = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = $2)",
            &[&table.table_schema, &table.table_name],
        )
        .await
        .map_err(|e| DriftError::introspection(&object, e))?
        .get(0);
    if !exists {
        tracing::debug!(table = %name, "Table not found");
        return Ok(RecordSet::missing());
    }

    let relation = name.to_string();
    let fields: Vec<Field> = client
        .query(
            "SELECT a.attname::text, a.atttypid, t.typcategory::text \
             FROM pg_attribute a JOIN pg_type t ON t.oid = a.atttypid \
             WHERE a.attrelid = $1::text::regclass AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
            &[&relation],
        )
        .await
        .map_err(|e| DriftError::introspection(&object, e))?
        .iter()
        .map(|row| {
            let category: String = row.get(2);
            Field {
                name: row.get(0),
                data_type_id: row.get(1),
                category: category.chars().next().unwrap_or('X'),
            }
        })
        .collect();

    for key in &table.key_fields {
        if !fields.iter().any(|f| &f.name == key) {
            return Err(DriftError::ConfigError(format!(
                "Key field '{}' does not exist on table {}",
                key, name
            )));
        }
    }

    let sql = select_rows_sql(&name, &fields, &table.key_fields);
    let messages = client
        .simple_query(&sql)
        .await
        .map_err(|e| DriftError::introspection(&object, e))?;

    let mut rows = Vec::new();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            let mut values = IndexMap::with_capacity(fields.len());
            for (i, field) in fields.iter().enumerate() {
                let value = row
                    .try_get(i)
                    .map_err(|e| DriftError::introspection(&object, e))?;
                values.insert(field.name.clone(), value.map(str::to_string));
            }
            rows.push(Record::new(values, &table.key_fields));
        }
    }

    let sequences = collect_sequences(client, &relation, version)
        .await
        .map_err(|e| DriftError::introspection(&object, e))?;

    tracing::debug!(table = %name, rows = rows.len(), "Collected records");

    Ok(RecordSet {
        exists: true,
        fields,
        rows,
        sequences,
    })
}

fn select_rows_sql(table: &QualifiedName, fields: &[Field], key_fields: &[String]) -> String {
    let columns: Vec<String> = fields.iter().map(|f| quote_ident(&f.name)).collect();
    let order: Vec<String> = key_fields.iter().map(|k| quote_ident(k)).collect();
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    sql
}

async fn collect_sequences(
    client: &Client,
    relation: &str,
    version: ServerVersion,
) -> std::result::Result<Vec<TableSequence>, tokio_postgres::Error> {
    let identity = if version.at_least(10, 0) {
        "NULLIF(a.attidentity::text, '')"
    } else {
        "NULL::text"
    };
    let sql = format!(
        "SELECT a.attname::text, {identity} \
         FROM pg_attribute a \
         WHERE a.attrelid = $1::text::regclass AND a.attnum > 0 AND NOT a.attisdropped \
           AND pg_get_serial_sequence($1, a.attname) IS NOT NULL \
         ORDER BY a.attnum",
        identity = identity,
    );
    let rows = client.query(&sql, &[&relation]).await?;
    Ok(rows
        .iter()
        .map(|row| TableSequence {
            column: row.get(0),
            identity: row
                .get::<_, Option<String>>(1)
                .as_deref()
                .and_then(Identity::from_catalog),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_hash_is_stable_and_distinguishes_tuples() {
        assert_eq!(row_hash(&[Some("1")]), row_hash(&[Some("1")]));
        assert_ne!(row_hash(&[Some("1")]), row_hash(&[Some("2")]));
        assert_ne!(
            row_hash(&[Some("a,b"), Some("c")]),
            row_hash(&[Some("a"), Some("b,c")])
        );
        assert_ne!(row_hash(&[None]), row_hash(&[Some("")]));
        assert_ne!(row_hash(&[None]), row_hash(&[Some("n")]));
        assert_eq!(row_hash(&[Some("1")]).len(), 64);
    }

    #[test]
    fn test_record_hash_uses_key_fields_only() {
        let keys = vec!["id".to_string()];
        let mut a = IndexMap::new();
        a.insert("id".to_string(), Some("7".to_string()));
        a.insert("name".to_string(), Some("x".to_string()));
        let mut b = a.clone();
        b.insert("name".to_string(), Some("y".to_string()));

        assert_eq!(Record::new(a, &keys).row_hash, Record::new(b, &keys).row_hash);
    }

    #[test]
    fn test_select_rows_orders_by_key() {
        let fields = vec![
            Field { name: "id".to_string(), data_type_id: 23, category: 'N' },
            Field { name: "Label".to_string(), data_type_id: 25, category: 'S' },
        ];
        let sql = select_rows_sql(
            &QualifiedName::new("public", "t"),
            &fields,
            &["id".to_string()],
        );
        assert_eq!(sql, "SELECT \"id\", \"Label\" FROM \"public\".\"t\" ORDER BY \"id\"");
    }

    #[test]
    fn test_always_identity_detection() {
        let mut set = RecordSet::missing();
        assert!(!set.has_always_identity());
        set.sequences.push(TableSequence { column: "id".to_string(), identity: None });
        assert!(!set.has_always_identity());
        set.sequences.push(TableSequence {
            column: "code".to_string(),
            identity: Some(Identity::Always),
        });
        assert!(set.has_always_identity());
    }
}
