//! Catalog reader: build a [`SchemaSnapshot`] from the PostgreSQL system catalogs.
//!
//! Each object category is read with one query covering every requested
//! schema, and the queries run concurrently on the same connection. Objects
//! that belong to an installed extension are skipped.

use tokio_postgres::{Client, Row};

use crate::db::ServerVersion;
use crate::error::{DriftError, Result};
use crate::progress::{ProgressSink, Steps};
use crate::snapshot::{
    ColumnDef, ConstraintDef, FunctionDef, FunctionName, Identity, IndexDef, Privilege,
    PrivilegeSet, QualifiedName, SchemaDef, SchemaSnapshot, SequenceDef, TableDef, TableOptions,
    ViewDef, ViewDependency,
};

const NOT_EXTENSION_MEMBER: &str =
    "NOT EXISTS (SELECT 1 FROM pg_depend e WHERE e.objid = c.oid AND e.deptype = 'e')";

/// Every schema except `pg_*` and `information_schema`.
pub async fn discover_schemas(client: &Client) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT nspname::text FROM pg_namespace \
             WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema' \
             ORDER BY nspname",
            &[],
        )
        .await
        .map_err(|e| DriftError::introspection("schemas", e))?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Read a snapshot of `namespaces`. An empty list means every user schema.
pub async fn collect(
    client: &Client,
    namespaces: &[String],
    version: ServerVersion,
    progress: &dyn ProgressSink,
) -> Result<SchemaSnapshot> {
    let discovered;
    let namespaces = if namespaces.is_empty() {
        discovered = discover_schemas(client).await?;
        tracing::debug!(schemas = ?discovered, "Discovered schemas");
        &discovered[..]
    } else {
        namespaces
    };

    let mut steps = Steps::new(progress, 7);
    let mut snapshot = SchemaSnapshot::default();

    let (schemas_sql, tables_sql, columns_sql, constraints_sql) = (
        schemas_sql(),
        tables_sql(version),
        columns_sql(version),
        constraints_sql(),
    );
    let (schemas, tables, columns, constraints) = tokio::try_join!(
        fetch(client, "schemas", &schemas_sql, namespaces),
        fetch(client, "tables", &tables_sql, namespaces),
        fetch(client, "columns", &columns_sql, namespaces),
        fetch(client, "constraints", &constraints_sql, namespaces),
    )?;

    for row in &schemas {
        snapshot.schemas.insert(row.get(0), SchemaDef { owner: row.get(1) });
    }
    steps.advance("Collected schemas");

    for row in &tables {
        snapshot.tables.insert(
            QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1)),
            TableDef {
                owner: row.get(2),
                options: TableOptions { with_oids: row.get(3) },
                ..Default::default()
            },
        );
    }
    for row in &columns {
        let Some(table) = snapshot.tables.get_mut(&row_name(row)) else {
            continue;
        };
        let (name, column) = column_from_row(row);
        table.columns.insert(name, column);
    }
    for row in &constraints {
        let Some(table) = snapshot.tables.get_mut(&row_name(row)) else {
            continue;
        };
        table.constraints.insert(
            row.get(2),
            ConstraintDef {
                constraint_type: row.get(3),
                definition: row.get(4),
            },
        );
    }
    steps.advance("Collected tables");

    let (views_sql, dependencies_sql, indexes_sql, privileges_sql) = (
        views_sql(),
        view_dependencies_sql(),
        indexes_sql(),
        relation_privileges_sql(),
    );
    let (views, dependencies, indexes, relation_privileges) = tokio::try_join!(
        fetch(client, "views", &views_sql, namespaces),
        fetch(client, "view dependencies", &dependencies_sql, namespaces),
        fetch(client, "indexes", &indexes_sql, namespaces),
        fetch(client, "table privileges", &privileges_sql, namespaces),
    )?;

    for row in &views {
        let name = row_name(row);
        let kind: String = row.get(4);
        let view = ViewDef {
            owner: row.get(2),
            definition: row.get(3),
            ..Default::default()
        };
        if kind == "m" {
            snapshot.materialized_views.insert(name, view);
        } else {
            snapshot.views.insert(name, view);
        }
    }
    for row in &dependencies {
        let name = row_name(row);
        let dependency = ViewDependency {
            schema: row.get(2),
            table: row.get(3),
            column: row.get(4),
        };
        if let Some(view) = snapshot.views.get_mut(&name) {
            view.dependencies.push(dependency);
        } else if let Some(view) = snapshot.materialized_views.get_mut(&name) {
            view.dependencies.push(dependency);
        }
    }
    steps.advance("Collected views");

    for row in &indexes {
        let owner = row_name(row);
        let index = IndexDef { definition: row.get(3) };
        if let Some(table) = snapshot.tables.get_mut(&owner) {
            table.indexes.insert(row.get(2), index);
        } else if let Some(view) = snapshot.materialized_views.get_mut(&owner) {
            view.indexes.insert(row.get(2), index);
        }
    }
    steps.advance("Collected indexes");

    for row in &relation_privileges {
        let name = row_name(row);
        let role: String = row.get(2);
        let set = privilege_set(row, 3, &Privilege::TABLE);
        if let Some(table) = snapshot.tables.get_mut(&name) {
            table.privileges.insert(role, set);
        } else if let Some(view) = snapshot.views.get_mut(&name) {
            view.privileges.insert(role, set);
        } else if let Some(view) = snapshot.materialized_views.get_mut(&name) {
            view.privileges.insert(role, set);
        }
    }
    steps.advance("Collected privileges");

    let (functions_sql, function_privileges_sql, sequences_sql, sequence_privileges_sql) = (
        functions_sql(version),
        function_privileges_sql(version),
        sequences_sql(version),
        sequence_privileges_sql(),
    );
    let (functions, function_privileges, sequences, sequence_privileges) = tokio::try_join!(
        fetch(client, "functions", &functions_sql, namespaces),
        fetch(client, "function privileges", &function_privileges_sql, namespaces),
        fetch(client, "sequences", &sequences_sql, namespaces),
        fetch(client, "sequence privileges", &sequence_privileges_sql, namespaces),
    )?;

    for row in &functions {
        let arg_types: String = row.get(4);
        snapshot.functions.insert(
            FunctionName::new(row_name(row), arg_types.clone()),
            FunctionDef {
                definition: row.get(2),
                owner: row.get(3),
                arg_types,
                privileges: Default::default(),
            },
        );
    }
    for row in &function_privileges {
        let name = FunctionName::new(row_name(row), row.get::<_, String>(2));
        if let Some(function) = snapshot.functions.get_mut(&name) {
            function
                .privileges
                .insert(row.get(3), privilege_set(row, 4, &Privilege::FUNCTION));
        }
    }
    steps.advance("Collected functions");

    for row in &sequences {
        let table: String = row.get(3);
        let column: String = row.get(4);
        snapshot.sequences.insert(
            row_name(row),
            SequenceDef {
                owner: row.get(2),
                start_value: row.get(5),
                min_value: row.get(6),
                max_value: row.get(7),
                increment: row.get(8),
                is_cycle: row.get(9),
                cache_size: row.get(10),
                owned_by: Some(format!("{}.{}", table, column)),
                privileges: Default::default(),
            },
        );
    }
    for row in &sequence_privileges {
        if let Some(sequence) = snapshot.sequences.get_mut(&row_name(row)) {
            sequence
                .privileges
                .insert(row.get(2), privilege_set(row, 3, &Privilege::SEQUENCE));
        }
    }
    steps.advance("Collected sequences");

    tracing::debug!(
        schemas = snapshot.schemas.len(),
        tables = snapshot.tables.len(),
        views = snapshot.views.len(),
        materialized_views = snapshot.materialized_views.len(),
        functions = snapshot.functions.len(),
        sequences = snapshot.sequences.len(),
        "Snapshot collected"
    );

    Ok(snapshot)
}

async fn fetch(
    client: &Client,
    object: &str,
    sql: &str,
    namespaces: &[String],
) -> Result<Vec<Row>> {
    client
        .query(sql, &[&namespaces])
        .await
        .map_err(|e| DriftError::introspection(object, e))
}

/// Schema and object name from the first two columns.
fn row_name(row: &Row) -> QualifiedName {
    QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1))
}

fn privilege_set(row: &Row, offset: usize, privileges: &[Privilege]) -> PrivilegeSet {
    privileges
        .iter()
        .enumerate()
        .map(|(i, p)| (*p, row.get::<_, bool>(offset + i)))
        .collect()
}

fn column_from_row(row: &Row) -> (String, ColumnDef) {
    let type_name: String = row.get(4);
    let category: String = row.get(6);
    let identity = row
        .get::<_, Option<String>>(8)
        .as_deref()
        .and_then(Identity::from_catalog);
    let (data_type, default) = normalize_column(&type_name, row.get(7), identity);

    let column = ColumnDef {
        nullable: !row.get::<_, bool>(3),
        data_type,
        data_type_id: row.get(5),
        data_type_category: category.chars().next().unwrap_or('X'),
        precision: row.get(9),
        scale: row.get(10),
        default,
        identity,
    };
    (row.get(2), column)
}

/// Fold sequence-backed defaults into serial pseudo-types and drop the
/// default of identity columns, so both compare equal across databases.
pub(crate) fn normalize_column(
    type_name: &str,
    default: Option<String>,
    identity: Option<Identity>,
) -> (String, Option<String>) {
    if identity.is_some() {
        return (type_name.to_string(), None);
    }
    match default {
        Some(ref expr) if expr.starts_with("nextval") && expr.contains("_seq") => {
            let serial = match type_name {
                "int8" => "bigserial",
                "int2" => "smallserial",
                _ => "serial",
            };
            (serial.to_string(), None)
        }
        _ => (type_name.to_string(), default),
    }
}

/// `has_*_privilege(u.usesysid, <object>, 'CAP')` for each capability.
fn privilege_columns(function: &str, object: &str, privileges: &[Privilege]) -> String {
    privileges
        .iter()
        .map(|p| format!("{}(u.usesysid, {}, '{}')", function, object, p.as_sql()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn schemas_sql() -> String {
    "SELECT n.nspname::text, pg_get_userbyid(n.nspowner)::text \
     FROM pg_namespace n WHERE n.nspname = ANY($1) ORDER BY n.nspname"
        .to_string()
}

fn tables_sql(version: ServerVersion) -> String {
    // relhasoids was removed in PostgreSQL 12
    let oids = if version.at_least(12, 0) { "false" } else { "c.relhasoids" };
    format!(
        "SELECT n.nspname::text, c.relname::text, pg_get_userbyid(c.relowner)::text, {oids} \
         FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind = 'r' AND n.nspname = ANY($1) AND {ext} \
         ORDER BY n.nspname, c.relname",
        oids = oids,
        ext = NOT_EXTENSION_MEMBER,
    )
}

fn columns_sql(version: ServerVersion) -> String {
    let identity = if version.at_least(10, 0) {
        "NULLIF(a.attidentity::text, '')"
    } else {
        "NULL::text"
    };
    format!(
        "SELECT n.nspname::text, c.relname::text, a.attname::text, a.attnotnull, \
                t.typname::text, t.oid, t.typcategory::text, \
                pg_get_expr(ad.adbin, ad.adrelid), {identity}, \
                CASE \
                    WHEN t.typname = 'numeric' AND a.atttypmod > 0 THEN (a.atttypmod - 4) >> 16 \
                    WHEN t.typname IN ('bpchar', 'varchar') AND a.atttypmod > 0 THEN a.atttypmod - 4 \
                END, \
                CASE \
                    WHEN t.typname = 'numeric' AND a.atttypmod > 0 THEN (a.atttypmod - 4) & 65535 \
                END \
         FROM pg_attribute a \
         JOIN pg_class c ON c.oid = a.attrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_type t ON t.oid = a.atttypid \
         LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum \
         WHERE c.relkind = 'r' AND n.nspname = ANY($1) AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY n.nspname, c.relname, a.attnum",
        identity = identity,
    )
}

fn constraints_sql() -> String {
    "SELECT n.nspname::text, c.relname::text, k.conname::text, k.contype::text, \
            pg_get_constraintdef(k.oid) \
     FROM pg_constraint k \
     JOIN pg_class c ON c.oid = k.conrelid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE c.relkind = 'r' AND n.nspname = ANY($1) \
     ORDER BY n.nspname, c.relname, k.conname"
        .to_string()
}

/// Non-primary indexes of tables and materialized views. Indexes backing a
/// constraint are recreated with the constraint and are left out.
fn indexes_sql() -> String {
    "SELECT n.nspname::text, c.relname::text, x.relname::text, pg_get_indexdef(x.oid) \
     FROM pg_index i \
     JOIN pg_class c ON c.oid = i.indrelid \
     JOIN pg_class x ON x.oid = i.indexrelid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE c.relkind IN ('r', 'm') AND n.nspname = ANY($1) AND NOT i.indisprimary \
       AND NOT EXISTS (SELECT 1 FROM pg_constraint k WHERE k.conindid = i.indexrelid) \
     ORDER BY n.nspname, c.relname, x.relname"
        .to_string()
}

fn views_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, pg_get_userbyid(c.relowner)::text, \
                pg_get_viewdef(c.oid), c.relkind::text \
         FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind IN ('v', 'm') AND n.nspname = ANY($1) AND {ext} \
         ORDER BY n.nspname, c.relname",
        ext = NOT_EXTENSION_MEMBER,
    )
}

fn view_dependencies_sql() -> String {
    "SELECT DISTINCT vn.nspname::text, v.relname::text, n.nspname::text, c.relname::text, a.attname::text \
     FROM pg_rewrite r \
     JOIN pg_class v ON v.oid = r.ev_class \
     JOIN pg_namespace vn ON vn.oid = v.relnamespace \
     JOIN pg_depend d ON d.objid = r.oid \
     JOIN pg_attribute a ON a.attrelid = d.refobjid AND a.attnum = d.refobjsubid AND NOT a.attisdropped \
     JOIN pg_class c ON c.oid = d.refobjid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE v.relkind IN ('v', 'm') AND vn.nspname = ANY($1) AND d.refobjid <> v.oid \
     ORDER BY 1, 2, 3, 4, 5"
        .to_string()
}

/// Privileges of every login role on tables, views and materialized views.
fn relation_privileges_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, u.usename::text, {privileges} \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         CROSS JOIN pg_user u \
         WHERE c.relkind IN ('r', 'v', 'm') AND n.nspname = ANY($1) \
         ORDER BY n.nspname, c.relname, u.usename",
        privileges = privilege_columns("has_table_privilege", "c.oid", &Privilege::TABLE),
    )
}

/// Plain functions only; aggregates, window functions, procedures and
/// C-language functions are not compared.
fn function_filter(version: ServerVersion) -> &'static str {
    if version.at_least(11, 0) {
        "p.prokind = 'f' AND p.probin IS NULL"
    } else {
        "NOT p.proisagg AND NOT p.proiswindow AND p.probin IS NULL"
    }
}

fn functions_sql(version: ServerVersion) -> String {
    format!(
        "SELECT n.nspname::text, p.proname::text, pg_get_functiondef(p.oid), \
                pg_get_userbyid(p.proowner)::text, oidvectortypes(p.proargtypes) \
         FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace \
         WHERE n.nspname = ANY($1) AND {filter} \
           AND NOT EXISTS (SELECT 1 FROM pg_depend e WHERE e.objid = p.oid AND e.deptype = 'e') \
         ORDER BY n.nspname, p.proname, oidvectortypes(p.proargtypes)",
        filter = function_filter(version),
    )
}

fn function_privileges_sql(version: ServerVersion) -> String {
    format!(
        "SELECT n.nspname::text, p.proname::text, oidvectortypes(p.proargtypes), u.usename::text, {privileges} \
         FROM pg_proc p \
         JOIN pg_namespace n ON n.oid = p.pronamespace \
         CROSS JOIN pg_user u \
         WHERE n.nspname = ANY($1) AND {filter} \
         ORDER BY n.nspname, p.proname, 3, u.usename",
        privileges = privilege_columns("has_function_privilege", "p.oid", &Privilege::FUNCTION),
        filter = function_filter(version),
    )
}

/// Sequences owned by a column. Identity sequences follow their column and
/// are excluded.
fn sequences_sql(version: ServerVersion) -> String {
    let (cache, identity) = if version.at_least(10, 0) {
        ("p.cache_size", "AND a.attidentity = ''")
    } else {
        ("1::bigint", "")
    };
    format!(
        "SELECT n.nspname::text, c.relname::text, pg_get_userbyid(c.relowner)::text, \
                t.relname::text, a.attname::text, \
                p.start_value, p.minimum_value, p.maximum_value, p.increment, p.cycle_option, {cache} \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_depend d ON d.objid = c.oid AND d.refobjsubid > 0 AND d.deptype = 'a' \
         JOIN pg_class t ON t.oid = d.refobjid \
         JOIN pg_attribute a ON a.attrelid = d.refobjid AND a.attnum = d.refobjsubid \
         CROSS JOIN LATERAL pg_sequence_parameters(c.oid) p \
         WHERE c.relkind = 'S' AND n.nspname = ANY($1) {identity} \
         ORDER BY n.nspname, c.relname",
        cache = cache,
        identity = identity,
    )
}

fn sequence_privileges_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, u.usename::text, {privileges} \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         CROSS JOIN pg_user u \
         WHERE c.relkind = 'S' AND n.nspname = ANY($1) \
         ORDER BY n.nspname, c.relname, u.usename",
        privileges = privilege_columns("has_sequence_privilege", "c.oid", &Privilege::SEQUENCE),
    )
}
