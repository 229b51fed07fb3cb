//! Render change operations as SQL text.
//!
//! Rendering is pure. `idempotent` switches on `IF EXISTS` / `IF NOT EXISTS` /
//! `OR REPLACE` where PostgreSQL's grammar has them. Risky statements carry a
//! trailing `--WARN:` comment for whoever reviews the patch.

use crate::change::{ChangeOperation, ColumnChanges, ColumnValue, GrantObject, IdentityChange, OwnedObject};
use crate::db::{quote_ident, quote_literal};
use crate::snapshot::{ColumnDef, Privilege, QualifiedName, SequenceDef, TableDef};

pub const WARN_ADD_NOT_NULL: &str =
    "--WARN: Adding a NOT NULL column without a default value fails if the table has rows!";
pub const WARN_SET_NOT_NULL: &str =
    "--WARN: Setting NOT NULL on a column without a default value fails if any row holds NULL!";
pub const WARN_DATA_TYPE: &str =
    "--WARN: Changing the column data type casts existing values and can fail or lose precision!";
pub const WARN_DROP_COLUMN: &str = "--WARN: Dropping a column loses its data!";
pub const WARN_GRANT: &str =
    "--WARN: Granting or revoking privileges fails if the role does not exist on this database!";
pub const WARN_OVERRIDING_IDENTITY: &str =
    "--WARN: Explicit values are written into an ALWAYS identity column!";

/// Render one operation. Multi-statement operations are newline separated.
pub fn render(op: &ChangeOperation, idempotent: bool) -> String {
    let if_exists = if idempotent { "IF EXISTS " } else { "" };
    let if_not_exists = if idempotent { "IF NOT EXISTS " } else { "" };

    match op {
        ChangeOperation::CreateSchema { schema, owner } => format!(
            "CREATE SCHEMA {}{} AUTHORIZATION {};",
            if_not_exists,
            quote_ident(schema),
            quote_ident(owner)
        ),
        ChangeOperation::CreateTable { table, definition } => {
            render_create_table(table, definition, idempotent)
        }
        ChangeOperation::DropTable { table } => format!("DROP TABLE {}{};", if_exists, table),
        ChangeOperation::AddColumn { table, column, definition } => {
            let mut sql = format!(
                "ALTER TABLE {} ADD COLUMN {}{};",
                table,
                if_not_exists,
                column_definition(column, definition)
            );
            if !definition.nullable && definition.default.is_none() && definition.identity.is_none() {
                sql.push(' ');
                sql.push_str(WARN_ADD_NOT_NULL);
            }
            sql
        }
        ChangeOperation::AlterColumn { table, column, definition, changes } => {
            render_alter_column(table, column, definition, changes)
        }
        ChangeOperation::DropColumn { table, column } => format!(
            "ALTER TABLE {} DROP COLUMN {}{} CASCADE; {}",
            table,
            if_exists,
            quote_ident(column),
            WARN_DROP_COLUMN
        ),
        ChangeOperation::AddConstraint { table, name, definition } => format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {};",
            table,
            quote_ident(name),
            definition.definition
        ),
        ChangeOperation::DropConstraint { table, name } => format!(
            "ALTER TABLE {} DROP CONSTRAINT {}{};",
            table,
            if_exists,
            quote_ident(name)
        ),
        ChangeOperation::CreateIndex { definition, .. } => {
            terminated(&index_definition(definition, idempotent))
        }
        ChangeOperation::ChangeIndex { index, definition } => format!(
            "DROP INDEX {}{};\n{}",
            if_exists,
            index,
            terminated(&index_definition(definition, idempotent))
        ),
        ChangeOperation::DropIndex { index } => format!("DROP INDEX {}{};", if_exists, index),
        ChangeOperation::SetOids { table, with_oids } => format!(
            "ALTER TABLE {} SET {};",
            table,
            if *with_oids { "WITH OIDS" } else { "WITHOUT OIDS" }
        ),
        ChangeOperation::GrantChange { object, role, changes } => {
            let target = match object {
                GrantObject::Table(name) => format!("TABLE {}", name),
                GrantObject::Sequence(name) => format!("SEQUENCE {}", name),
            };
            render_grants(&target, role, changes)
        }
        ChangeOperation::GrantFunctionChange { function, role, changes } => {
            render_grants(&format!("FUNCTION {}", function), role, changes)
        }
        ChangeOperation::ChangeOwner { object, owner } => {
            let target = match object {
                OwnedObject::Table(name) => format!("TABLE {}", name),
                OwnedObject::View(name) => format!("VIEW {}", name),
                OwnedObject::MaterializedView(name) => format!("MATERIALIZED VIEW {}", name),
                OwnedObject::Function(name) => format!("FUNCTION {}", name),
                OwnedObject::Sequence(name) => format!("SEQUENCE {}", name),
            };
            format!("ALTER {} OWNER TO {};", target, quote_ident(owner))
        }
        ChangeOperation::CreateView { view, definition } => format!(
            "CREATE {}VIEW {} AS {}",
            if idempotent { "OR REPLACE " } else { "" },
            view,
            terminated(definition.trim_start())
        ),
        ChangeOperation::DropView { view } => format!("DROP VIEW {}{};", if_exists, view),
        ChangeOperation::CreateMaterializedView { view, definition } => format!(
            "CREATE MATERIALIZED VIEW {}{} AS {}",
            if_not_exists,
            view,
            terminated(definition.trim_start())
        ),
        ChangeOperation::DropMaterializedView { view } => {
            format!("DROP MATERIALIZED VIEW {}{};", if_exists, view)
        }
        ChangeOperation::CreateFunction { definition, .. } => {
            terminated(&function_definition(definition, idempotent))
        }
        ChangeOperation::DropFunction { function } => {
            format!("DROP FUNCTION {}{};", if_exists, function)
        }
        ChangeOperation::AlterSequence { sequence, definition } => {
            render_alter_sequence(sequence, definition)
        }
        ChangeOperation::InsertRow { table, values, overriding_system_value } => {
            let columns: Vec<String> = values.iter().map(|v| quote_ident(&v.name)).collect();
            let literals: Vec<String> = values.iter().map(column_literal).collect();
            let mut sql = format!(
                "INSERT INTO {} ({}) {}VALUES ({});",
                table,
                columns.join(", "),
                if *overriding_system_value { "OVERRIDING SYSTEM VALUE " } else { "" },
                literals.join(", ")
            );
            if *overriding_system_value {
                sql.push(' ');
                sql.push_str(WARN_OVERRIDING_IDENTITY);
            }
            sql
        }
        ChangeOperation::UpdateRow { table, changes, keys } => {
            let assignments: Vec<String> = changes
                .iter()
                .map(|c| format!("{} = {}", quote_ident(&c.name), column_literal(c)))
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {};",
                table,
                assignments.join(", "),
                key_predicate(keys)
            )
        }
        ChangeOperation::DeleteRow { table, keys } => {
            format!("DELETE FROM {} WHERE {};", table, key_predicate(keys))
        }
        ChangeOperation::RebaseSequence { table, column } => format!(
            "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false);",
            quote_literal(&table.to_string()),
            quote_literal(column),
            quote_ident(column),
            table
        ),
        ChangeOperation::ErrorComment { message } => {
            format!("--ERROR: {}", message.replace(['\r', '\n'], " "))
        }
    }
}

/// Render a SQL literal for a text-form value of the given `pg_type.typcategory`.
///
/// Booleans arrive as `t`/`f` and are written as keywords, numbers are written
/// bare, and everything else is quoted and left to PostgreSQL's input function
/// for the column type.
pub fn literal(category: char, value: Option<&str>) -> String {
    match value {
        None => "NULL".to_string(),
        Some("t") if category == 'B' => "true".to_string(),
        Some("f") if category == 'B' => "false".to_string(),
        Some(v) if category == 'N' && is_plain_number(v) => v.to_string(),
        Some(v) => quote_literal(v),
    }
}

fn column_literal(value: &ColumnValue) -> String {
    literal(value.category, value.value.as_deref())
}

fn is_plain_number(v: &str) -> bool {
    !v.is_empty()
        && v.chars().any(|c| c.is_ascii_digit())
        && v.chars().all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
}

fn key_predicate(keys: &[ColumnValue]) -> String {
    keys.iter()
        .map(|k| match k.value {
            None => format!("{} IS NULL", quote_ident(&k.name)),
            Some(_) => format!("{} = {}", quote_ident(&k.name), column_literal(k)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn terminated(sql: &str) -> String {
    let trimmed = sql.trim_end();
    if trimmed.ends_with(';') {
        trimmed.to_string()
    } else {
        format!("{};", trimmed)
    }
}

/// Serial pseudo-types are only valid in CREATE/ADD; altering to one means altering to its storage type.
fn alter_type_sql(definition: &ColumnDef) -> String {
    match definition.data_type.as_str() {
        "serial" => "integer".to_string(),
        "bigserial" => "bigint".to_string(),
        "smallserial" => "smallint".to_string(),
        _ => definition.type_sql(),
    }
}

fn column_definition(name: &str, column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote_ident(name), column.type_sql());
    if let Some(identity) = column.identity {
        sql.push_str(&format!(" GENERATED {} AS IDENTITY", identity.as_sql()));
    }
    sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
    if let Some(ref default) = column.default {
        sql.push_str(&format!(" DEFAULT {}", default));
    }
    sql
}

fn render_create_table(table: &QualifiedName, definition: &TableDef, idempotent: bool) -> String {
    let mut lines: Vec<String> = definition
        .columns
        .iter()
        .map(|(name, column)| column_definition(name, column))
        .collect();
    lines.extend(definition.constraints.iter().map(|(name, constraint)| {
        format!("CONSTRAINT {} {}", quote_ident(name), constraint.definition)
    }));

    let mut sql = format!(
        "CREATE TABLE {}{} (\n\t{}\n){};",
        if idempotent { "IF NOT EXISTS " } else { "" },
        table,
        lines.join(",\n\t"),
        if definition.options.with_oids { " WITH (OIDS=TRUE)" } else { "" }
    );

    for index in definition.indexes.values() {
        sql.push('\n');
        sql.push_str(&terminated(&index_definition(&index.definition, idempotent)));
    }

    if !definition.owner.is_empty() {
        sql.push_str(&format!(
            "\nALTER TABLE {} OWNER TO {};",
            table,
            quote_ident(&definition.owner)
        ));
    }

    for (role, privileges) in &definition.privileges {
        let granted: Vec<(Privilege, bool)> = privileges
            .iter()
            .filter(|(_, granted)| **granted)
            .map(|(p, _)| (*p, true))
            .collect();
        if !granted.is_empty() {
            sql.push('\n');
            sql.push_str(&render_grants(&format!("TABLE {}", table), role, &granted));
        }
    }

    sql
}

fn render_alter_column(
    table: &QualifiedName,
    column: &str,
    definition: &ColumnDef,
    changes: &ColumnChanges,
) -> String {
    let prefix = format!("ALTER TABLE {} ALTER COLUMN {}", table, quote_ident(column));
    let mut statements = Vec::new();

    if changes.data_type {
        let type_sql = alter_type_sql(definition);
        statements.push(format!(
            "{} SET DATA TYPE {} USING {}::{}; {}",
            prefix,
            type_sql,
            quote_ident(column),
            type_sql,
            WARN_DATA_TYPE
        ));
    }

    if changes.default {
        statements.push(match definition.default {
            Some(ref default) => format!("{} SET DEFAULT {};", prefix, default),
            None => format!("{} DROP DEFAULT;", prefix),
        });
    }

    match changes.identity {
        Some(IdentityChange::Add(identity)) => statements.push(format!(
            "{} ADD GENERATED {} AS IDENTITY;",
            prefix,
            identity.as_sql()
        )),
        Some(IdentityChange::Set(identity)) => {
            statements.push(format!("{} SET GENERATED {};", prefix, identity.as_sql()))
        }
        Some(IdentityChange::Drop) => statements.push(format!("{} DROP IDENTITY IF EXISTS;", prefix)),
        None => {}
    }

    if changes.nullable {
        if definition.nullable {
            statements.push(format!("{} DROP NOT NULL;", prefix));
        } else if definition.default.is_none() && definition.identity.is_none() {
            statements.push(format!("{} SET NOT NULL; {}", prefix, WARN_SET_NOT_NULL));
        } else {
            statements.push(format!("{} SET NOT NULL;", prefix));
        }
    }

    statements.join("\n")
}

fn render_grants(target: &str, role: &str, changes: &[(Privilege, bool)]) -> String {
    changes
        .iter()
        .map(|(privilege, granted)| {
            if *granted {
                format!("GRANT {} ON {} TO {}; {}", privilege, target, quote_ident(role), WARN_GRANT)
            } else {
                format!("REVOKE {} ON {} FROM {}; {}", privilege, target, quote_ident(role), WARN_GRANT)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_alter_sequence(sequence: &QualifiedName, definition: &SequenceDef) -> String {
    format!(
        "ALTER SEQUENCE {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} CACHE {} {};",
        sequence,
        definition.increment,
        definition.min_value,
        definition.max_value,
        definition.start_value,
        definition.cache_size,
        if definition.is_cycle { "CYCLE" } else { "NO CYCLE" }
    )
}

/// `pg_get_indexdef` output, with `IF NOT EXISTS` spliced in when idempotent.
fn index_definition(definition: &str, idempotent: bool) -> String {
    if !idempotent {
        return definition.to_string();
    }
    for prefix in ["CREATE UNIQUE INDEX ", "CREATE INDEX "] {
        if let Some(rest) = definition.strip_prefix(prefix) {
            if rest.starts_with("IF NOT EXISTS ") {
                return definition.to_string();
            }
            return format!("{}IF NOT EXISTS {}", prefix, rest);
        }
    }
    definition.to_string()
}

/// `pg_get_functiondef` always says `CREATE OR REPLACE`; strip it when failures should be loud.
fn function_definition(definition: &str, idempotent: bool) -> String {
    let trimmed = definition.trim();
    if idempotent {
        return trimmed.to_string();
    }
    match trimmed.strip_prefix("CREATE OR REPLACE ") {
        Some(rest) => format!("CREATE {}", rest),
        None => trimmed.to_string(),
    }
}
