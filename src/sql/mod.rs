// ABOUTME: SQL generator for managed extraction, target DDL, and load plans
// ABOUTME: Manual SQL goes through template substitution in the template submodule

pub mod template;

use crate::index::IndexValue;
use crate::schema::ColumnSchema;
use crate::source::Dialect;
use crate::utils::quote_ident;
use crate::warehouse::{DeleteStrategy, LoadPlan, TableRef};

/// Bounds of one incremental extraction: `(old, new]` over `column`.
#[derive(Debug, Clone, Copy)]
pub struct IndexWindow<'a> {
    pub column: &'a str,
    pub old: Option<&'a IndexValue>,
    pub new: &'a IndexValue,
}

fn column_list(columns: &[String], quote: impl Fn(&str) -> String) -> String {
    columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
}

/// CREATE TABLE for a managed table.
///
/// The primary key, when given, becomes a table constraint.
pub fn create_table_sql(target: &TableRef, schema: &ColumnSchema, primary_key: &[String]) -> String {
    let mut lines = schema
        .columns
        .iter()
        .map(|c| {
            format!(
                "    {} {}{}",
                quote_ident(&c.name),
                c.type_name,
                if c.nullable { "" } else { " NOT NULL" }
            )
        })
        .collect::<Vec<_>>();

    if !primary_key.is_empty() {
        lines.push(format!(
            "    PRIMARY KEY ({})",
            column_list(primary_key, quote_ident)
        ));
    }

    format!("CREATE TABLE {} (\n{}\n)", target.quoted(), lines.join(",\n"))
}

/// Extraction SELECT for a managed table, windowed when `window` is given.
///
/// The lower bound is omitted when there is no previous watermark.
pub fn select_sql(
    dialect: Dialect,
    source_table: &str,
    columns: &[String],
    window: Option<IndexWindow<'_>>,
) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}",
        column_list(columns, |c| dialect.quote_ident(c)),
        dialect.quote_table(source_table)
    );

    if let Some(window) = window {
        let column = dialect.quote_ident(window.column);
        let mut predicates = Vec::with_capacity(2);
        if let Some(old) = window.old {
            predicates.push(format!("{} > {}", column, old.to_sql_literal()));
        }
        predicates.push(format!("{} <= {}", column, window.new.to_sql_literal()));
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    sql
}

/// Upper bound query for an index column.
pub fn max_index_sql(dialect: Dialect, source_table: &str, index_column: &str) -> String {
    format!(
        "SELECT MAX({}) AS index_value FROM {}",
        dialect.quote_ident(index_column),
        dialect.quote_table(source_table)
    )
}

/// Name of the transaction-local staging table for a load.
pub fn staging_table_name(source_alias: &str, destination_table: &str) -> String {
    format!("{}_{}_staging", source_alias, destination_table)
}

/// DELETE matching `delete`, or `None` when nothing is deleted.
pub fn delete_sql(target: &TableRef, staging_table: &str, delete: &DeleteStrategy) -> Option<String> {
    match delete {
        DeleteStrategy::None => None,
        DeleteStrategy::All => Some(format!("DELETE FROM {}", target.quoted())),
        DeleteStrategy::Custom(sql) => Some(sql.clone()),
        DeleteStrategy::MatchingKeys(keys) => {
            let keys = column_list(keys, quote_ident);
            Some(format!(
                "DELETE FROM {} WHERE ({}) IN (SELECT {} FROM {})",
                target.quoted(),
                keys,
                keys,
                quote_ident(staging_table)
            ))
        }
    }
}

/// INSERT of every staged row into the target.
pub fn insert_sql(target: &TableRef, staging_table: &str, columns: &[String]) -> String {
    let columns = column_list(columns, quote_ident);
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        target.quoted(),
        columns,
        columns,
        quote_ident(staging_table)
    )
}

/// Complete load plan for one table run.
pub fn load_plan(
    source_alias: &str,
    target: &TableRef,
    columns: &[String],
    delete: DeleteStrategy,
) -> LoadPlan {
    let staging_table = staging_table_name(source_alias, &target.table);
    LoadPlan {
        target: target.clone(),
        delete_sql: delete_sql(target, &staging_table, &delete),
        insert_sql: insert_sql(target, &staging_table, columns),
        staging_table,
        columns: columns.to_vec(),
        delete,
    }
}
