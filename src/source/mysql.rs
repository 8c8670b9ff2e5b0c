// ABOUTME: MySQL source connection built on mysql_async
// ABOUTME: Converts MySQL wire values and column metadata into the shared source model

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::*;
use mysql_async::{Column, Opts, Pool, Row, Value};

use super::{zero_row_query, Dialect, ResultSet, SourceColumn, SourceConnection, SqlValue};

/// A MySQL source database backed by a small connection pool.
pub struct MysqlSource {
    pool: Pool,
    database: String,
}

impl MysqlSource {
    /// Open a pool for a `mysql://` URL. Connections are established lazily.
    pub fn connect(url: &str) -> Result<Self> {
        let opts = Opts::from_url(url).context("Invalid MySQL connection URL")?;
        let database = opts.db_name().unwrap_or_default().to_string();
        Ok(Self {
            pool: Pool::new(opts),
            database,
        })
    }

    /// Close all pooled connections.
    pub async fn disconnect(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .context("Failed to disconnect MySQL pool")
    }
}

/// Convert a MySQL wire value into a [`SqlValue`].
///
/// Text protocol results arrive as bytes; they are kept as text when valid UTF-8.
pub fn mysql_value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => SqlValue::Text(text),
            Err(_) => SqlValue::Bytes(bytes.clone()),
        },
        Value::Int(i) => SqlValue::Int(*i),
        Value::UInt(u) => SqlValue::UInt(*u),
        Value::Float(f) => SqlValue::Float(f64::from(*f)),
        Value::Double(d) => SqlValue::Float(*d),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date =
                chrono::NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day));
            match date.and_then(|d| {
                d.and_hms_micro_opt(
                    u32::from(*hour),
                    u32::from(*minute),
                    u32::from(*second),
                    *micros,
                )
            }) {
                Some(ts) => SqlValue::Timestamp(ts),
                // Zero dates ('0000-00-00') have no chrono representation
                None => SqlValue::Null,
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            SqlValue::Text(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                if *negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds,
                micros
            ))
        }
    }
}

/// MySQL type name for a result-set column, in `information_schema` spelling.
pub fn column_type_name(column_type: ColumnType, flags: ColumnFlags) -> Option<String> {
    let base = match column_type {
        ColumnType::MYSQL_TYPE_TINY => "tinyint",
        ColumnType::MYSQL_TYPE_SHORT => "smallint",
        ColumnType::MYSQL_TYPE_INT24 => "mediumint",
        ColumnType::MYSQL_TYPE_LONG => "int",
        ColumnType::MYSQL_TYPE_LONGLONG => "bigint",
        ColumnType::MYSQL_TYPE_FLOAT => "float",
        ColumnType::MYSQL_TYPE_DOUBLE => "double",
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "decimal",
        ColumnType::MYSQL_TYPE_TIME => "time",
        ColumnType::MYSQL_TYPE_DATE => "date",
        ColumnType::MYSQL_TYPE_DATETIME => "datetime",
        ColumnType::MYSQL_TYPE_TIMESTAMP => "timestamp",
        ColumnType::MYSQL_TYPE_YEAR => "year",
        ColumnType::MYSQL_TYPE_STRING => "char",
        ColumnType::MYSQL_TYPE_VAR_STRING | ColumnType::MYSQL_TYPE_VARCHAR => "varchar",
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB => "text",
        ColumnType::MYSQL_TYPE_BIT => "bit",
        ColumnType::MYSQL_TYPE_JSON => "json",
        ColumnType::MYSQL_TYPE_ENUM => "enum",
        ColumnType::MYSQL_TYPE_SET => "set",
        _ => return None,
    };
    if flags.contains(ColumnFlags::UNSIGNED_FLAG) {
        Some(format!("{} unsigned", base))
    } else {
        Some(base.to_string())
    }
}

fn describe_column(column: &Column) -> SourceColumn {
    let column_type = column.column_type();
    let flags = column.flags();
    let is_decimal = matches!(
        column_type,
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL
    );
    let is_char = matches!(
        column_type,
        ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_BIT
    );

    // column_length is in bytes for character columns under utf8mb4 (4 bytes per char)
    let precision = if is_decimal {
        let digits = column.column_length().saturating_sub(1);
        let digits = if column.decimals() > 0 {
            digits.saturating_sub(1)
        } else {
            digits
        };
        Some(digits)
    } else if column_type == ColumnType::MYSQL_TYPE_BIT {
        Some(column.column_length())
    } else if is_char {
        Some((column.column_length() / 4).max(1))
    } else {
        None
    };

    SourceColumn {
        name: column.name_str().to_string(),
        type_name: column_type_name(column_type, flags),
        precision,
        scale: if is_decimal {
            Some(u32::from(column.decimals()))
        } else {
            None
        },
        nullable: !flags.contains(ColumnFlags::NOT_NULL_FLAG),
    }
}

#[async_trait]
impl SourceConnection for MysqlSource {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn query(&self, sql: &str) -> Result<ResultSet> {
        tracing::debug!("Running source query: {}", sql);
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to get MySQL connection")?;

        let statement = conn
            .prep(sql)
            .await
            .with_context(|| format!("Failed to prepare source query: {}", sql))?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name_str().to_string())
            .collect::<Vec<_>>();

        let rows: Vec<Row> = conn
            .exec(statement.clone(), ())
            .await
            .context("Failed to run source query")?;

        let rows = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| match row.as_ref(idx) {
                        Some(value) => mysql_value_to_sql(value),
                        None => SqlValue::Null,
                    })
                    .collect()
            })
            .collect();

        Ok(ResultSet { columns, rows })
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<SourceColumn>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to get MySQL connection")?;

        let rows: Vec<(String, String, Option<u64>, Option<u64>, Option<u64>, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, CHARACTER_MAXIMUM_LENGTH,
                        NUMERIC_PRECISION, NUMERIC_SCALE, IS_NULLABLE
                 FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
                 ORDER BY ORDINAL_POSITION",
                (table,),
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", table))?;

        Ok(rows
            .into_iter()
            .map(
                |(name, column_type, char_len, numeric_precision, numeric_scale, nullable)| {
                    let is_char = column_type.starts_with("char") || column_type.starts_with("varchar");
                    SourceColumn {
                        name,
                        precision: if is_char {
                            char_len.map(|l| l as u32)
                        } else {
                            numeric_precision.map(|p| p as u32)
                        },
                        scale: numeric_scale.map(|s| s as u32),
                        // COLUMN_TYPE already carries length and signedness, e.g. "int(11) unsigned"
                        type_name: Some(column_type),
                        nullable: nullable == "YES",
                    }
                },
            )
            .collect())
    }

    async fn describe_query(&self, sql: &str) -> Result<Vec<SourceColumn>> {
        let described = zero_row_query(sql);
        tracing::debug!("Describing query schema: {}", described);
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to get MySQL connection")?;
        let statement = conn
            .prep(described.as_str())
            .await
            .context("Failed to describe query schema")?;

        Ok(statement.columns().iter().map(describe_column).collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to get MySQL connection")?;

        let keys: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME
                 FROM information_schema.KEY_COLUMN_USAGE
                 WHERE TABLE_SCHEMA = DATABASE()
                   AND TABLE_NAME = ?
                   AND CONSTRAINT_NAME = 'PRIMARY'
                 ORDER BY ORDINAL_POSITION",
                (table,),
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}", table))?;

        Ok(keys)
    }
}
