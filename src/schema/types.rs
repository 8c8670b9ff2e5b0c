// ABOUTME: Pure mapping from source column types to warehouse column types
// ABOUTME: One table per source dialect (PostgreSQL, MySQL, SQL Server, SQLite); unmapped types return None

use crate::source::Dialect;

/// Widest character column the warehouse accepts.
pub const MAX_VARCHAR: u32 = 65535;

/// A source type name split into its parts, e.g. `int(11) unsigned`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedType {
    base: String,
    args: Vec<u32>,
    unsigned: bool,
}

fn parse_type(type_name: &str) -> ParsedType {
    let lower = type_name.trim().to_lowercase();
    let unsigned = lower.split_whitespace().any(|w| w == "unsigned");

    let (base, args) = match lower.split_once('(') {
        Some((base, rest)) => {
            let inner = rest.split(')').next().unwrap_or_default();
            let args = inner
                .split(',')
                .filter_map(|a| a.trim().parse::<u32>().ok())
                .collect();
            (base.trim().to_string(), args)
        }
        None => {
            let base = lower
                .split_whitespace()
                .filter(|w| *w != "unsigned" && *w != "zerofill")
                .collect::<Vec<_>>()
                .join(" ");
            (base, Vec::new())
        }
    };

    ParsedType {
        base,
        args,
        unsigned,
    }
}

/// Map a source column type to a warehouse type.
///
/// Explicit arguments in the type name (e.g. `varchar(40)`) win over `precision` / `scale`
/// reported separately by the catalog.
///
/// ```
/// # use warehouse_replicator::schema::types::map_type;
/// # use warehouse_replicator::source::Dialect;
/// assert_eq!(map_type(Dialect::Mysql, "int(11) unsigned", None, None).as_deref(), Some("bigint"));
/// assert_eq!(map_type(Dialect::Postgres, "jsonb", None, None).as_deref(), Some("varchar(65535)"));
/// assert_eq!(map_type(Dialect::Sqlite, "BLOB", None, None), None);
/// ```
pub fn map_type(
    dialect: Dialect,
    type_name: &str,
    precision: Option<u32>,
    scale: Option<u32>,
) -> Option<String> {
    let parsed = parse_type(type_name);
    let precision = parsed.args.first().copied().or(precision);
    let scale = parsed.args.get(1).copied().or(scale);

    match dialect {
        Dialect::Postgres => map_postgres(&parsed.base, precision, scale),
        Dialect::Mysql => map_mysql(&parsed.base, parsed.unsigned, precision, scale),
        Dialect::Mssql => map_mssql(&parsed.base, precision, scale),
        Dialect::Sqlite => map_sqlite(&parsed.base, precision, scale),
    }
}

fn numeric(precision: Option<u32>, scale: Option<u32>) -> String {
    match (precision, scale) {
        (Some(p), Some(s)) => format!("numeric({},{})", p, s),
        (Some(p), None) => format!("numeric({})", p),
        _ => "numeric".to_string(),
    }
}

fn varchar(length: Option<u32>) -> String {
    match length {
        Some(n) if n > 0 => format!("varchar({})", n.min(MAX_VARCHAR)),
        _ => format!("varchar({})", MAX_VARCHAR),
    }
}

fn map_postgres(base: &str, precision: Option<u32>, scale: Option<u32>) -> Option<String> {
    // Array types are reported as `_int4` by udt_name and `int4[]` elsewhere
    if base.starts_with('_') || base.ends_with("[]") {
        return Some(varchar(None));
    }

    let mapped = match base {
        "int2" | "smallint" | "smallserial" | "serial2" => "smallint".to_string(),
        "int4" | "int" | "integer" | "serial" | "serial4" => "integer".to_string(),
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint".to_string(),
        "float4" | "real" => "real".to_string(),
        "float8" | "double precision" => "double precision".to_string(),
        "numeric" | "decimal" => numeric(precision, scale),
        "bool" | "boolean" => "boolean".to_string(),
        "varchar" | "character varying" => varchar(precision),
        "bpchar" | "char" | "character" => match precision {
            Some(n) => format!("char({})", n),
            None => varchar(None),
        },
        "text" | "citext" | "json" | "jsonb" | "xml" | "bytea" => varchar(None),
        "name" => "varchar(64)".to_string(),
        "uuid" => "char(36)".to_string(),
        "date" => "date".to_string(),
        "time" | "timetz" | "time without time zone" | "time with time zone" => {
            "varchar(40)".to_string()
        }
        "timestamp" | "timestamp without time zone" => "timestamp".to_string(),
        "timestamptz" | "timestamp with time zone" => "timestamptz".to_string(),
        _ => return None,
    };
    Some(mapped)
}

fn map_mysql(
    base: &str,
    unsigned: bool,
    precision: Option<u32>,
    scale: Option<u32>,
) -> Option<String> {
    let mapped = match (base, unsigned) {
        ("tinyint", _) => "smallint".to_string(),
        ("smallint", false) => "smallint".to_string(),
        ("smallint", true) | ("mediumint", _) => "integer".to_string(),
        ("int" | "integer", false) => "integer".to_string(),
        ("int" | "integer", true) => "bigint".to_string(),
        ("bigint", false) => "bigint".to_string(),
        ("bigint", true) => "numeric(20,0)".to_string(),
        ("float", _) => "real".to_string(),
        ("double" | "double precision" | "real", _) => "double precision".to_string(),
        ("decimal" | "numeric" | "dec" | "fixed", _) => numeric(precision, scale),
        ("bit", _) => match precision {
            Some(1) | None => "boolean".to_string(),
            Some(n) => varchar(Some(n)),
        },
        ("bool" | "boolean", _) => "boolean".to_string(),
        ("date", _) => "date".to_string(),
        ("time", _) => "varchar(40)".to_string(),
        ("datetime" | "timestamp", _) => "timestamp".to_string(),
        ("year", _) => "integer".to_string(),
        // Lengths are in characters; reserve four bytes per character
        ("char" | "varchar", _) => varchar(precision.map(|n| n.saturating_mul(4))),
        (
            "tinytext" | "text" | "mediumtext" | "longtext" | "tinyblob" | "blob" | "mediumblob"
            | "longblob" | "binary" | "varbinary" | "json" | "enum" | "set",
            _,
        ) => varchar(None),
        _ => return None,
    };
    Some(mapped)
}

fn map_mssql(base: &str, precision: Option<u32>, scale: Option<u32>) -> Option<String> {
    let mapped = match base {
        "bit" => "boolean".to_string(),
        "tinyint" | "smallint" => "smallint".to_string(),
        "int" => "integer".to_string(),
        "bigint" => "bigint".to_string(),
        "real" => "real".to_string(),
        // float(n) is single precision up to 24 bits of mantissa
        "float" => match precision {
            Some(p) if p <= 24 => "real".to_string(),
            _ => "double precision".to_string(),
        },
        "decimal" | "numeric" => numeric(precision, scale),
        "money" => "numeric(19,4)".to_string(),
        "smallmoney" => "numeric(10,4)".to_string(),
        "char" | "varchar" => varchar(precision),
        "nchar" | "nvarchar" => varchar(precision.map(|n| n.saturating_mul(4))),
        "text" | "ntext" | "xml" | "binary" | "varbinary" | "image" => varchar(None),
        "uniqueidentifier" => "char(36)".to_string(),
        "date" => "date".to_string(),
        "time" => "varchar(40)".to_string(),
        "datetime" | "datetime2" | "smalldatetime" => "timestamp".to_string(),
        "datetimeoffset" => "timestamptz".to_string(),
        _ => return None,
    };
    Some(mapped)
}

fn map_sqlite(base: &str, precision: Option<u32>, scale: Option<u32>) -> Option<String> {
    let upper = base.to_uppercase();
    if upper.is_empty() || upper.contains("BLOB") {
        return None;
    }

    let mapped = if upper.starts_with("BOOL") {
        "boolean".to_string()
    } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
        "timestamp".to_string()
    } else if upper == "DATE" {
        "date".to_string()
    } else if upper.contains("INT") {
        "bigint".to_string()
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        varchar(None)
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        "double precision".to_string()
    } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
        numeric(precision, scale)
    } else {
        return None;
    };
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type() {
        assert_eq!(
            parse_type("INT(11) UNSIGNED"),
            ParsedType {
                base: "int".into(),
                args: vec![11],
                unsigned: true
            }
        );
        assert_eq!(parse_type("decimal(10, 2)").args, vec![10, 2]);
        assert_eq!(parse_type("double precision").base, "double precision");
        assert_eq!(parse_type("enum('a','b')").base, "enum");
    }

    #[test]
    fn test_postgres_types() {
        let pg = |t: &str| map_type(Dialect::Postgres, t, None, None);
        assert_eq!(pg("int4").as_deref(), Some("integer"));
        assert_eq!(pg("int8").as_deref(), Some("bigint"));
        assert_eq!(pg("float8").as_deref(), Some("double precision"));
        assert_eq!(pg("uuid").as_deref(), Some("char(36)"));
        assert_eq!(pg("time").as_deref(), Some("varchar(40)"));
        assert_eq!(pg("timestamptz").as_deref(), Some("timestamptz"));
        assert_eq!(pg("_int4").as_deref(), Some("varchar(65535)"));
        assert_eq!(pg("varchar").as_deref(), Some("varchar(65535)"));
        assert_eq!(
            map_type(Dialect::Postgres, "varchar", Some(80), None).as_deref(),
            Some("varchar(80)")
        );
        assert_eq!(
            map_type(Dialect::Postgres, "numeric", Some(12), Some(2)).as_deref(),
            Some("numeric(12,2)")
        );
        assert_eq!(pg("numeric").as_deref(), Some("numeric"));
        assert_eq!(pg("tsvector"), None);
        assert_eq!(pg("point"), None);
    }

    #[test]
    fn test_mysql_promotions() {
        let my = |t: &str| map_type(Dialect::Mysql, t, None, None);
        assert_eq!(my("tinyint(4)").as_deref(), Some("smallint"));
        assert_eq!(my("smallint unsigned").as_deref(), Some("integer"));
        assert_eq!(my("mediumint(9)").as_deref(), Some("integer"));
        assert_eq!(my("int(10) unsigned").as_deref(), Some("bigint"));
        assert_eq!(my("bigint(20) unsigned").as_deref(), Some("numeric(20,0)"));
        assert_eq!(my("float").as_deref(), Some("real"));
        assert_eq!(my("decimal(10,2)").as_deref(), Some("numeric(10,2)"));
        assert_eq!(my("bit(1)").as_deref(), Some("boolean"));
        assert_eq!(my("bit(8)").as_deref(), Some("varchar(8)"));
        assert_eq!(my("datetime").as_deref(), Some("timestamp"));
        assert_eq!(my("year(4)").as_deref(), Some("integer"));
        assert_eq!(my("varchar(255)").as_deref(), Some("varchar(1020)"));
        assert_eq!(my("varchar(20000)").as_deref(), Some("varchar(65535)"));
        assert_eq!(my("longtext").as_deref(), Some("varchar(65535)"));
        assert_eq!(my("enum('new','paid')").as_deref(), Some("varchar(65535)"));
        assert_eq!(my("geometry"), None);
    }

    #[test]
    fn test_mssql_types() {
        let ms = |t: &str| map_type(Dialect::Mssql, t, None, None);
        assert_eq!(ms("bit").as_deref(), Some("boolean"));
        assert_eq!(ms("tinyint").as_deref(), Some("smallint"));
        assert_eq!(ms("int").as_deref(), Some("integer"));
        assert_eq!(ms("float").as_deref(), Some("double precision"));
        assert_eq!(
            map_type(Dialect::Mssql, "float", Some(24), None).as_deref(),
            Some("real")
        );
        assert_eq!(ms("decimal(18,4)").as_deref(), Some("numeric(18,4)"));
        assert_eq!(ms("money").as_deref(), Some("numeric(19,4)"));
        assert_eq!(ms("nvarchar(50)").as_deref(), Some("varchar(200)"));
        assert_eq!(ms("varchar(max)").as_deref(), Some("varchar(65535)"));
        assert_eq!(ms("uniqueidentifier").as_deref(), Some("char(36)"));
        assert_eq!(ms("datetime2(7)").as_deref(), Some("timestamp"));
        assert_eq!(ms("datetimeoffset").as_deref(), Some("timestamptz"));
        assert_eq!(ms("varbinary(16)").as_deref(), Some("varchar(65535)"));
        assert_eq!(ms("geography"), None);
        assert_eq!(ms("sql_variant"), None);
    }

    #[test]
    fn test_sqlite_affinity() {
        let lite = |t: &str| map_type(Dialect::Sqlite, t, None, None);
        assert_eq!(lite("INTEGER").as_deref(), Some("bigint"));
        assert_eq!(lite("VARCHAR(30)").as_deref(), Some("varchar(65535)"));
        assert_eq!(lite("REAL").as_deref(), Some("double precision"));
        assert_eq!(lite("BOOLEAN").as_deref(), Some("boolean"));
        assert_eq!(lite("DATETIME").as_deref(), Some("timestamp"));
        assert_eq!(lite("DATE").as_deref(), Some("date"));
        assert_eq!(lite("DECIMAL(8,3)").as_deref(), Some("numeric(8,3)"));
        assert_eq!(lite("BLOB"), None);
        assert_eq!(lite(""), None);
    }
}
