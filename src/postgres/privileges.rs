// ABOUTME: Table privilege utilities for rebuilding warehouse tables
// ABOUTME: Parses pg_class ACLs and replays them as GRANT statements on a new table

use anyhow::{bail, Context, Result};
use tokio_postgres::{GenericClient, Transaction};

use crate::utils::{quote_ident, quote_qualified};

/// One grantee's privileges on a table, as recorded in `pg_class.relacl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableGrant {
    /// Role name, or `None` for PUBLIC.
    pub grantee: Option<String>,
    /// Privilege keywords, e.g. `SELECT`, `INSERT`.
    pub privileges: Vec<&'static str>,
    /// Privileges the grantee also held WITH GRANT OPTION. The option itself is not replayed.
    pub dropped_grant_options: Vec<&'static str>,
}

impl TableGrant {
    /// GRANT statement reproducing this entry on `schema.table`.
    pub fn to_sql(&self, schema: &str, table: &str) -> String {
        let grantee = match &self.grantee {
            Some(role) => quote_ident(role),
            None => "PUBLIC".to_string(),
        };
        format!(
            "GRANT {} ON TABLE {} TO {}",
            self.privileges.join(", "),
            quote_qualified(schema, table),
            grantee
        )
    }
}

fn privilege_name(code: char) -> Option<&'static str> {
    match code {
        'r' => Some("SELECT"),
        'w' => Some("UPDATE"),
        'a' => Some("INSERT"),
        'd' => Some("DELETE"),
        'D' => Some("TRUNCATE"),
        'x' => Some("REFERENCES"),
        't' => Some("TRIGGER"),
        'm' => Some("MAINTAIN"),
        _ => None,
    }
}

/// Split the text form of an `aclitem[]` into its elements, undoing array quoting.
fn split_acl_array(acl: &str) -> Vec<String> {
    let inner = acl
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');

    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}

/// Read a possibly double-quoted role name up to `terminator`, returning it and the rest.
fn take_role(input: &str, terminator: char) -> Option<(String, &str)> {
    let mut name = String::new();
    let mut in_quotes = false;
    let mut iter = input.char_indices().peekable();
    while let Some((idx, c)) = iter.next() {
        if c == '"' {
            if in_quotes && matches!(iter.peek(), Some((_, '"'))) {
                name.push('"');
                iter.next();
            } else {
                in_quotes = !in_quotes;
            }
        } else if c == terminator && !in_quotes {
            return Some((name, &input[idx + c.len_utf8()..]));
        } else {
            name.push(c);
        }
    }
    None
}

/// Parse `pg_class.relacl` into grants to replay.
///
/// The owner's own entry is skipped since a new table's owner already holds every privilege.
/// Unknown privilege codes are ignored.
///
/// ```
/// # use warehouse_replicator::postgres::parse_table_acl;
/// let grants = parse_table_acl("{etl=arwdDxt/etl,reader=r/etl,=r/etl}", "etl");
/// assert_eq!(grants.len(), 2);
/// assert_eq!(grants[0].grantee.as_deref(), Some("reader"));
/// assert_eq!(grants[1].grantee, None);
/// ```
pub fn parse_table_acl(acl: &str, owner: &str) -> Vec<TableGrant> {
    let mut grants = Vec::new();

    for item in split_acl_array(acl) {
        let Some((grantee, rest)) = take_role(&item, '=') else {
            tracing::warn!("Skipping unparseable ACL entry '{}'", item);
            continue;
        };
        let codes = rest.split('/').next().unwrap_or_default();

        // Pre-8.1 style group entries
        let grantee = grantee
            .strip_prefix("group ")
            .map(String::from)
            .unwrap_or(grantee);
        if grantee == owner {
            continue;
        }

        let mut privileges = Vec::new();
        let mut dropped_grant_options = Vec::new();
        let mut chars = codes.chars().peekable();
        while let Some(code) = chars.next() {
            let Some(name) = privilege_name(code) else {
                continue;
            };
            privileges.push(name);
            if chars.peek() == Some(&'*') {
                chars.next();
                dropped_grant_options.push(name);
            }
        }

        if privileges.is_empty() {
            continue;
        }
        grants.push(TableGrant {
            grantee: if grantee.is_empty() {
                None
            } else {
                Some(grantee)
            },
            privileges,
            dropped_grant_options,
        });
    }

    grants
}

/// Owner name and ACL of a table, or `None` if the table does not exist.
pub async fn fetch_table_acl(
    client: &impl GenericClient,
    schema: &str,
    table: &str,
) -> Result<Option<(String, Option<String>)>> {
    let row = client
        .query_opt(
            "SELECT pg_get_userbyid(c.relowner)::text, c.relacl::text
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to read privileges of {}.{}", schema, table))?;

    Ok(row.map(|r| (r.get(0), r.get(1))))
}

/// Ensure the connected role may rebuild `schema.table`.
///
/// Renaming and dropping require ownership (or membership in the owning role).
pub async fn check_table_owner(client: &impl GenericClient, schema: &str, table: &str) -> Result<()> {
    let row = client
        .query_opt(
            "SELECT pg_has_role(current_user, c.relowner, 'USAGE'),
                    pg_get_userbyid(c.relowner)::text
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2",
            &[&schema, &table],
        )
        .await
        .context("Failed to check table ownership")?;

    match row {
        None => bail!("Table {}.{} does not exist", schema, table),
        Some(row) if !row.get::<_, bool>(0) => bail!(
            "Cannot rebuild {}.{}: current user is not a member of owning role '{}'",
            schema,
            table,
            row.get::<_, String>(1)
        ),
        Some(_) => Ok(()),
    }
}

/// Apply grants to `schema.table`, each inside its own savepoint.
///
/// A failing GRANT (e.g. the role no longer exists) is rolled back and logged; the
/// transaction stays usable. Returns how many grants were applied.
pub async fn replay_grants(
    tx: &mut Transaction<'_>,
    schema: &str,
    table: &str,
    grants: &[TableGrant],
) -> Result<usize> {
    let mut applied = 0;

    for grant in grants {
        if !grant.dropped_grant_options.is_empty() {
            tracing::warn!(
                "Dropping WITH GRANT OPTION for {} on {}.{} ({})",
                grant.grantee.as_deref().unwrap_or("PUBLIC"),
                schema,
                table,
                grant.dropped_grant_options.join(", ")
            );
        }

        let sql = grant.to_sql(schema, table);
        let savepoint = tx
            .savepoint("replay_grant")
            .await
            .context("Failed to create savepoint for GRANT")?;
        match savepoint.batch_execute(&sql).await {
            Ok(()) => {
                savepoint
                    .commit()
                    .await
                    .context("Failed to release GRANT savepoint")?;
                applied += 1;
            }
            Err(e) => {
                tracing::warn!("Could not replay '{}': {}", sql, e);
                savepoint
                    .rollback()
                    .await
                    .context("Failed to roll back GRANT savepoint")?;
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_acl_skips_owner_and_maps_codes() {
        let grants = parse_table_acl("{etl=arwdDxt/etl,bi=arw/etl}", "etl");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].privileges, vec!["INSERT", "SELECT", "UPDATE"]);
        assert_eq!(
            grants[0].to_sql("analytics", "orders"),
            "GRANT INSERT, SELECT, UPDATE ON TABLE \"analytics\".\"orders\" TO \"bi\""
        );
    }

    #[test]
    fn test_parse_acl_grant_option_and_public() {
        let grants = parse_table_acl("{=r/etl,lead=r*w/etl}", "etl");
        assert_eq!(grants[0].grantee, None);
        assert_eq!(
            grants[0].to_sql("s", "t"),
            "GRANT SELECT ON TABLE \"s\".\"t\" TO PUBLIC"
        );
        assert_eq!(grants[1].privileges, vec!["SELECT", "UPDATE"]);
        assert_eq!(grants[1].dropped_grant_options, vec!["SELECT"]);
    }

    #[test]
    fn test_parse_acl_quoted_role_names() {
        let grants = parse_table_acl(r#"{"\"data team\"=r/etl","group old=r/etl"}"#, "etl");
        assert_eq!(grants[0].grantee.as_deref(), Some("data team"));
        assert_eq!(grants[1].grantee.as_deref(), Some("old"));
    }

    #[test]
    fn test_parse_empty_acl() {
        assert!(parse_table_acl("{}", "etl").is_empty());
        assert!(parse_table_acl("", "etl").is_empty());
    }
}
