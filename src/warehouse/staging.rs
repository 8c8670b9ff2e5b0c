// ABOUTME: Local CSV staging files for COPY-based bulk loads
// ABOUTME: Writes extracted rows in PostgreSQL CSV format inside a managed temp directory

use anyhow::{Context, Result};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use std::path::{Path, PathBuf};

use crate::source::{ResultSet, SqlValue};

/// Unquoted field that `COPY` reads as NULL; see the `NULL` option in the load statement.
pub const NULL_MARKER: &str = "\\N";

fn csv_field(value: &SqlValue) -> String {
    // A text value of exactly \N also loads as NULL
    value.to_text().unwrap_or_else(|| NULL_MARKER.to_string())
}

/// Write rows to `path` as CSV without a header. Returns the number of rows written.
pub fn write_csv(path: &Path, rows: &ResultSet) -> Result<u64> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)
        .with_context(|| format!("Failed to create staging file {}", path.display()))?;

    for row in &rows.rows {
        writer
            .write_record(row.iter().map(csv_field))
            .with_context(|| format!("Failed to write staging file {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush staging file {}", path.display()))?;

    Ok(rows.len() as u64)
}

/// Staging files for one worker, living in a managed temp directory.
///
/// The directory is removed on drop; directories orphaned by killed processes are
/// collected at startup by [`crate::utils::cleanup_stale_temp_dirs`].
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: crate::utils::create_managed_temp_dir()?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `rows` to `<dir>/<name>.csv`.
    pub fn write(&self, name: &str, rows: &ResultSet) -> Result<(PathBuf, u64)> {
        let file_name = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect::<String>();
        let path = self.dir.join(format!("{}.csv", file_name));
        let count = write_csv(&path, rows)?;
        tracing::debug!("Staged {} row(s) to {}", count, path.display());
        Ok((path, count))
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if let Err(e) = crate::utils::remove_managed_temp_dir(&self.dir) {
            tracing::warn!("Failed to clean up staging directory: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_and_null_stay_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let rows = ResultSet {
            columns: vec!["a".into(), "b".into(), "c".into()],
            rows: vec![vec![
                SqlValue::Text(String::new()),
                SqlValue::Null,
                SqlValue::Text("say \"hi\", ok".into()),
            ]],
        };

        write_csv(&path, &rows).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            ",\\N,\"say \"\"hi\"\", ok\"\n"
        );
    }

    #[test]
    fn test_staging_area_writes_and_cleans_up() {
        let rows = ResultSet {
            columns: vec!["id".into(), "note".into()],
            rows: vec![
                vec![SqlValue::Int(1), SqlValue::Text("line\nbreak".into())],
                vec![SqlValue::Int(2), SqlValue::Null],
            ],
        };

        let area = StagingArea::new().unwrap();
        let dir = area.dir().to_path_buf();
        let (path, count) = area.write("shop.orders", &rows).unwrap();
        assert_eq!(count, 2);
        assert!(path.ends_with("shop_orders.csv"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "1,\"line\nbreak\"\n2,\\N\n"
        );

        drop(area);
        assert!(!dir.exists());
    }
}
