// ABOUTME: Error taxonomy for table synchronization
// ABOUTME: Every variant is fatal to one table only and is reported with the failing stage

use thiserror::Error;

/// Errors that terminate the synchronization of a single table.
///
/// Collaborators (sources, warehouse, index store) report `anyhow::Error`; the sync
/// engine classifies them into one of these variants depending on the stage that failed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid table configuration, detected before touching any database.
    #[error("Conflicting configuration for table {table}: {message}")]
    Configuration { table: String, message: String },

    /// A source column whose type cannot be mapped to a warehouse type.
    #[error("Unsupported type '{type_name}' for column '{column}' in {table}")]
    UnsupportedType {
        table: String,
        column: String,
        type_name: String,
    },

    /// A substitution reference in manual SQL that does not resolve.
    #[error("Could not resolve template reference '{reference}' in {table}")]
    TemplateResolution { table: String, reference: String },

    /// The destination table does not match the columns the source produces.
    #[error("Destination table {table} has columns not present in the source: {columns}")]
    SchemaMismatch { table: String, columns: String },

    /// The source or target database could not be reached.
    #[error("Could not connect for {table}")]
    Connection {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reading from the source database failed.
    #[error("Extraction failed for {table}")]
    Extraction {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// Staging, bulk loading, or target DDL failed.
    #[error("Load failed for {table}")]
    Load {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reading or writing the persisted watermark failed.
    #[error("Watermark update failed for {table}")]
    Watermark {
        table: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    pub fn configuration(table: &str, message: impl Into<String>) -> Self {
        SyncError::Configuration {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub fn connection(table: &str, source: anyhow::Error) -> Self {
        SyncError::Connection {
            table: table.to_string(),
            source,
        }
    }

    pub fn extraction(table: &str, source: anyhow::Error) -> Self {
        SyncError::Extraction {
            table: table.to_string(),
            source,
        }
    }

    pub fn load(table: &str, source: anyhow::Error) -> Self {
        SyncError::Load {
            table: table.to_string(),
            source,
        }
    }

    pub fn watermark(table: &str, source: anyhow::Error) -> Self {
        SyncError::Watermark {
            table: table.to_string(),
            source,
        }
    }

    /// Short, stable name of the error class, used in reports and events.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration { .. } => "configuration",
            SyncError::UnsupportedType { .. } => "unsupported_type",
            SyncError::TemplateResolution { .. } => "template_resolution",
            SyncError::SchemaMismatch { .. } => "schema_mismatch",
            SyncError::Connection { .. } => "connection",
            SyncError::Extraction { .. } => "extraction",
            SyncError::Load { .. } => "load",
            SyncError::Watermark { .. } => "watermark",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_message_names_table() {
        let err = SyncError::configuration("orders", "Append_only with full_refresh");
        assert_eq!(
            err.to_string(),
            "Conflicting configuration for table orders: Append_only with full_refresh"
        );
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_wrapped_errors_keep_source_chain() {
        let err = SyncError::extraction("orders", anyhow::anyhow!("connection reset"));
        let chain = format!("{:?}", anyhow::Error::from(err));
        assert!(chain.contains("Extraction failed for orders"));
        assert!(chain.contains("connection reset"));
    }
}
