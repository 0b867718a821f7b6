//! # Datastore Error Types
//!
//! Structured error handling for the storage layer using thiserror. One
//! item's storage failure aborts that item's transaction; the queue runner
//! isolates it from the rest of the batch.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Transaction already committed or rolled back")]
    TransactionClosed,

    #[error("Invalid stored value for {column}: {message}")]
    InvalidStoredValue { column: String, message: String },

    #[error("Internal datastore error: {message}")]
    Internal { message: String },
}

impl DatastoreError {
    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create an invalid stored value error
    pub fn invalid_stored_value(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStoredValue {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for DatastoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatastoreError::database("no rows found"),
            sqlx::Error::Database(db_err) => DatastoreError::database(db_err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DatastoreError::transaction(err.to_string())
            }
            _ => DatastoreError::database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for DatastoreError {
    fn from(err: serde_json::Error) -> Self {
        DatastoreError::serialization(err.to_string())
    }
}

/// Result type alias for datastore operations
pub type DatastoreResult<T> = Result<T, DatastoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DatastoreError::database("connection refused");
        assert!(matches!(err, DatastoreError::Database { .. }));
        assert!(format!("{err}").contains("connection refused"));

        let err = DatastoreError::invalid_stored_value("source_type", "unknown value");
        assert!(format!("{err}").contains("source_type"));
    }

    #[test]
    fn test_sqlx_conversion() {
        let err: DatastoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DatastoreError::Database { .. }));

        let err: DatastoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DatastoreError::Transaction { .. }));
    }

    #[test]
    fn test_serde_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: DatastoreError = json_err.into();
        assert!(matches!(err, DatastoreError::Serialization { .. }));
    }
}
