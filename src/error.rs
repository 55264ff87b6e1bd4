use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum DocbaseError {
    #[error("Database already open: {0}")]
    AlreadyOpen(String),
    #[error("Reference is disposed")]
    Disposed,
    #[error("Duplicate name: {0}")]
    DuplicateName(String),
    #[error("Invalid field name: {0:?}")]
    InvalidFieldName(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Wrong password for database file")]
    WrongPassword,
}

impl DocbaseError {
    /// True for failures the embedding application should treat as a credential
    /// prompt rather than a fatal store error.
    pub fn is_wrong_password(&self) -> bool {
        matches!(self, DocbaseError::WrongPassword)
    }
}

impl From<JsonError> for DocbaseError {
    fn from(src: JsonError) -> DocbaseError {
        DocbaseError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<uuid::Error> for DocbaseError {
    fn from(src: uuid::Error) -> DocbaseError {
        DocbaseError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<io::Error> for DocbaseError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => DocbaseError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => DocbaseError::PermissionDenied,
            _ => DocbaseError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<rusqlite::Error> for DocbaseError {
    fn from(src: rusqlite::Error) -> Self {
        match src {
            rusqlite::Error::QueryReturnedNoRows => {
                DocbaseError::NotFound("query returned no rows".to_string())
            }
            other => DocbaseError::Store(format!("sqlite error: {other}")),
        }
    }
}

impl From<hex::FromHexError> for DocbaseError {
    fn from(src: hex::FromHexError) -> Self {
        DocbaseError::Serialization(format!("Hex decode failed: {src}"))
    }
}
