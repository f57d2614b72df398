//! Shared types for the docfeed workspace.
//!
//! This crate provides the value types that cross crate boundaries: stored
//! rows, row identifiers, validated table and channel names, and the raw
//! notification envelope delivered by the store's publish/subscribe layer.
//!
//! Nothing here talks to a database or a runtime. Keeping these types in a
//! leaf crate lets the store, the stream coordinator, and the HTTP server
//! agree on them without depending on each other.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identifier accepted for tables and channel prefixes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Identifier prefixes reserved for SQLite internals and docfeed bookkeeping.
const RESERVED_PREFIXES: &[&str] = &["sqlite_", "_docfeed_"];

/// Identifier of a stored row.
///
/// Assigned exclusively by the store at insert time and strictly increasing
/// within a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl RowId {
    /// Returns the raw integer value.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RowId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A single document row.
///
/// `data` is opaque to everything except the predicate renderer in the
/// store: the stream coordinator only moves it around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Store-assigned row ID.
    pub id: RowId,
    /// The stored JSON document.
    pub data: serde_json::Value,
}

/// A raw notification as published on a channel.
///
/// The payload is the decimal string of the inserted row's ID. It is kept as
/// text here; validating it is the listener's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The channel the notification was published on.
    pub channel: String,
    /// The textual payload.
    pub payload: String,
}

/// Errors produced when validating identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The identifier was empty.
    #[error("identifier must not be empty")]
    Empty,

    /// The identifier exceeded [`MAX_IDENTIFIER_LEN`] bytes.
    #[error("identifier '{0}' is longer than {MAX_IDENTIFIER_LEN} bytes")]
    TooLong(String),

    /// The identifier contained characters outside `[A-Za-z0-9_]` or started
    /// with a digit.
    #[error("identifier '{0}' must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidCharacters(String),

    /// The identifier used a reserved prefix.
    #[error("identifier '{0}' uses a reserved prefix")]
    Reserved(String),
}

fn validate_identifier(value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::TooLong(value.to_string()));
    }

    let mut chars = value.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(IdentifierError::InvalidCharacters(value.to_string()));
    }

    let lower = value.to_ascii_lowercase();
    if RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Err(IdentifierError::Reserved(value.to_string()));
    }

    Ok(())
}

/// A validated document table name.
///
/// Table names are interpolated into DDL and trigger bodies, so only plain
/// SQL identifiers are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    /// Validates and wraps a table name.
    ///
    /// # Errors
    ///
    /// Returns `IdentifierError` if the name is not a plain SQL identifier.
    pub fn new(name: impl Into<String>) -> Result<Self, IdentifierError> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    /// Returns the table name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TableName {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for TableName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// A validated notification channel name.
///
/// Channels are derived deterministically as `{prefix}_{table}`, where the
/// prefix is per-deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Derives the channel for `table` under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `IdentifierError` if the prefix is not a plain SQL identifier
    /// or the combined name is too long.
    pub fn for_table(prefix: &str, table: &TableName) -> Result<Self, IdentifierError> {
        validate_identifier(prefix)?;
        let name = format!("{prefix}_{table}");
        if name.len() > MAX_IDENTIFIER_LEN * 2 {
            return Err(IdentifierError::TooLong(name));
        }
        Ok(Self(name))
    }

    /// Returns the channel name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates a notification channel prefix without deriving a channel.
///
/// # Errors
///
/// Returns `IdentifierError` if the prefix is not a plain SQL identifier.
pub fn validate_prefix(prefix: &str) -> Result<(), IdentifierError> {
    validate_identifier(prefix)
}
