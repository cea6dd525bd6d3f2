//! Connection options and URI parsing.

use crate::error::{Result, StoreError};
use std::path::PathBuf;

/// Default number of resolved page reads cached per connection.
pub const DEFAULT_PAGE_CACHE_SIZE: usize = 256;

/// Per-connection options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Enable branching. Without it pages are stored unversioned.
    pub branches: bool,

    /// Keep the branch directory seen at open time instead of re-reading it
    /// every statement.
    pub single_connection: bool,

    /// Upper bound on the database file size in bytes.
    pub max_db_size: Option<u64>,

    /// Resolved page reads cached per connection (0 disables the cache).
    pub page_cache_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            branches: false,
            single_connection: false,
            max_db_size: None,
            page_cache_size: DEFAULT_PAGE_CACHE_SIZE,
        }
    }
}

impl ConnectOptions {
    /// Options with branching enabled.
    pub fn branching() -> Self {
        Self {
            branches: true,
            ..Default::default()
        }
    }

    /// Parse `file:PATH?key=value&...`. Unknown keys are ignored.
    pub fn from_uri(uri: &str) -> Result<(PathBuf, Self)> {
        let rest = uri
            .strip_prefix("file://")
            .or_else(|| uri.strip_prefix("file:"))
            .unwrap_or(uri);
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };
        if path.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "no path in URI {:?}",
                uri
            )));
        }

        let mut options = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "on"));
            match key.to_ascii_lowercase().as_str() {
                "branches" => options.branches = parse_bool(key, value)?,
                "single_connection" => options.single_connection = parse_bool(key, value)?,
                "max_db_size" => options.max_db_size = Some(parse_u64(key, value)?),
                "page_cache_size" => options.page_cache_size = parse_u64(key, value)? as usize,
                _ => {}
            }
        }
        Ok((PathBuf::from(path), options))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => Err(StoreError::InvalidArgument(format!(
            "{}={} is not a boolean",
            key, value
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        StoreError::InvalidArgument(format!("{}={} is not a number", key, value))
    })
}
