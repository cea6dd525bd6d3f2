//! Commit range selectors: `N`, `N-M`, `*-M`, `N-*` and `*`.

use crate::error::{Result, StoreError};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CommitRange {
    /// Whole lineage up to the head.
    #[default]
    All,
    /// Exactly one commit, which must exist.
    Single(u64),
    /// Inclusive span; `None` ends are open.
    Span { start: Option<u64>, end: Option<u64> },
}

impl CommitRange {
    /// Inclusive `(first, last)` commits selected when the head is `head`.
    /// An empty selection comes back with `first > last`.
    pub fn resolve(&self, head: u64) -> Result<(u64, u64)> {
        match *self {
            CommitRange::All => Ok((1, head)),
            CommitRange::Single(n) => {
                if n == 0 || n > head {
                    return Err(StoreError::NotFound(format!("commit {}", n)));
                }
                Ok((n, n))
            }
            CommitRange::Span { start, end } => {
                if let (Some(s), Some(e)) = (start, end) {
                    if s > e {
                        return Err(StoreError::InvalidArgument(format!(
                            "range start {} is after end {}",
                            s, e
                        )));
                    }
                }
                let first = start.unwrap_or(1).max(1);
                let last = end.map_or(head, |e| e.min(head));
                Ok((first, last))
            }
        }
    }
}

fn bound(part: &str) -> Result<Option<u64>> {
    if part == "*" {
        return Ok(None);
    }
    part.parse::<u64>()
        .map(Some)
        .map_err(|_| StoreError::InvalidArgument(format!("bad commit {:?}", part)))
}

impl FromStr for CommitRange {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(CommitRange::All);
        }
        match s.split_once('-') {
            None => match bound(s)? {
                Some(n) => Ok(CommitRange::Single(n)),
                None => Ok(CommitRange::All),
            },
            Some((start, end)) => Ok(CommitRange::Span {
                start: bound(start.trim())?,
                end: bound(end.trim())?,
            }),
        }
    }
}

impl fmt::Display for CommitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |b: Option<u64>| b.map_or("*".to_string(), |n| n.to_string());
        match *self {
            CommitRange::All => write!(f, "*"),
            CommitRange::Single(n) => write!(f, "{}", n),
            CommitRange::Span { start, end } => write!(f, "{}-{}", part(start), part(end)),
        }
    }
}
