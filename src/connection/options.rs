// src/connection/options.rs

//! Arguments shared by the data operations.

use crate::core::protocol::IteratorKind;
use std::fmt;
use std::time::Duration;

/// A space given either by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpaceRef {
    Id(u32),
    Name(String),
}

/// An index given either by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexRef {
    Id(u32),
    Name(String),
}

impl Default for IndexRef {
    /// The primary key.
    fn default() -> Self {
        IndexRef::Id(0)
    }
}

impl From<u32> for SpaceRef {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl From<&str> for SpaceRef {
    fn from(name: &str) -> Self {
        SpaceRef::Name(name.to_string())
    }
}

impl From<String> for SpaceRef {
    fn from(name: String) -> Self {
        SpaceRef::Name(name)
    }
}

impl From<u32> for IndexRef {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        IndexRef::Name(name.to_string())
    }
}

impl From<String> for IndexRef {
    fn from(name: String) -> Self {
        IndexRef::Name(name)
    }
}

impl fmt::Display for SpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceRef::Id(id) => write!(f, "#{id}"),
            SpaceRef::Name(name) => f.write_str(name),
        }
    }
}

impl fmt::Display for IndexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexRef::Id(id) => write!(f, "#{id}"),
            IndexRef::Name(name) => f.write_str(name),
        }
    }
}

/// Scan parameters of a `select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOptions {
    pub iterator: IteratorKind,
    pub limit: u32,
    pub offset: u32,
    /// Overrides the connection's default request timeout.
    pub timeout: Option<Duration>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            iterator: IteratorKind::Eq,
            limit: u32::MAX,
            offset: 0,
            timeout: None,
        }
    }
}

impl SelectOptions {
    /// Every tuple of the index, in index order.
    pub fn all() -> Self {
        Self {
            iterator: IteratorKind::All,
            ..Self::default()
        }
    }

    pub fn iterator(mut self, iterator: IteratorKind) -> Self {
        self.iterator = iterator;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
