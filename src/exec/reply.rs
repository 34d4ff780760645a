//! Command replies
//!
//! The reply shape the core hands back to the (external) protocol layer.
//! Per-operation failures inside a transaction commit are embedded as
//! [`Reply::Error`] so the surrounding commit can keep its no-rollback
//! semantics.

use crate::error::CoreError;
use bytes::Bytes;

/// Reply of one executed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Generic success
    Ok,
    /// Absent key / absent element
    Nil,
    Integer(i64),
    Bulk(Bytes),
    /// Sorted-set score
    Double(f64),
    Array(Vec<Reply>),
    /// Cursor page from `Scan`
    Scan { next: u64, keys: Vec<Bytes> },
    /// Per-operation error inside a transaction reply vector
    Error(CoreError),
}

impl Reply {
    pub fn bulk(bytes: impl Into<Bytes>) -> Self {
        Reply::Bulk(bytes.into())
    }

    pub fn array(items: Vec<Reply>) -> Self {
        Reply::Array(items)
    }

    /// Bulk array from raw byte strings
    pub fn bulk_array(items: impl IntoIterator<Item = Bytes>) -> Self {
        Reply::Array(items.into_iter().map(Reply::Bulk).collect())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Reply::Integer(7).as_integer(), Some(7));
        assert_eq!(Reply::Nil.as_integer(), None);
        assert!(Reply::Nil.is_nil());
        assert_eq!(
            Reply::bulk("x").as_bulk(),
            Some(&Bytes::from("x"))
        );
    }
}
