use std::fmt;
use std::sync::Arc;

use bson::Bson;

use crate::record::MappedRecord;

/// Computes a name from a record.
pub type DeriveName<R> = Arc<dyn Fn(&R) -> Option<String> + Send + Sync>;

/// A name that is either fixed or computed per record.
///
/// Used for both bucket names and stored filenames. Empty results count as
/// absent.
pub enum NameSource<R> {
    Literal(String),
    Derived(DeriveName<R>),
}

impl<R> NameSource<R> {
    pub fn literal(name: impl Into<String>) -> Self {
        Self::Literal(name.into())
    }

    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&R) -> Option<String> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(derive))
    }

    pub fn resolve(&self, record: &R) -> Option<String> {
        let name = match self {
            Self::Literal(name) => Some(name.clone()),
            Self::Derived(derive) => derive(record),
        };
        name.filter(|name| !name.is_empty())
    }
}

impl<R: MappedRecord + 'static> NameSource<R> {
    /// Read the name from a string field of the record.
    pub fn field(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::derived(move |record: &R| match record.get(&path) {
            Some(Bson::String(value)) => Some(value),
            _ => None,
        })
    }
}

impl<R> Clone for NameSource<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Literal(name) => Self::Literal(name.clone()),
            Self::Derived(derive) => Self::Derived(Arc::clone(derive)),
        }
    }
}

impl<R> From<&str> for NameSource<R> {
    fn from(name: &str) -> Self {
        Self::literal(name)
    }
}

impl<R> From<String> for NameSource<R> {
    fn from(name: String) -> Self {
        Self::Literal(name)
    }
}

impl<R> fmt::Debug for NameSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(name) => f.debug_tuple("Literal").field(name).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}
