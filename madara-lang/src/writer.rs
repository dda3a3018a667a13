use std::fmt;
use std::sync::Arc;

/// The originator of a write: typically `host:port` of the writing process,
/// but any lexicographically-comparable string is accepted. Tie-breaks in
/// the conflict-resolution rule (spec I2) compare `WriterId`s
/// lexicographically.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WriterId(pub Arc<str>);

impl WriterId {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        WriterId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WriterId {
    fn from(s: &str) -> Self {
        WriterId(Arc::from(s))
    }
}

impl From<String> for WriterId {
    fn from(s: String) -> Self {
        WriterId(Arc::from(s.as_str()))
    }
}
