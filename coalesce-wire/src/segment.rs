use serde::{Deserialize, Serialize};

/// One step of a message path: either a child name (UTF-8, the common case
/// for statically registered children) or an opaque key (dynamic children
/// of container collabs, or a leaf op payload).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Name(String),
    Key(Vec<u8>),
}

impl PathSegment {
    pub fn name(s: impl Into<String>) -> Self {
        PathSegment::Name(s.into())
    }

    pub fn key(b: impl Into<Vec<u8>>) -> Self {
        PathSegment::Key(b.into())
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            PathSegment::Name(s) => Some(s),
            PathSegment::Key(_) => None,
        }
    }

    pub fn as_key(&self) -> Option<&[u8]> {
        match self {
            PathSegment::Name(_) => None,
            PathSegment::Key(b) => Some(b),
        }
    }
}

impl std::fmt::Debug for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Name(s) => write!(f, "{s:?}"),
            PathSegment::Key(b) => write!(f, "key[{}B]", b.len()),
        }
    }
}
