//! Response paths.
//!
//! A [`Path`] is an immutable, singly-linked list of [`PathSegment`]s built
//! root-to-leaf by cheap `Arc` sharing, mirroring how a field executor
//! extends the path one segment at a time as it recurses into a selection
//! set without ever mutating an ancestor's path.

use std::fmt;
use std::sync::Arc;

/// One step in a response path: a field's response key, or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(Arc<str>),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{name}"),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        Self::Field(Arc::from(s))
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        Self::Field(Arc::from(s.as_str()))
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum Link {
    Root,
    Cons { prev: Path, segment: PathSegment },
}

/// An immutable response path, shared by `Arc` so that extending a path at
/// one response position never affects a sibling holding the same prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Path(Arc<Link>);

impl Path {
    /// The empty path, at the root of the response.
    #[must_use]
    pub fn root() -> Self {
        Self(Arc::new(Link::Root))
    }

    /// Appends one segment, returning a new path. The receiver is untouched.
    #[must_use]
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        Self(Arc::new(Link::Cons {
            prev: self.clone(),
            segment: segment.into(),
        }))
    }

    /// True if this path has no segments.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(*self.0, Link::Root)
    }

    /// The segments of this path, root-first.
    #[must_use]
    pub fn segments(&self) -> Vec<PathSegment> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<PathSegment>) {
        if let Link::Cons { prev, segment } = &*self.0 {
            prev.collect_into(out);
            out.push(segment.clone());
        }
    }

    /// True iff `self` is a prefix of `other` (including `self == other`).
    #[must_use]
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        theirs.len() >= mine.len() && theirs[..mine.len()] == mine[..]
    }

    /// Strips a prefix, returning the remaining suffix segments. Returns
    /// `None` if `prefix` is not in fact a prefix of `self`.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Vec<PathSegment>> {
        if !prefix.is_prefix_of(self) {
            return None;
        }
        let mine = self.segments();
        Some(mine[prefix.segments().len()..].to_vec())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.segments()).finish()
    }
}

impl Default for Path {
    fn default() -> Self {
        Self::root()
    }
}

impl FromIterator<PathSegment> for Path {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        let mut path = Path::root();
        for segment in iter {
            path = path.child(segment);
        }
        path
    }
}
