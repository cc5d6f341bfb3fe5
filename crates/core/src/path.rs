//! Paths into documents and their dotted serialization.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Ordered list of key segments locating a node inside a document.
/// An empty path addresses the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path(SmallVec<[String; 8]>);

impl Path {
    pub fn root() -> Self { Self(SmallVec::new()) }

    /// Parse a dotted path such as `.spec.foo.bar`. A leading `.` marks the
    /// root and is stripped; empty segments are ignored.
    pub fn parse(dotted: &str) -> Self {
        let s = dotted.strip_prefix('.').unwrap_or(dotted);
        s.split('.').filter(|seg| !seg.is_empty()).map(str::to_owned).collect()
    }

    /// Parse a mapping path which may carry a `$` root marker, e.g. `$.data.#`.
    pub fn parse_xpath(xpath: &str) -> Self {
        Self::parse(xpath.strip_prefix('$').unwrap_or(xpath))
    }

    pub fn segments(&self) -> &[String] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Last segment, if any.
    pub fn base(&self) -> Option<&str> { self.0.last().map(String::as_str) }

    /// Everything but the last segment.
    pub fn dir(&self) -> Path {
        let n = self.0.len().saturating_sub(1);
        self.0[..n].iter().cloned().collect()
    }

    pub fn push(&mut self, seg: impl Into<String>) { self.0.push(seg.into()); }

    pub fn child(&self, seg: impl Into<String>) -> Path {
        let mut p = self.clone();
        p.push(seg);
        p
    }

    /// Same path with its last segment replaced; a root path gains one segment.
    pub fn with_base(&self, seg: impl Into<String>) -> Path {
        let mut p = self.clone();
        p.0.pop();
        p.push(seg);
        p
    }

    pub fn starts_with(&self, seg: &str) -> bool { self.0.first().map(|s| s == seg).unwrap_or(false) }

    pub(crate) fn prefix_of<S: AsRef<str>>(segs: &[S], n: usize) -> Path {
        segs[..n.min(segs.len())].iter().map(|s| s.as_ref().to_owned()).collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        f.write_str(&self.0.join("."))
    }
}

impl FromIterator<String> for Path {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

impl<'a> FromIterator<&'a str> for Path {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_owned).collect())
    }
}

impl From<&[&str]> for Path {
    fn from(segs: &[&str]) -> Self { segs.iter().copied().collect() }
}

impl AsRef<[String]> for Path {
    fn as_ref(&self) -> &[String] { &self.0 }
}
