use std::{fmt::Display, str::FromStr};

use crate::StateError;

/// Separator between the segments of a [`SectionPath`].
pub const SEGMENT_DELIMITER: char = ':';

/// A validated, colon-delimited path into the state document, such as
/// `"Parameters"` or `"Parent:Child:Grandchild"`.
///
/// Paths are never empty and never contain empty segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionPath(String);

impl SectionPath {
    pub fn new(path: &str) -> Result<Self, StateError> {
        if path.is_empty() {
            return Err(StateError::InvalidSectionName {
                name: path.to_owned(),
                reason: "section name must not be empty",
            });
        }
        if path.split(SEGMENT_DELIMITER).any(str::is_empty) {
            return Err(StateError::InvalidSectionName {
                name: path.to_owned(),
                reason: "section name must not contain empty segments",
            });
        }
        Ok(SectionPath(path.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEGMENT_DELIMITER)
    }

    /// Whether `other` is this path or nested below it.
    pub fn contains(&self, other: &SectionPath) -> bool {
        other
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(SEGMENT_DELIMITER))
    }

    /// Whether the two paths address intersecting parts of the document.
    pub fn overlaps(&self, other: &SectionPath) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The RFC 6901 JSON pointer that addresses this section in the nested
    /// document.
    pub fn to_json_pointer(&self) -> String {
        let mut pointer = String::with_capacity(self.0.len() + 1);
        for segment in self.segments() {
            pointer.push('/');
            pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
        }
        pointer
    }
}

impl FromStr for SectionPath {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectionPath::new(s)
    }
}

impl Display for SectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
