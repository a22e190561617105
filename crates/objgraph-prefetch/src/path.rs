//! Dot-separated relationship paths.

use objgraph_core::{Error, PathError, PathErrorKind, RelationshipDescriptor, Result, Schema};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

const SEGMENT_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn segment_regex() -> Option<&'static Regex> {
    static SEGMENT: OnceLock<Option<Regex>> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(SEGMENT_PATTERN).ok()).as_ref()
}

/// A parsed object-level relationship path such as `toArtist.groupArray`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipPath {
    segments: Vec<String>,
}

impl RelationshipPath {
    /// Split and validate a path. Does not check it against any entity.
    pub fn parse(root: &str, path: &str) -> Result<Self> {
        let fail = |kind, message: String| {
            Error::Path(PathError {
                kind,
                root: root.to_string(),
                path: path.to_string(),
                message,
            })
        };

        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(fail(PathErrorKind::EmptySegment, "path is empty".to_string()));
        }

        let mut segments = Vec::new();
        for (position, segment) in trimmed.split('.').enumerate() {
            if segment.is_empty() {
                return Err(fail(
                    PathErrorKind::EmptySegment,
                    format!("segment {} is empty", position + 1),
                ));
            }
            if !segment_regex().is_some_and(|re| re.is_match(segment)) {
                return Err(fail(
                    PathErrorKind::InvalidSegment,
                    format!("'{segment}' is not a relationship name"),
                ));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Relationship names, root first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Walk the path from `root`, returning the relationship crossed at each step.
    pub fn resolve<'s>(
        &self,
        schema: &'s Schema,
        root: &str,
    ) -> Result<Vec<&'s RelationshipDescriptor>> {
        let mut entity = schema.entity(root)?;
        let mut steps = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let relationship = entity.find_relationship(segment).ok_or_else(|| {
                Error::Path(PathError {
                    kind: PathErrorKind::UnknownRelationship,
                    root: root.to_string(),
                    path: self.to_string(),
                    message: format!("entity '{}' has no relationship '{}'", entity.name, segment),
                })
            })?;
            entity = schema.entity(&relationship.target)?;
            steps.push(relationship);
        }
        Ok(steps)
    }
}

impl fmt::Display for RelationshipPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}
