use std::io;
use std::path::Path;

use similar::{ChangeTag, TextDiff};

use super::content::CanonicalContent;
use super::guard::{Digest, digest};

/// Snapshot of the target file, read fresh for every decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservedState {
    Missing,
    Present(Vec<u8>),
}

impl ObservedState {
    /// Reads the target. A missing file is a state, not an error.
    pub async fn load(path: &Path) -> io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Self::Present(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::Missing),
            Err(err) => Err(err),
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn content(&self) -> Option<&[u8]> {
        match self {
            Self::Present(bytes) => Some(bytes),
            Self::Missing => None,
        }
    }

    pub fn digest(&self) -> Option<Digest> {
        self.content().map(digest)
    }
}

/// Exact byte comparison; no whitespace or line-ending normalisation.
pub fn needs_repair(observed: &ObservedState, canonical: &CanonicalContent) -> bool {
    if canonical.is_disabled() {
        return false;
    }

    match observed {
        ObservedState::Missing => true,
        ObservedState::Present(bytes) => bytes.as_slice() != canonical.as_bytes(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriftLine {
    Context(String),
    /// Present in the canonical content, missing on disk.
    Added(String),
    /// Present on disk, not part of the canonical content.
    Removed(String),
}

/// Line-level view of how the file on disk differs from the canonical content.
#[derive(Clone, Debug, Default)]
pub struct Drift {
    pub lines: Vec<DriftLine>,
}

impl Drift {
    pub fn added(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, DriftLine::Added(_)))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, DriftLine::Removed(_)))
            .count()
    }
}

pub fn compute_drift(observed: &ObservedState, canonical: &CanonicalContent) -> Drift {
    let on_disk = String::from_utf8_lossy(observed.content().unwrap_or_default());

    let diff = TextDiff::from_lines(&*on_disk, canonical.as_str());
    let mut lines = Vec::new();

    for change in diff.iter_all_changes() {
        let line = change.to_string();
        let drift_line = match change.tag() {
            ChangeTag::Delete => DriftLine::Removed(line),
            ChangeTag::Insert => DriftLine::Added(line),
            ChangeTag::Equal => DriftLine::Context(line),
        };
        lines.push(drift_line);
    }

    Drift { lines }
}
