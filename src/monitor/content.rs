use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// The text the target file should contain.
///
/// Cheap to clone; replaced wholesale through [`ContentStore::set`].
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CanonicalContent(Arc<str>);

impl CanonicalContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::from(text.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Empty or whitespace-only content switches repair off.
    pub fn is_disabled(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for CanonicalContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalContent")
            .field("len", &self.0.len())
            .field("lines", &self.0.lines().count())
            .finish()
    }
}

impl From<String> for CanonicalContent {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for CanonicalContent {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Owns the canonical content and signals every replacement to subscribers.
#[derive(Debug)]
pub struct ContentStore {
    tx: watch::Sender<CanonicalContent>,
}

impl ContentStore {
    pub fn new(initial: impl Into<CanonicalContent>) -> Self {
        let (tx, _rx) = watch::channel(initial.into());
        Self { tx }
    }

    pub fn get(&self) -> CanonicalContent {
        self.tx.borrow().clone()
    }

    /// Replaces the stored content. Subscribers are only woken when the value
    /// actually changed; returns whether it did.
    pub fn set(&self, text: impl Into<CanonicalContent>) -> bool {
        let next = text.into();
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<CanonicalContent> {
        self.tx.subscribe()
    }
}
