use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a supervisable unit: a discovery worker or any other
/// subordinate subprocess registered with the health monitor.
///
/// Workers keep the same `ComponentId` across restarts — C3 respawns a
/// dead worker under its original id so claims, restart counters, and
/// health history all line up with the same logical slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub String);

impl ComponentId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ComponentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ComponentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The `_key` of a `library_files` document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey(pub String);

impl FileKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The deterministic `worker_claims._key` for this file: `"claim_" + file_key`.
    pub fn claim_key(&self) -> String {
        format!("claim_{}", self.0)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for FileKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FileKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// `(model, head, label)` identity for a calibration document;
/// `_key = "{model}:{head}:{label}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalibrationKey {
    pub model: String,
    pub head: String,
    pub label: String,
}

impl CalibrationKey {
    pub fn new(model: impl Into<String>, head: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            head: head.into(),
            label: label.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.model, self.head, self.label)
    }
}

impl fmt::Display for CalibrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}
