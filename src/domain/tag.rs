//! Tags attached to an execution context.
//!
//! Tags distinguish otherwise identical binaries, e.g. a `filebeat` started
//! as a monitoring sidecar of another program.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

/// Ordered tag set; ordering keeps hashing and serialization stable
pub type Tags = BTreeMap<Tag, String>;

impl Tag {
    /// Marks a program as a sidecar
    pub const SIDECAR: &'static str = "sidecar";

    /// Names the program a sidecar is attached to
    pub const SIDECAR_OF: &'static str = "sidecar-of";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tags for a sidecar attached to `monitored`
pub fn sidecar_tags(monitored: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(Tag::new(Tag::SIDECAR), "true".to_string());
    tags.insert(Tag::new(Tag::SIDECAR_OF), monitored.to_string());
    tags
}

/// Whether the tag set marks a sidecar
pub fn is_sidecar(tags: &Tags) -> bool {
    tags.get(&Tag::new(Tag::SIDECAR))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Parse `key=value` pairs (as given on the command line)
pub fn parse_tags<'a>(pairs: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Tags> {
    let mut tags = Tags::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid tag '{}', expected key=value", pair))?;
        if key.trim().is_empty() {
            anyhow::bail!("Invalid tag '{}', key cannot be empty", pair);
        }
        tags.insert(Tag::new(key.trim()), value.trim().to_string());
    }
    Ok(tags)
}
