//! Execution context: the deterministic identity of a program instance.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::tag::Tags;

/// Identity of a logical program instance.
///
/// Two contexts with the same `id` refer to the same instance, so repeated
/// lifecycle events for a program resolve to one identity without a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Name of the binary (e.g. "filebeat")
    pub binary_name: String,

    /// Version of the binary
    pub version: String,

    /// Tags distinguishing instances of the same binary
    #[serde(default)]
    pub tags: Tags,

    /// `binary--version[--taghash]`
    pub id: String,
}

impl ExecutionContext {
    /// Create a context, computing its id
    pub fn new(binary_name: impl Into<String>, version: impl Into<String>, tags: Tags) -> Self {
        let binary_name = binary_name.into();
        let version = version.into();
        let id = compute_id(&binary_name, &version, &tags);

        Self {
            binary_name,
            version,
            tags,
            id,
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

fn compute_id(binary_name: &str, version: &str, tags: &Tags) -> String {
    let base = format!("{}--{}", binary_name, version);
    if tags.is_empty() {
        return base;
    }
    format!("{}--{}", base, hash_tags(tags))
}

/// Hash a tag set (first 16 hex chars of SHA256 over sorted `k=v` lines)
pub fn hash_tags(tags: &Tags) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in tags {
        hasher.update(key.as_str().as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tag::{sidecar_tags, Tag};

    #[test]
    fn test_id_without_tags() {
        let ctx = ExecutionContext::new("filebeat", "7.8.0", Tags::new());
        assert_eq!(ctx.id, "filebeat--7.8.0");
        assert_eq!(ctx.to_string(), "filebeat--7.8.0");
    }

    #[test]
    fn test_id_with_tags() {
        let ctx = ExecutionContext::new("filebeat", "7.8.0", sidecar_tags("metricbeat"));

        let parts: Vec<&str> = ctx.id.split("--").collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "filebeat");
        assert_eq!(parts[1], "7.8.0");
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn test_id_is_order_independent() {
        let mut a = Tags::new();
        a.insert(Tag::from("x"), "1".to_string());
        a.insert(Tag::from("y"), "2".to_string());

        let mut b = Tags::new();
        b.insert(Tag::from("y"), "2".to_string());
        b.insert(Tag::from("x"), "1".to_string());

        assert_eq!(
            ExecutionContext::new("bin", "1.0", a).id,
            ExecutionContext::new("bin", "1.0", b).id
        );
    }

    #[test]
    fn test_different_tags_different_ids() {
        let plain = ExecutionContext::new("filebeat", "1.0", Tags::new());
        let sidecar_a = ExecutionContext::new("filebeat", "1.0", sidecar_tags("a"));
        let sidecar_b = ExecutionContext::new("filebeat", "1.0", sidecar_tags("b"));

        assert_ne!(plain.id, sidecar_a.id);
        assert_ne!(sidecar_a.id, sidecar_b.id);
    }
}
