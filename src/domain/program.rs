//! Program: the unit the operator acts on.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::context::ExecutionContext;
use super::spec::{Configurable, ProcessSpec};
use super::tag::Tags;

/// Configuration blob handed to a program
pub type ProgramConfig = Map<String, Value>;

/// Target platform used for artifact and install naming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl Platform {
    /// Platform of the running orchestrator
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Artifact name for a binary on this platform
    pub fn artifact_name(&self, binary_name: &str, version: &str) -> String {
        format!("{}-{}-{}-{}", binary_name, version, self.os, self.arch)
    }
}

/// A program instance: identity, configuration, and install location.
///
/// Cloning is cheap; clones share the cached process spec.
#[derive(Clone)]
pub struct Program {
    context: ExecutionContext,
    config: Arc<ProgramConfig>,
    install_root: PathBuf,
    platform: Platform,
    spec: Arc<OnceLock<ProcessSpec>>,
}

impl Program {
    /// Create a program
    pub fn new(
        context: ExecutionContext,
        config: ProgramConfig,
        install_root: impl Into<PathBuf>,
        platform: Platform,
    ) -> Self {
        Self {
            context,
            config: Arc::new(config),
            install_root: install_root.into(),
            platform,
            spec: Arc::new(OnceLock::new()),
        }
    }

    /// Shorthand building the context from its parts
    pub fn from_parts(
        binary_name: &str,
        version: &str,
        tags: Tags,
        config: ProgramConfig,
        install_root: impl Into<PathBuf>,
        platform: Platform,
    ) -> Self {
        Self::new(
            ExecutionContext::new(binary_name, version, tags),
            config,
            install_root,
            platform,
        )
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn id(&self) -> &str {
        &self.context.id
    }

    pub fn binary_name(&self) -> &str {
        &self.context.binary_name
    }

    pub fn version(&self) -> &str {
        &self.context.version
    }

    pub fn tags(&self) -> &Tags {
        &self.context.tags
    }

    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Same program with a different configuration blob
    pub fn with_config(&self, config: ProgramConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..self.clone()
        }
    }

    /// Install directory.
    ///
    /// Unversioned programs resolve to `install_root/<binary>`.
    pub fn directory(&self) -> PathBuf {
        if self.context.version.is_empty() {
            return self.install_root.join(&self.context.binary_name);
        }
        self.install_root.join(
            self.platform
                .artifact_name(&self.context.binary_name, &self.context.version),
        )
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Resolved process spec (computed once, then cached)
    pub fn spec(&self) -> Result<&ProcessSpec> {
        if let Some(spec) = self.spec.get() {
            return Ok(spec);
        }

        let spec = ProcessSpec::resolve(&self.directory(), &self.context.binary_name)
            .with_context(|| format!("Failed to resolve process spec for {}", self.context))?;

        // A concurrent resolver may have won the race; both results are equal.
        let _ = self.spec.set(spec);
        self.spec
            .get()
            .ok_or_else(|| anyhow::anyhow!("Process spec for {} was not cached", self.context))
    }

    /// Configuration mode from the resolved spec
    pub fn configurable(&self) -> Result<Configurable> {
        Ok(self.spec()?.configurable)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("id", &self.context.id)
            .field("install_root", &self.install_root)
            .finish()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.context, f)
    }
}
