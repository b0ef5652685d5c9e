//! Process spec: how to launch an installed binary and how it takes config.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Binaries that ship an embedded worker and read a config file
const FILE_CONFIGURED_BINARIES: &[&str] = &["filebeat", "metricbeat"];

/// How a running child receives its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Configurable {
    /// Not configurable at runtime
    None,

    /// Config file rewritten, then the process is restarted
    File,

    /// Config pushed over the remote channel
    Grpc,
}

impl Default for Configurable {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for Configurable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Configurable::None => write!(f, "none"),
            Configurable::File => write!(f, "file"),
            Configurable::Grpc => write!(f, "grpc"),
        }
    }
}

/// Launch description of an installed binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Path to the executable (absolute after resolution; defaults to the
    /// binary name)
    #[serde(default)]
    pub binary_path: PathBuf,

    /// Ordered command line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Configuration mode
    #[serde(default)]
    pub configurable: Configurable,
}

impl ProcessSpec {
    /// Path of the spec file colocated with an installed binary
    pub fn file_path(install_dir: &Path, binary_name: &str) -> PathBuf {
        install_dir.join(format!("{}.spec.json", binary_name))
    }

    /// Resolve the spec for a binary installed in `install_dir`.
    ///
    /// Reads `<binary>.spec.json` when present, otherwise falls back to the
    /// default for the binary name.
    pub fn resolve(install_dir: &Path, binary_name: &str) -> Result<Self> {
        let spec_path = Self::file_path(install_dir, binary_name);

        let mut spec = if spec_path.exists() {
            let content = std::fs::read_to_string(&spec_path)
                .with_context(|| format!("Failed to read spec file: {}", spec_path.display()))?;
            serde_json::from_str::<ProcessSpec>(&content)
                .with_context(|| format!("Failed to parse spec file: {}", spec_path.display()))?
        } else {
            Self::default_for(binary_name, install_dir)
        };

        if spec.binary_path.as_os_str().is_empty() {
            spec.binary_path = PathBuf::from(binary_name);
        }
        if spec.binary_path.is_relative() {
            spec.binary_path = install_dir.join(&spec.binary_path);
        }

        Ok(spec)
    }

    /// Default spec when no spec file ships with the binary
    pub fn default_for(binary_name: &str, install_dir: &Path) -> Self {
        let binary_path = install_dir.join(binary_name);

        if FILE_CONFIGURED_BINARIES.contains(&binary_name) {
            return Self {
                binary_path,
                args: vec!["-e".to_string()],
                configurable: Configurable::File,
            };
        }

        Self {
            binary_path,
            args: Vec::new(),
            configurable: Configurable::None,
        }
    }
}

/// Replace any `-c <path>` in `args` with one pointing at `config_path`
pub fn with_config_arg(args: &[String], config_path: &Path) -> Vec<String> {
    let mut rewritten = Vec::with_capacity(args.len() + 2);
    let mut skip_next = false;

    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "-c" {
            skip_next = true;
            continue;
        }
        rewritten.push(arg.clone());
    }

    rewritten.push("-c".to_string());
    rewritten.push(config_path.display().to_string());
    rewritten
}
