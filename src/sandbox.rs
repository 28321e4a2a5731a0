//! Sandbox delegation: configuration and the payload hand-off encoding.
//!
//! When sandboxing is enabled the worker does not execute jobs in-process;
//! it hands the full payload to an external launcher which stands up an
//! isolated context that behaves identically to in-process execution. The
//! payload travels as base64-encoded JSON in the `AGENT_JOB_PAYLOAD`
//! environment variable of the launched process.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::info;

use crate::engine::SandboxLauncher;
use crate::models::JobPayload;

/// Environment variable carrying the encoded payload into a sandboxed
/// process.
pub const PAYLOAD_ENV_VAR: &str = "AGENT_JOB_PAYLOAD";

/// Configuration for sandboxed job execution.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub image: Option<String>,
    pub memory: String,
    pub cpus: f64,
    pub timeout: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: None,
            memory: "4g".to_string(),
            cpus: 2.0,
            timeout: 1800,
        }
    }
}

/// Raw TOML structure for `marshal.toml`
#[derive(Debug, Deserialize)]
struct MarshalToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    enabled: Option<bool>,
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    timeout: Option<u64>,
}

impl SandboxConfig {
    /// Load the `[sandbox]` section from a `marshal.toml` config file.
    /// Returns defaults (sandboxing disabled) if the file doesn't exist.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let toml: MarshalToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.sandbox {
            if let Some(enabled) = section.enabled {
                config.enabled = enabled;
            }
            if let Some(image) = section.image {
                config.image = Some(image);
            }
            if let Some(memory) = section.memory {
                config.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                config.cpus = cpus;
            }
            if let Some(timeout) = section.timeout {
                config.timeout = timeout;
            }
        }

        Ok(config)
    }
}

/// Encode a payload for the environment hand-off.
pub fn encode_payload(payload: &JobPayload) -> Result<String> {
    let json = serde_json::to_vec(payload).context("Failed to serialize job payload")?;
    Ok(BASE64.encode(json))
}

/// Decode a payload received through `AGENT_JOB_PAYLOAD`.
pub fn decode_payload(encoded: &str) -> Result<JobPayload> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("Invalid base64 in encoded job payload")?;
    serde_json::from_slice(&bytes).context("Invalid JSON in encoded job payload")
}

/// Launcher that re-executes the worker binary as an isolated child process
/// with the encoded payload in its environment. The child runs in
/// single-payload mode and owns its own event pipeline handle, so this
/// process never emits on the delegated run.
pub struct ProcessSandboxLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSandboxLauncher {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to resolve current executable")?;
        Ok(Self::new(program, args))
    }
}

#[async_trait]
impl SandboxLauncher for ProcessSandboxLauncher {
    async fn launch(&self, encoded_payload: &str) -> Result<()> {
        info!(program = %self.program.display(), "launching sandboxed agent process");
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env(PAYLOAD_ENV_VAR, encoded_payload)
            .status()
            .await
            .with_context(|| {
                format!("Failed to launch sandbox process {}", self.program.display())
            })?;
        if !status.success() {
            anyhow::bail!("sandbox process exited with {}", status);
        }
        Ok(())
    }
}
