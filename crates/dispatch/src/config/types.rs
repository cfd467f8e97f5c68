use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use taskline_link::LinkConfig;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for mediator, runner and application processes.
///
/// Parsed from `taskline.toml` with support for environment variable
/// overrides. Every section is optional; a process reads the ones it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasklineConfig {
    /// Connection tuning shared by every role.
    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub tls: TlsSettings,

    #[serde(default)]
    pub mediator: MediatorConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// How servers present themselves and clients verify them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM certificate chain presented by listening processes.
    pub cert: Option<PathBuf>,

    /// PEM private key matching `cert`.
    pub key: Option<PathBuf>,

    /// Client policy: `root_ca`, `thumbprint` or `skip`.
    #[serde(default = "default_validation")]
    pub validation: String,

    /// SHA-256 fingerprint of the server certificate for `thumbprint`.
    pub thumbprint: Option<String>,

    /// Extra PEM roots trusted under `root_ca`.
    #[serde(default)]
    pub extra_roots: Vec<PathBuf>,

    /// Name to verify instead of the endpoint's host.
    pub server_name: Option<String>,
}

fn default_validation() -> String {
    "root_ca".into()
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert: None,
            key: None,
            validation: default_validation(),
            thumbprint: None,
            extra_roots: Vec::new(),
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// Address the mediator listens on.
    #[serde(default = "default_mediator_listen")]
    pub listen: String,

    /// Seconds between pool summaries in the log; 0 disables them.
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_mediator_listen() -> String {
    "0.0.0.0:7400".into()
}

fn default_report_interval() -> u64 {
    60
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            listen: default_mediator_listen(),
            report_interval_secs: default_report_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Address the runner listens on.
    #[serde(default = "default_runner_listen")]
    pub listen: String,

    /// Address announced to the mediator; defaults to `listen`.
    pub endpoint: Option<String>,

    /// Mediator to register with; standalone when unset.
    pub mediator: Option<String>,

    #[serde(default = "default_max_tasks")]
    pub max_tasks: u32,

    /// Negative means unlimited.
    #[serde(default = "default_max_queue")]
    pub max_queue: i32,

    pub label: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Default task timeout; 0 means none.
    #[serde(default)]
    pub task_timeout_ms: u64,

    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_runner_listen() -> String {
    "0.0.0.0:7401".into()
}

fn default_max_tasks() -> u32 {
    4
}

fn default_max_queue() -> i32 {
    16
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            listen: default_runner_listen(),
            endpoint: None,
            mediator: None,
            max_tasks: default_max_tasks(),
            max_queue: default_max_queue(),
            label: None,
            tags: Vec::new(),
            task_timeout_ms: 0,
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Application-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_mediator")]
    pub mediator: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_client_mediator() -> String {
    "127.0.0.1:7400".into()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mediator: default_client_mediator(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}
