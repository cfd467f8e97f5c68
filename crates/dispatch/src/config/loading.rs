use std::path::Path;
use std::time::Duration;

use taskline_link::{ClientValidation, TlsServerIdentity};

use crate::client::RetryPolicy;
use crate::error::DispatchError;
use crate::runner::RunnerSettings;

use super::types::TasklineConfig;

impl TasklineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, DispatchError> {
        Self::from_toml_with(toml_str, |key| std::env::var(key).ok())
    }

    /// Parse config, taking overrides from `lookup` instead of the process
    /// environment.
    pub fn from_toml_with<F>(toml_str: &str, lookup: F) -> Result<Self, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `TASKLINE_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `TASKLINE_MEDIATOR_LISTEN` -> `mediator.listen`
    /// - `TASKLINE_RUNNER_MAX_TASKS` -> `runner.max_tasks`
    /// - `TASKLINE_TLS_THUMBPRINT` -> `tls.thumbprint`
    /// - `TASKLINE_LINK_HEARTBEAT_MS` -> `link.heartbeat_ms`
    pub fn apply_env_overrides(&mut self) -> Result<(), DispatchError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key);
        let number = |key: &str| -> Result<Option<i64>, DispatchError> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| DispatchError::Config(format!("{key} must be a number, got '{v}'"))),
                None => Ok(None),
            }
        };

        if let Some(v) = number("TASKLINE_LINK_HEARTBEAT_MS")? {
            self.link.heartbeat_ms = non_negative(v, "TASKLINE_LINK_HEARTBEAT_MS")?;
        }
        if let Some(v) = number("TASKLINE_LINK_READ_TIMEOUT_MS")? {
            self.link.read_timeout_ms = non_negative(v, "TASKLINE_LINK_READ_TIMEOUT_MS")?;
        }
        if let Some(v) = number("TASKLINE_LINK_MAX_FRAME_SIZE")? {
            self.link.max_frame_size = non_negative(v, "TASKLINE_LINK_MAX_FRAME_SIZE")? as usize;
        }

        if let Some(v) = text("TASKLINE_TLS_CERT") {
            self.tls.cert = Some(v.into());
        }
        if let Some(v) = text("TASKLINE_TLS_KEY") {
            self.tls.key = Some(v.into());
        }
        if let Some(v) = text("TASKLINE_TLS_VALIDATION") {
            self.tls.validation = v;
        }
        if let Some(v) = text("TASKLINE_TLS_THUMBPRINT") {
            self.tls.thumbprint = Some(v);
        }
        if let Some(v) = text("TASKLINE_TLS_SERVER_NAME") {
            self.tls.server_name = Some(v);
        }

        if let Some(v) = text("TASKLINE_MEDIATOR_LISTEN") {
            self.mediator.listen = v;
        }
        if let Some(v) = number("TASKLINE_MEDIATOR_REPORT_INTERVAL_SECS")? {
            self.mediator.report_interval_secs = non_negative(v, "TASKLINE_MEDIATOR_REPORT_INTERVAL_SECS")?;
        }

        if let Some(v) = text("TASKLINE_RUNNER_LISTEN") {
            self.runner.listen = v;
        }
        if let Some(v) = text("TASKLINE_RUNNER_ENDPOINT") {
            self.runner.endpoint = Some(v);
        }
        if let Some(v) = text("TASKLINE_RUNNER_MEDIATOR") {
            self.runner.mediator = Some(v);
        }
        if let Some(v) = number("TASKLINE_RUNNER_MAX_TASKS")? {
            self.runner.max_tasks = u32::try_from(v)
                .map_err(|_| DispatchError::Config(format!("TASKLINE_RUNNER_MAX_TASKS out of range: {v}")))?;
        }
        if let Some(v) = number("TASKLINE_RUNNER_MAX_QUEUE")? {
            self.runner.max_queue = i32::try_from(v)
                .map_err(|_| DispatchError::Config(format!("TASKLINE_RUNNER_MAX_QUEUE out of range: {v}")))?;
        }
        if let Some(v) = text("TASKLINE_RUNNER_LABEL") {
            self.runner.label = Some(v);
        }
        if let Some(v) = text("TASKLINE_RUNNER_TAGS") {
            self.runner.tags = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = text("TASKLINE_CLIENT_MEDIATOR") {
            self.client.mediator = v;
        }
        if let Some(v) = number("TASKLINE_CLIENT_MAX_ATTEMPTS")? {
            self.client.max_attempts = u32::try_from(v)
                .map_err(|_| DispatchError::Config(format!("TASKLINE_CLIENT_MAX_ATTEMPTS out of range: {v}")))?;
        }
        Ok(())
    }

    // ── Conversions ─────────────────────────────────────────────────

    /// Client-side certificate policy from `[tls]`.
    pub fn client_validation(&self) -> Result<ClientValidation, DispatchError> {
        match self.tls.validation.as_str() {
            "root_ca" => Ok(ClientValidation::RootCa {
                extra_roots: self.tls.extra_roots.clone(),
            }),
            "thumbprint" => {
                let raw = self.tls.thumbprint.as_deref().ok_or_else(|| {
                    DispatchError::Config("tls.validation = \"thumbprint\" needs tls.thumbprint".into())
                })?;
                Ok(ClientValidation::Thumbprint(raw.parse()?))
            }
            #[cfg(feature = "dangerous-skip-verify")]
            "skip" => Ok(ClientValidation::Skip),
            other => Err(DispatchError::Config(format!(
                "unsupported tls.validation '{other}'"
            ))),
        }
    }

    /// Server identity from `tls.cert` and `tls.key`.
    pub fn server_identity(&self) -> Result<TlsServerIdentity, DispatchError> {
        match (&self.tls.cert, &self.tls.key) {
            (Some(cert), Some(key)) => Ok(TlsServerIdentity::from_pem_files(cert, key)?),
            _ => Err(DispatchError::Config(
                "listening needs both tls.cert and tls.key".into(),
            )),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        let runner = &self.runner;
        let mut settings = RunnerSettings::new(
            runner.endpoint.clone().unwrap_or_else(|| runner.listen.clone()),
        )
        .with_capacity(runner.max_tasks, runner.max_queue)
        .with_cancel_grace(Duration::from_millis(runner.cancel_grace_ms));
        settings.label = runner.label.clone();
        settings.tags = runner.tags.clone();
        if runner.task_timeout_ms > 0 {
            settings = settings.with_task_timeout(Duration::from_millis(runner.task_timeout_ms));
        }
        settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.client.max_attempts,
            backoff: Duration::from_millis(self.client.backoff_ms),
        }
    }
}

fn non_negative(v: i64, key: &str) -> Result<u64, DispatchError> {
    u64::try_from(v).map_err(|_| DispatchError::Config(format!("{key} must not be negative, got {v}")))
}
