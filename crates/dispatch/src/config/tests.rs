use std::collections::HashMap;
use std::time::Duration;

use taskline_link::ClientValidation;

use super::types::TasklineConfig;
use crate::error::DispatchError;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

fn no_env() -> impl Fn(&str) -> Option<String> {
    env(&[])
}

#[test]
fn empty_toml_uses_defaults() {
    let cfg = TasklineConfig::from_toml_with("", no_env()).unwrap();
    assert_eq!(cfg, TasklineConfig::default());
    assert_eq!(cfg.link.heartbeat_ms, 60_000);
    assert_eq!(cfg.mediator.listen, "0.0.0.0:7400");
    assert_eq!(cfg.runner.max_tasks, 4);
    assert_eq!(cfg.client.max_attempts, 3);
    assert!(matches!(cfg.client_validation().unwrap(), ClientValidation::RootCa { .. }));
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[link]
heartbeat_ms = 5000
read_timeout_ms = 250

[tls]
cert = "/etc/taskline/server.pem"
key = "/etc/taskline/server.key"
validation = "thumbprint"
thumbprint = "AB:CD:EF:01:23:45:67:89:ab:cd:ef:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:ab:cd:ef:01:23:45:67:89"

[mediator]
listen = "10.0.0.1:7400"
report_interval_secs = 0

[runner]
listen = "0.0.0.0:7401"
endpoint = "runner-7.internal:7401"
mediator = "10.0.0.1:7400"
max_tasks = 8
max_queue = -1
label = "gpu"
tags = ["cuda", "large"]
task_timeout_ms = 30000

[client]
mediator = "10.0.0.1:7400"
max_attempts = 5
backoff_ms = 100
"#;
    let cfg = TasklineConfig::from_toml_with(toml, no_env()).unwrap();
    assert_eq!(cfg.link.heartbeat(), Duration::from_secs(5));
    assert_eq!(cfg.mediator.report_interval_secs, 0);
    assert_eq!(cfg.runner.tags, vec!["cuda", "large"]);
    assert!(matches!(cfg.client_validation().unwrap(), ClientValidation::Thumbprint(_)));

    let settings = cfg.runner_settings();
    assert_eq!(settings.endpoint, "runner-7.internal:7401");
    assert_eq!(settings.max_tasks, 8);
    assert_eq!(settings.max_queue, -1);
    assert_eq!(settings.label.as_deref(), Some("gpu"));
    assert_eq!(settings.task_timeout_default, Some(Duration::from_secs(30)));
    assert_eq!(settings.cancel_grace, Duration::from_secs(5));

    let retry = cfg.retry_policy();
    assert_eq!(retry.max_attempts, 5);
    assert_eq!(retry.backoff, Duration::from_millis(100));
}

#[test]
fn runner_endpoint_defaults_to_listen_address() {
    let cfg = TasklineConfig::from_toml_with("[runner]\nlisten = \"127.0.0.1:9000\"\n", no_env()).unwrap();
    let settings = cfg.runner_settings();
    assert_eq!(settings.endpoint, "127.0.0.1:9000");
    assert_eq!(settings.task_timeout_default, None);
}

#[test]
fn env_overrides_win_over_the_file() {
    let lookup = env(&[
        ("TASKLINE_MEDIATOR_LISTEN", "0.0.0.0:9999"),
        ("TASKLINE_RUNNER_MAX_TASKS", "2"),
        ("TASKLINE_RUNNER_MAX_QUEUE", "-1"),
        ("TASKLINE_RUNNER_TAGS", "a, b,,c"),
        ("TASKLINE_LINK_HEARTBEAT_MS", "1500"),
    ]);
    let toml = r#"
[mediator]
listen = "0.0.0.0:7400"

[runner]
max_tasks = 16
"#;
    let cfg = TasklineConfig::from_toml_with(toml, lookup).unwrap();
    assert_eq!(cfg.mediator.listen, "0.0.0.0:9999");
    assert_eq!(cfg.runner.max_tasks, 2);
    assert_eq!(cfg.runner.max_queue, -1);
    assert_eq!(cfg.runner.tags, vec!["a", "b", "c"]);
    assert_eq!(cfg.link.heartbeat_ms, 1500);
}

#[test]
fn malformed_numeric_override_is_an_error() {
    let err = TasklineConfig::from_toml_with("", env(&[("TASKLINE_RUNNER_MAX_TASKS", "many")])).unwrap_err();
    assert!(err.to_string().contains("TASKLINE_RUNNER_MAX_TASKS"), "got: {err}");

    let err = TasklineConfig::from_toml_with("", env(&[("TASKLINE_LINK_HEARTBEAT_MS", "-5")])).unwrap_err();
    assert!(err.to_string().contains("negative"), "got: {err}");
}

#[test]
fn zero_max_tasks_is_rejected() {
    let err = TasklineConfig::from_toml_with("[runner]\nmax_tasks = 0\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("max_tasks"));
}

#[test]
fn zero_heartbeat_is_rejected() {
    let err = TasklineConfig::from_toml_with("[link]\nheartbeat_ms = 0\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("heartbeat"));
}

#[test]
fn oversized_frame_is_rejected() {
    let err = TasklineConfig::from_toml_with("[link]\nmax_frame_size = 4294967296\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("max_frame_size"));
}

#[test]
fn thumbprint_policy_needs_a_thumbprint() {
    let err = TasklineConfig::from_toml_with("[tls]\nvalidation = \"thumbprint\"\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("tls.thumbprint"));

    let err = TasklineConfig::from_toml_with(
        "[tls]\nvalidation = \"thumbprint\"\nthumbprint = \"abc\"\n",
        no_env(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("64 hex digits"), "got: {err}");
}

#[test]
fn unknown_policy_is_rejected() {
    let err = TasklineConfig::from_toml_with("[tls]\nvalidation = \"trust-me\"\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("trust-me"));
}

#[cfg(not(feature = "dangerous-skip-verify"))]
#[test]
fn skip_policy_needs_the_feature() {
    let err = TasklineConfig::from_toml_with("[tls]\nvalidation = \"skip\"\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("dangerous-skip-verify"));
}

#[cfg(feature = "dangerous-skip-verify")]
#[test]
fn skip_policy_with_the_feature() {
    let cfg = TasklineConfig::from_toml_with("[tls]\nvalidation = \"skip\"\n", no_env()).unwrap();
    assert!(matches!(cfg.client_validation().unwrap(), ClientValidation::Skip));
}

#[test]
fn cert_without_key_is_rejected() {
    let err = TasklineConfig::from_toml_with("[tls]\ncert = \"/tmp/a.pem\"\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("together"));
    let cfg = TasklineConfig::from_toml_with("", no_env()).unwrap();
    assert!(matches!(cfg.server_identity(), Err(DispatchError::Config(_))));
}

#[test]
fn zero_attempts_is_rejected() {
    let err = TasklineConfig::from_toml_with("[client]\nmax_attempts = 0\n", no_env()).unwrap_err();
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn from_file_reports_missing_files() {
    let err = TasklineConfig::from_file("/nonexistent/taskline.toml").unwrap_err();
    assert!(matches!(err, DispatchError::ConfigIo(_)));
}
