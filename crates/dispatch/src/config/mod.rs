//! `taskline.toml`: parsing, environment overrides and validation.

mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use types::{ClientConfig, MediatorConfig, RunnerConfig, TasklineConfig, TlsSettings};
