use super::types::TasklineConfig;
use crate::error::DispatchError;

impl TasklineConfig {
    /// Validate the config: link limits, capacities and the TLS policy.
    pub fn validate(&self) -> Result<(), DispatchError> {
        self.link.validate().map_err(DispatchError::Config)?;
        self.validate_tls()?;
        self.validate_runner()?;
        self.validate_client()?;
        Ok(())
    }

    /// The policy must name a known mode and carry what that mode needs.
    fn validate_tls(&self) -> Result<(), DispatchError> {
        if self.tls.validation == "skip" && !cfg!(feature = "dangerous-skip-verify") {
            return Err(DispatchError::Config(
                "tls.validation = \"skip\" requires the dangerous-skip-verify feature".into(),
            ));
        }
        self.client_validation()?;
        if self.tls.cert.is_some() != self.tls.key.is_some() {
            return Err(DispatchError::Config(
                "tls.cert and tls.key must be set together".into(),
            ));
        }
        Ok(())
    }

    fn validate_runner(&self) -> Result<(), DispatchError> {
        if self.runner.max_tasks == 0 {
            return Err(DispatchError::Config(
                "runner.max_tasks must be greater than zero".into(),
            ));
        }
        if self.runner.listen.trim().is_empty() {
            return Err(DispatchError::Config("runner.listen must not be empty".into()));
        }
        Ok(())
    }

    fn validate_client(&self) -> Result<(), DispatchError> {
        if self.client.max_attempts == 0 {
            return Err(DispatchError::Config(
                "client.max_attempts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
