//! Progress for operations that finish before the call returns.

use super::Progress;
use hvctl_shared::{HvctlError, HvctlResult};
use std::time::Duration;

/// A progress whose outcome is already known.
#[derive(Debug)]
pub struct CompletedProgress {
    description: String,
    outcome: Option<String>,
}

impl CompletedProgress {
    pub fn succeeded(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            outcome: None,
        }
    }

    /// A completed operation that reported `message` as its error.
    pub fn failed(description: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            outcome: Some(message.into()),
        }
    }
}

impl Progress for CompletedProgress {
    fn description(&self) -> &str {
        &self.description
    }

    fn wait_for_completion(&mut self, _timeout: Option<Duration>) -> HvctlResult<()> {
        match &self.outcome {
            None => Ok(()),
            Some(message) => Err(HvctlError::Hypervisor(format!(
                "{}: {}",
                self.description, message
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_progress_reports_hypervisor_fault() {
        let mut progress = CompletedProgress::failed("launch t1", "no bootable medium");
        let err = progress.wait_for_completion(None).unwrap_err();
        assert!(err.is_hypervisor_fault());
        assert!(err.to_string().contains("no bootable medium"));
    }

    #[test]
    fn test_succeeded_progress_is_repeatable() {
        let mut progress = CompletedProgress::succeeded("power down t1");
        assert!(progress.wait_for_completion(None).is_ok());
        assert!(progress.wait_for_completion(Some(Duration::from_secs(1))).is_ok());
        assert_eq!(progress.description(), "power down t1");
    }
}
