//! Input and output validation.
//!
//! Validation collects every issue before failing, so a run surfaces the
//! whole list of problems at once instead of one per invocation.

use firework_spec::NodeDescriptor;
use thiserror::Error;

use crate::input::InputConfig;

/// Aggregated validation failure.
#[derive(Debug, Error)]
#[error("validation failed with {} error(s):\n  - {}", .errors.len(), .errors.join("\n  - "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

impl ValidationError {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// A non-fatal issue found during validation.
#[derive(Debug, Clone)]
pub struct Warning {
    pub message: String,
}

/// Check the raw user input for errors.
pub fn validate_input(input: &InputConfig) -> Result<(), ValidationError> {
    let mut ve = ValidationError::new();
    let mut seen = std::collections::HashSet::new();

    for svc in &input.services {
        if svc.name.is_empty() {
            ve.add("service with empty name");
            continue;
        }
        if !seen.insert(svc.name.as_str()) {
            ve.add(format!("duplicate service name: {}", svc.name));
        }

        if svc.image.is_empty() {
            ve.add(format!("service {}: missing image", svc.name));
        }
        if svc.node_type.is_empty() {
            ve.add(format!("service {}: missing node_type", svc.name));
        }

        if let Some(hc) = &svc.health_check {
            if hc.kind != "http" && hc.kind != "tcp" {
                ve.add(format!(
                    "service {}: invalid health check type {:?} (must be http or tcp)",
                    svc.name, hc.kind
                ));
            }
        }
    }

    ve.into_result()
}

/// Check a fully enriched node descriptor for correctness.
pub fn validate_output(nd: &NodeDescriptor) -> Result<(), ValidationError> {
    let mut ve = ValidationError::new();
    let mut seen = std::collections::HashSet::new();

    if nd.node.is_empty() {
        ve.add("node descriptor: empty node name");
    }

    for svc in &nd.services {
        if svc.name.is_empty() {
            ve.add("service with empty name");
            continue;
        }
        if !seen.insert(svc.name.as_str()) {
            ve.add(format!("duplicate service name in output: {}", svc.name));
        }

        if svc.image.is_empty() {
            ve.add(format!("service {}: missing image", svc.name));
        }
        if svc.kernel.is_empty() {
            ve.add(format!("service {}: missing kernel", svc.name));
        }
        if svc.vcpus == 0 {
            ve.add(format!("service {}: zero vcpus", svc.name));
        }
        if svc.memory_mb == 0 {
            ve.add(format!("service {}: zero memory", svc.name));
        }
    }

    ve.into_result()
}

/// Find non-fatal issues in the input.
pub fn check_warnings(input: &InputConfig) -> Vec<Warning> {
    let mut warnings = Vec::new();

    for svc in &input.services {
        if svc.health_check.is_some() && !svc.network {
            warnings.push(Warning {
                message: format!(
                    "service {} has health check but network is disabled",
                    svc.name
                ),
            });
        }
    }

    warnings
}
