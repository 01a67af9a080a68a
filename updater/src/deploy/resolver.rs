//! Delivery target resolution and fallback

use tracing::{debug, info, warn};

use crate::deploy::toolchain::{upload_succeeded, Artifact, Toolchain};
use crate::errors::{FailureClass, ToolError};
use crate::models::device::DeviceRecord;

/// How a target address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Declared in the device configuration
    Static,

    /// Derived from the node name for name-service discovery
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub kind: TargetKind,
    pub address: String,
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Delivered,
    Rejected { exit_code: i32 },
    TimedOut,
    Cancelled,
    ToolFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub target: DeliveryTarget,
    pub result: AttemptResult,
}

/// Every attempt made for one device, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: Vec<DeliveryAttempt>,
}

impl DeliveryReport {
    pub fn delivered_to(&self) -> Option<&DeliveryTarget> {
        self.attempts
            .iter()
            .find(|a| a.result == AttemptResult::Delivered)
            .map(|a| &a.target)
    }

    /// Failure class when no target accepted the firmware
    pub fn failure(&self) -> Option<FailureClass> {
        if self.delivered_to().is_some() {
            return None;
        }
        if self.attempts.iter().any(|a| a.result == AttemptResult::Cancelled) {
            return Some(FailureClass::Interrupted);
        }
        match self.attempts.as_slice() {
            [] => Some(FailureClass::DeliveryExhausted),
            [only] => Some(match only.result {
                AttemptResult::TimedOut => FailureClass::UploadTimeout,
                AttemptResult::ToolFailed(_) => FailureClass::ToolError,
                _ => FailureClass::UploadFailed,
            }),
            _ => Some(FailureClass::DeliveryExhausted),
        }
    }
}

/// Ordered delivery targets for a device: static address first, then the
/// discovery name unless it is the same host.
pub fn targets(device: &DeviceRecord, mdns_domain: &str) -> Vec<DeliveryTarget> {
    let mut targets = Vec::new();

    if let Some(address) = device.declared_address.as_deref().filter(|a| !a.is_empty()) {
        targets.push(DeliveryTarget {
            kind: TargetKind::Static,
            address: address.to_string(),
        });
    }

    if !device.node_name.is_empty() {
        let domain = mdns_domain.trim_matches('.');
        let discovered = if domain.is_empty() {
            device.node_name.clone()
        } else {
            format!("{}.{}", device.node_name, domain)
        };
        let duplicate = targets
            .iter()
            .any(|t| t.address.eq_ignore_ascii_case(&discovered));
        if !duplicate {
            targets.push(DeliveryTarget {
                kind: TargetKind::Discovered,
                address: discovered,
            });
        }
    }

    targets
}

/// Tries each target in order until one accepts the firmware
pub struct DeliveryResolver {
    mdns_domain: String,
}

impl DeliveryResolver {
    pub fn new(mdns_domain: impl Into<String>) -> Self {
        Self {
            mdns_domain: mdns_domain.into(),
        }
    }

    pub fn targets(&self, device: &DeviceRecord) -> Vec<DeliveryTarget> {
        targets(device, &self.mdns_domain)
    }

    pub async fn deliver(&self, toolchain: &Toolchain, device: &DeviceRecord, artifact: &Artifact) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let targets = self.targets(device);
        let total = targets.len();

        for (index, target) in targets.into_iter().enumerate() {
            info!("{}: uploading to {} ({}/{})", device.id, target.address, index + 1, total);

            let result = match toolchain.upload(&device.config_file, artifact, &target.address).await {
                Ok(output) if upload_succeeded(&output) => AttemptResult::Delivered,
                Ok(output) => {
                    warn!(
                        "{}: upload to {} failed with exit code {}",
                        device.id, target.address, output.exit_code
                    );
                    for line in output.tail(40) {
                        debug!("  {}", line);
                    }
                    AttemptResult::Rejected {
                        exit_code: output.exit_code,
                    }
                }
                Err(ToolError::Cancelled { .. }) => AttemptResult::Cancelled,
                Err(e) if e.is_timeout() => {
                    warn!("{}: upload to {} timed out", device.id, target.address);
                    AttemptResult::TimedOut
                }
                Err(e) => {
                    warn!("{}: upload to {} could not run: {}", device.id, target.address, e);
                    AttemptResult::ToolFailed(e.to_string())
                }
            };

            let stop = matches!(result, AttemptResult::Delivered | AttemptResult::Cancelled);
            report.attempts.push(DeliveryAttempt { target, result });
            if stop {
                break;
            }
        }

        if let Some(target) = report.delivered_to() {
            info!("{}: delivered via {}", device.id, target.address);
        }
        report
    }
}
