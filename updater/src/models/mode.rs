//! Operating modes
//!
//! Each mode is a policy object answering two questions: which phases run
//! for a selected device, and whether a device is eligible at all. The rest
//! of the pipeline asks the policy instead of branching on the mode.

use serde::{Deserialize, Serialize};

use crate::models::device::{DeployedVersion, DeviceRecord};

/// Run-wide operating mode, fixed once the run starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Normal,
    Repair,
    UploadOnly,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Normal => "normal",
            OperatingMode::Repair => "repair",
            OperatingMode::UploadOnly => "upload_only",
        }
    }

    /// The policy implementing this mode
    pub fn policy(&self) -> &'static dyn ModePolicy {
        match self {
            OperatingMode::Normal => &NormalMode,
            OperatingMode::Repair => &RepairMode,
            OperatingMode::UploadOnly => &UploadOnlyMode,
        }
    }

    pub fn phases(&self) -> Phases {
        self.policy().phases()
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "normal" => Ok(OperatingMode::Normal),
            "repair" => Ok(OperatingMode::Repair),
            "upload_only" => Ok(OperatingMode::UploadOnly),
            _ => Err(format!("Invalid mode: {}", s)),
        }
    }
}

/// Phases a selected device goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub compile: bool,
    pub upload: bool,
}

/// Version-related switches consulted by the eligibility predicate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionPolicy {
    /// Include devices whose deployed version is absent
    pub update_when_no_deployed_version: bool,

    /// Include devices even when deployed and current versions match
    pub update_when_version_matches: bool,
}

/// Outcome of the per-mode eligibility predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible(String),
    NotNeeded(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Eligibility::Eligible(r) | Eligibility::NotNeeded(r) => r,
        }
    }
}

/// Behaviour shared by all operating modes
pub trait ModePolicy: Send + Sync {
    fn phases(&self) -> Phases;

    fn eligibility(&self, device: &DeviceRecord, policy: &VersionPolicy) -> Eligibility;
}

pub struct NormalMode;

pub struct RepairMode;

pub struct UploadOnlyMode;

impl ModePolicy for NormalMode {
    fn phases(&self) -> Phases {
        Phases {
            compile: true,
            upload: true,
        }
    }

    fn eligibility(&self, device: &DeviceRecord, policy: &VersionPolicy) -> Eligibility {
        version_eligibility(device, policy)
    }
}

impl ModePolicy for RepairMode {
    fn phases(&self) -> Phases {
        Phases {
            compile: true,
            upload: false,
        }
    }

    fn eligibility(&self, _device: &DeviceRecord, _policy: &VersionPolicy) -> Eligibility {
        Eligibility::Eligible("repair rebuilds metadata for every device".to_string())
    }
}

impl ModePolicy for UploadOnlyMode {
    fn phases(&self) -> Phases {
        Phases {
            compile: false,
            upload: true,
        }
    }

    fn eligibility(&self, device: &DeviceRecord, policy: &VersionPolicy) -> Eligibility {
        version_eligibility(device, policy)
    }
}

/// Forced updates and absent versions trigger independently of each other.
fn version_eligibility(device: &DeviceRecord, policy: &VersionPolicy) -> Eligibility {
    if policy.update_when_version_matches {
        return Eligibility::Eligible("forced update".to_string());
    }

    match &device.deployed_version {
        DeployedVersion::Absent if policy.update_when_no_deployed_version => {
            Eligibility::Eligible("no deployed version recorded".to_string())
        }
        DeployedVersion::Absent => Eligibility::NotNeeded("no deployed version recorded".to_string()),
        DeployedVersion::Known(_) if !device.current_version_known() => {
            Eligibility::NotNeeded("current version unknown, cannot compare".to_string())
        }
        DeployedVersion::Known(deployed) if device.deployed_version.matches(&device.current_version) => {
            Eligibility::NotNeeded(format!("already up-to-date ({})", deployed))
        }
        DeployedVersion::Known(deployed) => {
            Eligibility::Eligible(format!("deployed={}, current={}", deployed, device.current_version))
        }
    }
}
