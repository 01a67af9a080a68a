//! Filter engine: turns the inventory into the ordered work set of a run.

use glob::Pattern;
use tracing::{debug, info, warn};

use crate::errors::UpdaterError;
use crate::journal::ProgressJournal;
use crate::models::device::{DeviceRecord, UpdateTask};
use crate::models::mode::{OperatingMode, VersionPolicy};

/// Compiled device-name patterns (`*`, `?`, `[..]`; plain names match exactly)
#[derive(Debug, Clone, Default)]
pub struct NamePatterns {
    patterns: Vec<Pattern>,
}

impl NamePatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, UpdaterError> {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .map(|p| {
                Pattern::new(p).map_err(|e| UpdaterError::ConfigError(format!("Invalid device name pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Inputs of the filter besides the inventory and the journal
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub mode: OperatingMode,
    pub include: NamePatterns,
    pub exclude: NamePatterns,
    pub versions: VersionPolicy,
    pub dry_run: bool,

    /// Begin the work set at this device id
    pub start_from_device: Option<String>,

    /// Truncate the work set to this many devices (0 = unlimited)
    pub max_devices: usize,
}

/// Why a device is not in the work set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipKind {
    /// Excluded by name policy; journaled as `skipped`
    Policy,
    /// Already done in the journal
    AlreadyDone,
    /// The mode's eligibility predicate declined it
    NotNeeded,
    /// Before `start_from_device` or beyond `max_devices`
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDevice {
    pub id: String,
    pub kind: SkipKind,
    pub reason: String,
}

/// Ordered work set plus the devices left out
#[derive(Debug, Clone, Default)]
pub struct WorkSet {
    pub tasks: Vec<UpdateTask>,
    pub skipped: Vec<SkippedDevice>,
    pub dry_run: bool,
}

impl WorkSet {
    pub fn ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.device.id.as_str()).collect()
    }

    /// Devices excluded by name policy
    pub fn policy_skips(&self) -> impl Iterator<Item = &SkippedDevice> {
        self.skipped.iter().filter(|s| s.kind == SkipKind::Policy)
    }
}

/// Select the work set, preserving inventory order
pub fn select(devices: Vec<DeviceRecord>, options: &FilterOptions, journal: &ProgressJournal) -> WorkSet {
    let mut work_set = WorkSet {
        dry_run: options.dry_run,
        ..WorkSet::default()
    };
    let policy = options.mode.policy();

    let devices = apply_start_from(devices, options.start_from_device.as_deref(), &mut work_set);

    for device in devices {
        let id = device.id.clone();

        if options.exclude.matches(&id) {
            skip(&mut work_set, id, SkipKind::Policy, "matches a skip pattern".to_string());
            continue;
        }
        if !options.include.is_empty() && !options.include.matches(&id) {
            skip(&mut work_set, id, SkipKind::Policy, "not matched by any device pattern".to_string());
            continue;
        }
        if journal.done.contains(&id) {
            skip(&mut work_set, id, SkipKind::AlreadyDone, "already updated (journal)".to_string());
            continue;
        }

        let eligibility = policy.eligibility(&device, &options.versions);
        if !eligibility.is_eligible() {
            skip(&mut work_set, id, SkipKind::NotNeeded, eligibility.reason().to_string());
            continue;
        }

        debug!("{}: selected ({})", id, eligibility.reason());
        work_set.tasks.push(UpdateTask {
            device,
            mode: options.mode,
            dry_run: options.dry_run,
        });
    }

    if options.max_devices > 0 && work_set.tasks.len() > options.max_devices {
        info!("Limiting to {} device(s) per run", options.max_devices);
        for task in work_set.tasks.split_off(options.max_devices) {
            work_set.skipped.push(SkippedDevice {
                id: task.device.id,
                kind: SkipKind::OutOfRange,
                reason: "beyond max_devices_per_run".to_string(),
            });
        }
    }

    work_set
}

fn apply_start_from(devices: Vec<DeviceRecord>, start_from: Option<&str>, work_set: &mut WorkSet) -> Vec<DeviceRecord> {
    let Some(start) = start_from.filter(|s| !s.is_empty()) else {
        return devices;
    };
    let Some(position) = devices.iter().position(|d| d.id == start) else {
        warn!("start_from_device '{}' not found; processing all devices", start);
        return devices;
    };

    info!("Starting from device: {}", start);
    let mut devices = devices;
    let rest = devices.split_off(position);
    for device in devices {
        work_set.skipped.push(SkippedDevice {
            id: device.id,
            kind: SkipKind::OutOfRange,
            reason: format!("before start_from_device '{}'", start),
        });
    }
    rest
}

fn skip(work_set: &mut WorkSet, id: String, kind: SkipKind, reason: String) {
    debug!("{}: skipped ({})", id, reason);
    work_set.skipped.push(SkippedDevice { id, kind, reason });
}
