//! # Site Layout
//!
//! The user's physical arrangement of miners: locations hold panels, panels
//! hold numbered slots, and each slot holds the network address of the device
//! racked there (empty when the slot is unused). The layout is where the
//! tracked address list comes from, and it is the grouping used to present
//! snapshots.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::model::DeviceSnapshot;
use crate::telemetry::store::SnapshotMap;
use crate::utils::normalize_address;

/// Errors raised while loading a layout file.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// The file could not be read.
    #[error("Failed to read layout file {path}: {source}")]
    Io {
        /// Layout file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid layout document.
    #[error("Failed to parse layout file {path}: {source}")]
    Parse {
        /// Layout file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Locations, panels and slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteLayout {
    /// Configured locations, in display order.
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// A site or room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Display name.
    pub name: String,
    /// Panels (racks / shelves) at this location.
    #[serde(default)]
    pub panels: Vec<Panel>,
}

/// A rack or shelf with numbered slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    /// Display name.
    pub name: String,
    /// Device address per slot; an empty string marks an unused slot.
    #[serde(default)]
    pub slots: Vec<String>,
}

/// One slot paired with its latest snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView<'a> {
    /// Position inside the panel.
    pub index: usize,
    /// Normalized address configured for the slot.
    pub address: String,
    /// Latest snapshot; `None` until the feed reports the device.
    pub snapshot: Option<&'a DeviceSnapshot>,
}

/// A panel with its slots resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelView<'a> {
    /// Panel name.
    pub name: String,
    /// Resolved slots.
    pub slots: Vec<SlotView<'a>>,
}

/// A location with its panels resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationView<'a> {
    /// Location name.
    pub name: String,
    /// Resolved panels.
    pub panels: Vec<PanelView<'a>>,
}

impl SiteLayout {
    /// Reads a JSON layout document.
    pub fn load(path: &Path) -> Result<Self, LayoutError> {
        let raw = fs::read_to_string(path).map_err(|source| LayoutError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| LayoutError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every configured address, normalized, once each, in layout order.
    ///
    /// Unused slots contribute a single empty placeholder; filtering those out
    /// is left to the presentation side.
    pub fn tracked_addresses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.locations
            .iter()
            .flat_map(|location| location.panels.iter())
            .flat_map(|panel| panel.slots.iter())
            .map(|slot| normalize_address(slot))
            .filter(|address| seen.insert(address.clone()))
            .collect()
    }

    /// Pairs every slot with its snapshot.
    pub fn group<'a>(&self, snapshots: &'a SnapshotMap) -> Vec<LocationView<'a>> {
        self.locations
            .iter()
            .map(|location| LocationView {
                name: location.name.clone(),
                panels: location
                    .panels
                    .iter()
                    .map(|panel| PanelView {
                        name: panel.name.clone(),
                        slots: panel
                            .slots
                            .iter()
                            .enumerate()
                            .map(|(index, slot)| {
                                let address = normalize_address(slot);
                                let snapshot = if address.is_empty() { None } else { snapshots.get(&address) };
                                SlotView { index, address, snapshot }
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Fleet-wide aggregates over a snapshot map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetSummary {
    /// Devices with a snapshot.
    pub devices: usize,
    /// Devices whose last fetch succeeded.
    pub online: usize,
    /// Devices whose last fetch failed.
    pub offline: usize,
    /// Sum of the best available hashrate of online devices, in H/s.
    pub total_hashrate: f64,
    /// Hottest online device and its temperature.
    pub hottest: Option<(String, f64)>,
}

impl FleetSummary {
    /// Aggregates every snapshot in the map.
    pub fn from_snapshots(snapshots: &SnapshotMap) -> Self {
        let mut summary = FleetSummary::default();
        for snapshot in snapshots.values() {
            summary.devices += 1;
            if !snapshot.is_online() {
                summary.offline += 1;
                continue;
            }
            summary.online += 1;
            summary.total_hashrate += snapshot.hashrate().unwrap_or(0.0);
            if let Some(t) = snapshot.max_temperature() {
                if summary.hottest.as_ref().map_or(true, |(_, max)| t > *max) {
                    summary.hottest = Some((snapshot.ip.clone(), t));
                }
            }
        }
        summary
    }
}

impl fmt::Display for FleetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} devices ({} online, {} offline), total {}",
            self.devices,
            self.online,
            self.offline,
            format_hashrate(self.total_hashrate)
        )?;
        if let Some((ip, t)) = &self.hottest {
            write!(f, ", hottest {} at {:.1}°C", ip, t)?;
        }
        Ok(())
    }
}

/// Formats a hashrate in H/s with an SI prefix, e.g. `110.00 TH/s`.
pub fn format_hashrate(hashes_per_second: f64) -> String {
    const UNITS: [&str; 7] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];
    let mut value = hashes_per_second;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
