//! Allocator tunables and the `alloc=` mount-option syntax.
//!
//! Options are a colon-separated list of names, some taking a value:
//!
//! ```text
//! concentrating_formatted_nodes=10:displacing_large_files=16:skip_busy:preallocsize=9
//! ```
//!
//! A non-empty option string replaces the default heuristic set entirely;
//! numeric tunables keep their defaults unless named. Besides the reiserfs
//! names, `border_fraction=N`, `skip_busy_free=PCT`, `busy_bitmap_free=PCT`
//! and `stolen_retries=N` set the remaining tunables directly.

use rfs_error::{Result, RfsError};
use rfs_types::parse_auto_radix_u64;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Default divisor for the formatted-node border (`block_count / 10`).
pub const DEFAULT_BORDER_FRACTION: u64 = 10;
/// Default file block at which large-file displacement kicks in.
pub const DEFAULT_LARGE_FILE_BLOCK: u64 = 16;
/// Default preallocation window (one requested block plus 16 surplus).
pub const DEFAULT_PREALLOC_SIZE: u64 = 17;
/// `preallocmin` value used when the option is named without a value.
pub const PREALLOC_MIN_WHEN_NAMED: u64 = 4;
/// Retry budget for stolen-bit rescans within one bitmap block.
pub const DEFAULT_STOLEN_RETRY_BUDGET: u32 = 64;
/// Skip-busy applies only while more than this percentage of the device is
/// free.
pub const DEFAULT_SKIP_BUSY_DEVICE_FREE: u64 = 5;
/// Bitmaps at or below this percentage free are busy.
pub const DEFAULT_BUSY_BITMAP_FREE: u64 = 10;

/// Every heuristic flag and tunable of the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocOptions {
    pub concentrating_formatted_nodes: bool,
    /// `block_count / border_fraction` separates formatted nodes from data.
    pub border_fraction: u64,
    pub displacing_large_files: bool,
    pub large_file_block_threshold: u64,
    pub displacing_new_packing_localities: bool,
    pub old_hashed_relocation: bool,
    pub new_hashed_relocation: bool,
    pub dirid_groups: bool,
    pub oid_groups: bool,
    pub packing_groups: bool,
    pub hashed_formatted_nodes: bool,
    pub skip_busy: bool,
    pub hundredth_slices: bool,
    pub old_way: bool,
    pub displace_based_on_dirid: bool,
    /// Legacy `old_way` uses hashed relocation instead of raw dir ids.
    pub hashed_relocation: bool,
    /// With `hashed_relocation`, `old_way` leaves `search_start` alone.
    pub no_unhashed_relocation: bool,
    /// Files smaller than this many blocks get no preallocation.
    pub preallocation_min_size: u64,
    pub preallocation_window_size: u64,
    /// Skip-busy only applies while more than this percentage of the device
    /// is free.
    pub skip_busy_device_free_percent: u64,
    /// Bitmaps at or below this percentage free count as busy.
    pub busy_bitmap_free_percent: u64,
    pub stolen_retry_budget: u32,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            concentrating_formatted_nodes: false,
            border_fraction: DEFAULT_BORDER_FRACTION,
            displacing_large_files: false,
            large_file_block_threshold: DEFAULT_LARGE_FILE_BLOCK,
            displacing_new_packing_localities: false,
            old_hashed_relocation: false,
            new_hashed_relocation: false,
            dirid_groups: true,
            oid_groups: false,
            packing_groups: true,
            hashed_formatted_nodes: false,
            skip_busy: true,
            hundredth_slices: false,
            old_way: false,
            displace_based_on_dirid: false,
            hashed_relocation: false,
            no_unhashed_relocation: false,
            preallocation_min_size: 0,
            preallocation_window_size: DEFAULT_PREALLOC_SIZE,
            skip_busy_device_free_percent: DEFAULT_SKIP_BUSY_DEVICE_FREE,
            busy_bitmap_free_percent: DEFAULT_BUSY_BITMAP_FREE,
            stolen_retry_budget: DEFAULT_STOLEN_RETRY_BUDGET,
        }
    }
}

/// Names of the boolean heuristics, in canonical render order.
const FLAG_NAMES: &[&str] = &[
    "concentrating_formatted_nodes",
    "displacing_large_files",
    "displacing_new_packing_localities",
    "old_hashed_relocation",
    "new_hashed_relocation",
    "dirid_groups",
    "oid_groups",
    "packing_groups",
    "hashed_formatted_nodes",
    "skip_busy",
    "hundredth_slices",
    "old_way",
    "displace_based_on_dirid",
    "hashed_relocation",
    "no_unhashed_relocation",
];

impl AllocOptions {
    /// Parse an `alloc=` option string on top of the defaults.
    pub fn parse(options: &str) -> Result<Self> {
        let mut parsed = Self::default();
        if options.trim().is_empty() {
            return Ok(parsed);
        }
        parsed.clear_flags();
        for item in options.split(':').filter(|item| !item.is_empty()) {
            let (name, value) = match item.split_once('=') {
                Some((name, value)) => (name, Some(value).filter(|v| !v.is_empty())),
                None => (item, None),
            };
            parsed.apply(name, value)?;
        }
        info!(target: "rfs::alloc", event = "options_parsed", options = %parsed);
        Ok(parsed)
    }

    fn clear_flags(&mut self) {
        for name in FLAG_NAMES {
            if let Some(flag) = self.flag_mut(name) {
                *flag = false;
            }
        }
    }

    fn flag_mut(&mut self, name: &str) -> Option<&mut bool> {
        Some(match name {
            "concentrating_formatted_nodes" => &mut self.concentrating_formatted_nodes,
            "displacing_large_files" => &mut self.displacing_large_files,
            "displacing_new_packing_localities" => &mut self.displacing_new_packing_localities,
            "old_hashed_relocation" => &mut self.old_hashed_relocation,
            "new_hashed_relocation" => &mut self.new_hashed_relocation,
            "dirid_groups" => &mut self.dirid_groups,
            "oid_groups" => &mut self.oid_groups,
            "packing_groups" => &mut self.packing_groups,
            "hashed_formatted_nodes" => &mut self.hashed_formatted_nodes,
            "skip_busy" => &mut self.skip_busy,
            "hundredth_slices" => &mut self.hundredth_slices,
            "old_way" => &mut self.old_way,
            "displace_based_on_dirid" => &mut self.displace_based_on_dirid,
            "hashed_relocation" => &mut self.hashed_relocation,
            "no_unhashed_relocation" => &mut self.no_unhashed_relocation,
            _ => return None,
        })
    }

    fn flag(&self, name: &str) -> bool {
        match name {
            "concentrating_formatted_nodes" => self.concentrating_formatted_nodes,
            "displacing_large_files" => self.displacing_large_files,
            "displacing_new_packing_localities" => self.displacing_new_packing_localities,
            "old_hashed_relocation" => self.old_hashed_relocation,
            "new_hashed_relocation" => self.new_hashed_relocation,
            "dirid_groups" => self.dirid_groups,
            "oid_groups" => self.oid_groups,
            "packing_groups" => self.packing_groups,
            "hashed_formatted_nodes" => self.hashed_formatted_nodes,
            "skip_busy" => self.skip_busy,
            "hundredth_slices" => self.hundredth_slices,
            "old_way" => self.old_way,
            "displace_based_on_dirid" => self.displace_based_on_dirid,
            "hashed_relocation" => self.hashed_relocation,
            "no_unhashed_relocation" => self.no_unhashed_relocation,
            _ => false,
        }
    }

    fn apply(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let number = |field: &'static str| -> Result<Option<u64>> {
            value
                .map(|text| parse_auto_radix_u64(field, text))
                .transpose()
                .map_err(|err| RfsError::InvalidOption(format!("{name}: {err}")))
        };
        match name {
            "concentrating_formatted_nodes" => {
                self.concentrating_formatted_nodes = true;
                // The value is a percentage of the device kept for formatted
                // nodes; out-of-range values fall back to 10%.
                let percent = number("concentrating_formatted_nodes")?.unwrap_or(10);
                self.border_fraction = if percent == 0 || percent > 100 {
                    DEFAULT_BORDER_FRACTION
                } else {
                    100 / percent
                };
            }
            "displacing_large_files" => {
                self.displacing_large_files = true;
                self.large_file_block_threshold =
                    number("displacing_large_files")?.unwrap_or(DEFAULT_LARGE_FILE_BLOCK);
            }
            "preallocmin" => {
                self.preallocation_min_size =
                    number("preallocmin")?.unwrap_or(PREALLOC_MIN_WHEN_NAMED);
            }
            "preallocsize" => {
                self.preallocation_window_size =
                    number("preallocsize")?.unwrap_or(DEFAULT_PREALLOC_SIZE);
            }
            "border_fraction" => {
                let fraction = required(name, number("border_fraction")?)?;
                if fraction == 0 {
                    return Err(RfsError::InvalidOption(
                        "border_fraction must be at least 1".to_owned(),
                    ));
                }
                self.border_fraction = fraction;
            }
            "skip_busy_free" => {
                self.skip_busy_device_free_percent = required(name, number("skip_busy_free")?)?;
            }
            "busy_bitmap_free" => {
                self.busy_bitmap_free_percent = required(name, number("busy_bitmap_free")?)?;
            }
            "stolen_retries" => {
                let retries = required(name, number("stolen_retries")?)?;
                self.stolen_retry_budget = u32::try_from(retries).map_err(|_| {
                    RfsError::InvalidOption(format!("stolen_retries={retries} is too large"))
                })?;
            }
            _ => {
                let Some(flag) = self.flag_mut(name) else {
                    warn!(target: "rfs::alloc", event = "unknown_option", name);
                    return Err(RfsError::InvalidOption(format!("unknown option: {name}")));
                };
                if value.is_some() {
                    return Err(RfsError::InvalidOption(format!(
                        "{name} does not take a value"
                    )));
                }
                *flag = true;
            }
        }
        Ok(())
    }

    /// Percentage `concentrating_formatted_nodes=P` that parses back to the
    /// current border fraction, if there is one.
    fn border_percent(&self) -> Option<u64> {
        let fraction = self.border_fraction.max(1);
        let percent = 100 / fraction;
        (percent > 0 && 100 / percent == fraction).then_some(percent)
    }

    /// Preallocation surplus (window minus the requested block), if any.
    #[must_use]
    pub fn preallocation_surplus(&self) -> u64 {
        self.preallocation_window_size.saturating_sub(1)
    }
}

fn required(name: &str, value: Option<u64>) -> Result<u64> {
    value.ok_or_else(|| RfsError::InvalidOption(format!("{name} requires a value")))
}

impl fmt::Display for AllocOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut items: Vec<String> = Vec::new();
        for name in FLAG_NAMES {
            if !self.flag(name) {
                continue;
            }
            match *name {
                "concentrating_formatted_nodes" => match self.border_percent() {
                    Some(percent) => items.push(format!("{name}={percent}")),
                    None => items.push((*name).to_owned()),
                },
                "displacing_large_files" => {
                    items.push(format!("{name}={}", self.large_file_block_threshold));
                }
                _ => items.push((*name).to_owned()),
            }
        }
        let fraction_hidden = if self.concentrating_formatted_nodes {
            self.border_percent().is_none()
        } else {
            self.border_fraction.max(1) != DEFAULT_BORDER_FRACTION
        };
        if fraction_hidden {
            items.push(format!("border_fraction={}", self.border_fraction.max(1)));
        }
        items.push(format!("preallocmin={}", self.preallocation_min_size));
        items.push(format!("preallocsize={}", self.preallocation_window_size));
        if self.skip_busy_device_free_percent != DEFAULT_SKIP_BUSY_DEVICE_FREE {
            items.push(format!("skip_busy_free={}", self.skip_busy_device_free_percent));
        }
        if self.busy_bitmap_free_percent != DEFAULT_BUSY_BITMAP_FREE {
            items.push(format!("busy_bitmap_free={}", self.busy_bitmap_free_percent));
        }
        if self.stolen_retry_budget != DEFAULT_STOLEN_RETRY_BUDGET {
            items.push(format!("stolen_retries={}", self.stolen_retry_budget));
        }
        f.write_str(&items.join(":"))
    }
}
