use crate::{StoreError, StoreResult};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimum / maximum number of data or parity slices.
pub const MIN_SLICE_COUNT: usize = 1;
pub const MAX_SLICE_COUNT: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    /// Number of local copies. The only supported value is 2.
    pub copies: u32,
    /// Utilizations are considered equivalent when they differ by less than this.
    pub util_thresh: i64,
    /// Capacity of a mirror jogger's work channel.
    pub burst_buffer: usize,
}

impl Default for MirrorConf {
    fn default() -> Self {
        Self {
            enabled: false,
            copies: 2,
            util_thresh: 20,
            burst_buffer: 512,
        }
    }
}

impl MirrorConf {
    pub fn validate(&self) -> StoreResult<()> {
        if self.util_thresh < 0 || self.util_thresh > 100 {
            return Err(StoreError::Config(format!(
                "bad mirror.util_thresh: {} (expected value in range [0, 100])",
                self.util_thresh
            )));
        }
        if self.burst_buffer == 0 {
            return Err(StoreError::Config(
                "bad mirror.burst_buffer: 0 (expected > 0)".to_string(),
            ));
        }
        if self.enabled && self.copies != 2 {
            return Err(StoreError::Config(format!(
                "bad mirror.copies: {} (expected 2)",
                self.copies
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: usize,
    pub parity_slices: usize,
    /// Objects below this size are replicated instead of sliced.
    pub obj_size_limit: i64,
}

impl Default for EcConf {
    fn default() -> Self {
        Self {
            enabled: false,
            data_slices: 2,
            parity_slices: 2,
            obj_size_limit: 256 * 1024,
        }
    }
}

impl EcConf {
    /// Encoding distributes `data + parity` slices to other targets and keeps
    /// the full replica locally.
    pub fn required_encode_targets(&self) -> usize {
        self.data_slices + self.parity_slices + 1
    }

    /// Restore needs any `data` slices plus the restoring target itself.
    pub fn required_restore_targets(&self) -> usize {
        self.data_slices + 1
    }

    /// Small objects are replicated to `parity + 1` targets instead of sliced.
    pub fn is_ec_copy(&self, size: i64) -> bool {
        size < self.obj_size_limit
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.obj_size_limit < 0 {
            return Err(StoreError::Config(format!(
                "bad ec.obj_size_limit: {} (expected >= 0)",
                self.obj_size_limit
            )));
        }
        if self.data_slices < MIN_SLICE_COUNT || self.data_slices > MAX_SLICE_COUNT {
            return Err(StoreError::Config(format!(
                "bad ec.data_slices: {} (expected value in range [{}, {}])",
                self.data_slices, MIN_SLICE_COUNT, MAX_SLICE_COUNT
            )));
        }
        if self.parity_slices < MIN_SLICE_COUNT || self.parity_slices > MAX_SLICE_COUNT {
            return Err(StoreError::Config(format!(
                "bad ec.parity_slices: {} (expected value in range [{}, {}])",
                self.parity_slices, MIN_SLICE_COUNT, MAX_SLICE_COUNT
            )));
        }
        Ok(())
    }

    pub fn validate_as_props(&self, target_cnt: usize) -> StoreResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.validate()?;
        let required = self.required_encode_targets();
        if target_cnt < required {
            return Err(StoreError::Config(format!(
                "erasure coding requires {} targets to use {} data and {} parity slices \
                 (the cluster has only {})",
                required, self.data_slices, self.parity_slices, target_cnt
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConf {
    /// Sampling intervals for disk utilization, milliseconds.
    pub iostat_time_short_ms: u64,
    pub iostat_time_long_ms: u64,
    /// Utilization watermarks bounding the throttling band, percent.
    pub disk_util_low_wm: i64,
    pub disk_util_high_wm: i64,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            iostat_time_short_ms: 100,
            iostat_time_long_ms: 2000,
            disk_util_low_wm: 20,
            disk_util_high_wm: 80,
        }
    }
}

impl DiskConf {
    pub fn iostat_time_short(&self) -> Duration {
        Duration::from_millis(self.iostat_time_short_ms)
    }

    pub fn iostat_time_long(&self) -> Duration {
        Duration::from_millis(self.iostat_time_long_ms)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.iostat_time_short_ms == 0 {
            return Err(StoreError::Config(
                "disk.iostat_time_short_ms is zero".to_string(),
            ));
        }
        if self.iostat_time_long_ms < self.iostat_time_short_ms {
            return Err(StoreError::Config(format!(
                "disk.iostat_time_long_ms {} shorter than disk.iostat_time_short_ms {}",
                self.iostat_time_long_ms, self.iostat_time_short_ms
            )));
        }
        let (lwm, hwm) = (self.disk_util_low_wm, self.disk_util_high_wm);
        if lwm <= 0 || hwm <= lwm || hwm > 100 {
            return Err(StoreError::Config(format!(
                "bad disk utilization watermarks: low {}, high {} (expected 0 < low < high <= 100)",
                lwm, hwm
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// Bound for streaming a single file between targets, milliseconds.
    pub send_file_ms: u64,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self { send_file_ms: 5000 }
    }
}

impl TimeoutConf {
    pub fn send_file(&self) -> Duration {
        Duration::from_millis(self.send_file_ms)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.send_file_ms == 0 {
            return Err(StoreError::Config("timeout.send_file_ms is zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConf {
    pub stats_time_ms: u64,
}

impl Default for PeriodicConf {
    fn default() -> Self {
        Self { stats_time_ms: 10_000 }
    }
}

impl PeriodicConf {
    pub fn stats_time(&self) -> Duration {
        Duration::from_millis(self.stats_time_ms)
    }
}

/// Co-locates `count` virtual mountpaths on a single filesystem, which also
/// disables the fsid uniqueness check. Used by single-host deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestFspathConf {
    pub root: String,
    pub count: usize,
    pub instance: usize,
}

impl TestFspathConf {
    pub fn in_use(&self) -> bool {
        self.count > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConf {
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConf,
    #[serde(default)]
    pub periodic: PeriodicConf,
    #[serde(default)]
    pub timeout: TimeoutConf,
    #[serde(default)]
    pub disk: DiskConf,
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub ec: EcConf,
    #[serde(default)]
    pub fspaths: Vec<String>,
    #[serde(default)]
    pub test_fspaths: TestFspathConf,
}

impl Config {
    pub fn validate(&self) -> StoreResult<()> {
        self.timeout.validate()?;
        self.disk.validate()?;
        self.mirror.validate()?;
        self.ec.validate()?;
        if self.fspaths.is_empty() && !self.test_fspaths.in_use() {
            return Err(StoreError::Config(
                "no fspaths configured (set fspaths or test_fspaths.count)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json(data: &str) -> StoreResult<Self> {
        let config: Config = serde_json::from_str(data)
            .map_err(|e| StoreError::Config(format!("cannot parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Owner of the current configuration. Reads are hot and lock-free; updates
/// are staged with begin/commit/discard so that readers observe whole
/// configurations only.
pub struct ConfigOwner {
    current: ArcSwap<Config>,
    staged: Mutex<Option<Config>>,
}

impl ConfigOwner {
    pub fn new(config: Config) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            staged: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn begin_update(&self) -> StoreResult<Config> {
        let mut staged = self.staged.lock().unwrap();
        if staged.is_some() {
            return Err(StoreError::InvalidState(
                "config update already in progress".to_string(),
            ));
        }
        let clone = (**self.current.load()).clone();
        *staged = Some(clone.clone());
        Ok(clone)
    }

    pub fn commit_update(&self, config: Config) -> StoreResult<()> {
        config.validate()?;
        let mut staged = self.staged.lock().unwrap();
        if staged.take().is_none() {
            return Err(StoreError::InvalidState(
                "no config update in progress".to_string(),
            ));
        }
        self.current.store(Arc::new(config));
        Ok(())
    }

    pub fn discard_update(&self) {
        let mut staged = self.staged.lock().unwrap();
        *staged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            fspaths: vec!["/tmp/mp1".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_defaults_with_fspaths() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut c = valid_config();
        c.mirror.util_thresh = 101;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.mirror.enabled = true;
        c.mirror.copies = 3;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.ec.data_slices = 0;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.ec.parity_slices = 33;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.disk.disk_util_high_wm = c.disk.disk_util_low_wm;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.timeout.send_file_ms = 0;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.fspaths.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_ec_target_requirements() {
        let ec = EcConf {
            enabled: true,
            data_slices: 2,
            parity_slices: 2,
            obj_size_limit: 1024,
        };
        assert_eq!(ec.required_encode_targets(), 5);
        assert_eq!(ec.required_restore_targets(), 3);
        assert!(ec.is_ec_copy(1023));
        assert!(!ec.is_ec_copy(1024));
        assert!(ec.validate_as_props(5).is_ok());
        assert!(ec.validate_as_props(4).is_err());
    }

    #[test]
    fn test_config_owner_begin_commit_discard() {
        let owner = ConfigOwner::new(valid_config());
        let mut staged = owner.begin_update().unwrap();
        assert!(owner.begin_update().is_err());

        staged.mirror.enabled = true;
        owner.commit_update(staged).unwrap();
        assert!(owner.get().mirror.enabled);

        let _ = owner.begin_update().unwrap();
        owner.discard_update();
        assert!(owner.get().mirror.enabled);
        assert!(owner.begin_update().is_ok());
    }
}
