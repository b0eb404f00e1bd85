use dashmap::DashMap;
use log::{debug, warn};
use ostore_lib::DiskConf;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Per-mountpath disk utilization, sampled from /proc/diskstats.
///
/// Mountpaths that do not map to a block device report zero utilization
/// unless a value was set explicitly.
pub struct IostatContext {
    // mountpath -> device name ("sda"), empty when unresolvable
    disks: DashMap<String, String>,
    // device -> last sampled utilization, percent
    utils: DashMap<String, i64>,
    // mountpath -> pinned utilization, takes precedence over the sampler
    overrides: DashMap<String, i64>,
    // device -> (io_ticks_ms, sampled_at)
    prev: Mutex<HashMap<String, (u64, Instant)>>,
}

impl IostatContext {
    pub fn new() -> Self {
        Self {
            disks: DashMap::new(),
            utils: DashMap::new(),
            overrides: DashMap::new(),
            prev: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_mpath(&self, mpath: &str, file_system: &str) {
        let device = file_system
            .strip_prefix("/dev/")
            .map(|d| d.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
            .unwrap_or_default();
        if device.is_empty() {
            debug!("mountpath {} has no backing block device ({})", mpath, file_system);
        }
        self.disks.insert(mpath.to_string(), device);
    }

    pub fn remove_mpath(&self, mpath: &str) {
        self.disks.remove(mpath);
        self.overrides.remove(mpath);
    }

    /// Current utilization of the disk behind the mountpath, 0..100.
    /// Unknown mountpaths and deviceless mountpaths report 0.
    pub fn get_disk_util(&self, mpath: &str) -> i64 {
        if let Some(pinned) = self.overrides.get(mpath) {
            return *pinned;
        }
        let device = match self.disks.get(mpath) {
            Some(d) => d.clone(),
            None => return 0,
        };
        if device.is_empty() {
            return 0;
        }
        self.utils.get(&device).map(|u| *u).unwrap_or(0)
    }

    /// Pins a mountpath's utilization, shadowing the sampler. Used to seed
    /// values for mountpaths with no backing device.
    pub fn set_disk_util(&self, mpath: &str, util: i64) {
        self.overrides.insert(mpath.to_string(), util.clamp(0, 100));
    }

    /// One sampling pass: utilization = io_ticks delta over wall-clock
    /// delta.
    pub fn sample(&self) {
        let stats = match read_diskstats() {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot sample /proc/diskstats: {}", e);
                return;
            }
        };
        let now = Instant::now();
        let mut prev = self.prev.lock().unwrap();
        for (device, io_ticks_ms) in stats {
            if let Some((prev_ticks, prev_at)) = prev.get(&device) {
                let elapsed_ms = now.duration_since(*prev_at).as_millis() as u64;
                if elapsed_ms > 0 {
                    let busy = io_ticks_ms.saturating_sub(*prev_ticks);
                    let util = ((busy * 100) / elapsed_ms).min(100) as i64;
                    self.utils.insert(device.clone(), util);
                }
            }
            prev.insert(device, (io_ticks_ms, now));
        }
    }

    /// Spawns the sampling loop; stopped through the token.
    pub fn run(self: &Arc<Self>, disk: &DiskConf, stop: CancellationToken) -> JoinHandle<()> {
        let ctx = self.clone();
        let period = disk.iostat_time_short();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tick.tick() => ctx.sample(),
                }
            }
        })
    }
}

impl Default for IostatContext {
    fn default() -> Self {
        Self::new()
    }
}

// /proc/diskstats: <major> <minor> <device> ... the 10th stat field after
// the device name is milliseconds spent doing I/O.
fn read_diskstats() -> std::io::Result<Vec<(String, u64)>> {
    let raw = std::fs::read_to_string("/proc/diskstats")?;
    let mut out = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 13 {
            continue;
        }
        let device = fields[2];
        // skip partitions; whole disks only
        if device.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false)
            && !device.starts_with("nvme")
        {
            continue;
        }
        if let Ok(io_ticks) = fields[12].parse::<u64>() {
            out.push((device.to_string(), io_ticks));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_mountpath_reports_zero() {
        let ctx = IostatContext::new();
        assert_eq!(ctx.get_disk_util("/no/such"), 0);
    }

    #[test]
    fn test_pinned_utilization_wins_and_clamps() {
        let ctx = IostatContext::new();
        ctx.add_mpath("/tmp/mp1", "tmpfs");
        assert_eq!(ctx.get_disk_util("/tmp/mp1"), 0);

        ctx.set_disk_util("/tmp/mp1", 42);
        assert_eq!(ctx.get_disk_util("/tmp/mp1"), 42);

        ctx.set_disk_util("/tmp/mp1", 250);
        assert_eq!(ctx.get_disk_util("/tmp/mp1"), 100);

        // pins are independent even for mountpaths on the same device
        ctx.add_mpath("/tmp/mp2", "tmpfs");
        ctx.set_disk_util("/tmp/mp2", 7);
        assert_eq!(ctx.get_disk_util("/tmp/mp1"), 100);
        assert_eq!(ctx.get_disk_util("/tmp/mp2"), 7);
    }

    #[test]
    fn test_remove_mpath_clears_pin() {
        let ctx = IostatContext::new();
        ctx.add_mpath("/tmp/mp1", "/dev/sda1");
        ctx.set_disk_util("/tmp/mp1", 55);
        ctx.remove_mpath("/tmp/mp1");
        assert_eq!(ctx.get_disk_util("/tmp/mp1"), 0);
    }
}
