use log::{error, info};
use mountfs::{MountedFs, PathRunner};
use ostore_lib::StoreResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Multicasts mountpath lifecycle changes to every registered runner and
/// raises the no-mountpaths signal when the last one goes away; the
/// coordinator uses that signal to unregister the target from the cluster.
pub struct FsPathRunGroup {
    runners: Mutex<HashMap<u64, Arc<dyn PathRunner>>>,
    next_id: AtomicU64,
    on_no_mountpaths: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl FsPathRunGroup {
    pub fn new() -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            on_no_mountpaths: Mutex::new(None),
        }
    }

    pub fn reg(&self, runner: Arc<dyn PathRunner>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.runners.lock().unwrap().insert(id, runner);
        id
    }

    pub fn unreg(&self, id: u64) {
        self.runners.lock().unwrap().remove(&id);
    }

    pub fn set_no_mountpaths_hook(&self, hook: Box<dyn Fn(&str) + Send + Sync>) {
        *self.on_no_mountpaths.lock().unwrap() = Some(hook);
    }

    /// Adds the mountpath and notifies every runner when the add succeeded.
    pub fn add_mountpath(&self, mfs: &MountedFs, mpath: &str) -> StoreResult<()> {
        mfs.add(mpath)?;
        for runner in self.snapshot() {
            runner.req_add_mountpath(mpath);
        }
        if mfs.num_avail() > 1 {
            info!("added mountpath {}", mpath);
        } else {
            info!("added the first mountpath {}", mpath);
        }
        Ok(())
    }

    pub fn remove_mountpath(&self, mfs: &MountedFs, mpath: &str) -> StoreResult<()> {
        mfs.remove(mpath)?;
        for runner in self.snapshot() {
            runner.req_remove_mountpath(mpath);
        }
        self.check_no_mountpaths(mfs, "removed");
        Ok(())
    }

    /// Returns `(enabled, exists)` exactly like the mountpath manager.
    pub fn enable_mountpath(&self, mfs: &MountedFs, mpath: &str) -> (bool, bool) {
        let (enabled, exists) = mfs.enable(mpath);
        if !enabled || !exists {
            return (enabled, exists);
        }
        for runner in self.snapshot() {
            runner.req_enable_mountpath(mpath);
        }
        info!("re-enabled mountpath {}", mpath);
        (enabled, exists)
    }

    pub fn disable_mountpath(&self, mfs: &MountedFs, mpath: &str) -> (bool, bool) {
        let (disabled, exists) = mfs.disable(mpath);
        if !disabled || !exists {
            return (disabled, exists);
        }
        for runner in self.snapshot() {
            runner.req_disable_mountpath(mpath);
        }
        self.check_no_mountpaths(mfs, "disabled");
        (disabled, exists)
    }

    fn check_no_mountpaths(&self, mfs: &MountedFs, action: &str) {
        if mfs.num_avail() > 0 {
            return;
        }
        error!("{} the last available mountpath", action);
        if let Some(hook) = self.on_no_mountpaths.lock().unwrap().as_ref() {
            hook(action);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn PathRunner>> {
        self.runners.lock().unwrap().values().cloned().collect()
    }
}

impl Default for FsPathRunGroup {
    fn default() -> Self {
        Self::new()
    }
}
