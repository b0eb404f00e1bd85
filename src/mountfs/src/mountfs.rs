use crate::iostat::IostatContext;
use crate::lom::LomMeta;
use crate::{CLOUD_BS, LOCAL_BS, LOM_CACHE_MASK, WORKFILE_TYPE};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::{error, info, warn};
use nix::sys::statvfs::statvfs;
use ostore_lib::{path_digest, StoreError, StoreResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One shard of a mountpath's LOM cache.
pub type LomCacheShard = DashMap<String, Arc<LomMeta>>;

/// Anything that owns per-mountpath workers and must learn about mountpath
/// lifecycle changes.
pub trait PathRunner: Send + Sync {
    fn req_add_mountpath(&self, mpath: &str);
    fn req_remove_mountpath(&self, mpath: &str);
    fn req_enable_mountpath(&self, mpath: &str);
    fn req_disable_mountpath(&self, mpath: &str);
}

/// The filesystem-health-checker collaborator; repeated failures may lead
/// it to disable the offending mountpath.
pub trait FsHealthChecker: Send + Sync {
    fn on_io_error(&self, fqn: &str, err: &StoreError);
}

/// A mountpath is a local directory serviced by a local filesystem; there is
/// a 1-to-1 relationship between mountpaths and filesystems unless the fsid
/// check was explicitly disabled.
pub struct MountpathInfo {
    /// Cleaned `orig_path`.
    pub path: String,
    /// As entered by the user; used for logging and error reporting.
    pub orig_path: String,
    pub fsid: u64,
    pub file_system: String,
    pub path_digest: u64,

    // only-increasing counter to keep fast-removal directory names unique
    remove_dir_counter: AtomicU64,

    lom_caches: Vec<LomCacheShard>,
}

impl MountpathInfo {
    fn new(orig_path: &str, clean_path: String, fsid: u64, file_system: String) -> Self {
        let digest = path_digest(&clean_path);
        let shards = (LOM_CACHE_MASK + 1) as usize;
        Self {
            path: clean_path,
            orig_path: orig_path.to_string(),
            fsid,
            file_system,
            path_digest: digest,
            remove_dir_counter: AtomicU64::new(0),
            lom_caches: (0..shards).map(|_| DashMap::new()).collect(),
        }
    }

    pub fn lom_cache(&self, idx: usize) -> &LomCacheShard {
        &self.lom_caches[idx & LOM_CACHE_MASK as usize]
    }

    pub fn make_path(&self, content_type: &str, bck_is_local: bool) -> PathBuf {
        let locality = if bck_is_local { LOCAL_BS } else { CLOUD_BS };
        Path::new(&self.path).join(content_type).join(locality)
    }

    pub fn make_path_bucket(&self, content_type: &str, bucket: &str, bck_is_local: bool) -> PathBuf {
        self.make_path(content_type, bck_is_local).join(bucket)
    }

    pub fn make_path_bucket_object(
        &self,
        content_type: &str,
        bucket: &str,
        objname: &str,
        bck_is_local: bool,
    ) -> PathBuf {
        self.make_path_bucket(content_type, bucket, bck_is_local)
            .join(objname)
    }

    /// Removes a directory in steps: synchronously renames it into a
    /// uniquely-numbered workfile bucket, then deletes the renamed tree
    /// asynchronously.
    pub fn fast_remove_dir(&self, dir: &Path) -> StoreResult<()> {
        let counter = self.remove_dir_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let tmp_bucket = format!("removing-{}", counter);
        let tmp_dir = self.make_path_bucket(WORKFILE_TYPE, &tmp_bucket, true);
        if let Some(parent) = tmp_dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {}", parent.display(), e)))?;
        }
        std::fs::rename(dir, &tmp_dir)
            .map_err(|e| StoreError::Io(format!("rename {}: {}", dir.display(), e)))?;

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&tmp_dir).await {
                error!("remove_dir_all for {} failed: {}", tmp_dir.display(), e);
            }
        });
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!("mp[{}, fs={}]", self.path, self.file_system)
    }
}

/// Used and total capacity across distinct filesystems backing the
/// available mountpaths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsInfo {
    pub used: u64,
    pub capacity: u64,
    pub pct_used: f64,
}

type MpathMap = HashMap<String, Arc<MountpathInfo>>;

/// All mountpaths of one target. The available and disabled maps are
/// published by atomically swapping whole maps; readers never lock. All
/// mutations serialize on the fsid registry mutex and publish fresh maps.
pub struct MountedFs {
    // fsid -> registered path; doubles as the mutation lock
    fs_ids: Mutex<HashMap<u64, String>>,
    check_fsid: AtomicBool,
    available: ArcSwap<MpathMap>,
    disabled: ArcSwap<MpathMap>,
    // cached mountpath with the largest path digest, for metadata xattrs
    xattr_mpath: ArcSwap<Option<Arc<MountpathInfo>>>,
    fshc: ArcSwap<Option<Arc<dyn FsHealthChecker>>>,
    pub iostat: Arc<IostatContext>,
}

impl MountedFs {
    pub fn new() -> Self {
        Self {
            fs_ids: Mutex::new(HashMap::new()),
            check_fsid: AtomicBool::new(true),
            available: ArcSwap::from_pointee(HashMap::new()),
            disabled: ArcSwap::from_pointee(HashMap::new()),
            xattr_mpath: ArcSwap::from_pointee(None),
            fshc: ArcSwap::from_pointee(None),
            iostat: Arc::new(IostatContext::new()),
        }
    }

    pub fn set_health_checker(&self, fshc: Arc<dyn FsHealthChecker>) {
        self.fshc.store(Arc::new(Some(fshc)));
    }

    /// Reports a per-mountpath I/O error to the health checker; without one
    /// registered the error is only logged.
    pub fn report_io_error(&self, fqn: &str, err: &StoreError) {
        match self.fshc.load().as_ref() {
            Some(fshc) => fshc.on_io_error(fqn, err),
            None => error!("I/O error on {}: {}", fqn, err),
        }
    }

    /// Adds and validates every configured mountpath. Fatal on the first
    /// failure.
    pub fn init(&self, fspaths: &[String]) -> StoreResult<()> {
        if fspaths.is_empty() {
            return Err(StoreError::Config(
                "no fspaths - see the fspaths section of the configuration".to_string(),
            ));
        }
        for path in fspaths {
            self.add(path)?;
        }
        Ok(())
    }

    /// Disables fsid uniqueness checking; for co-located virtual mountpaths.
    pub fn disable_fsid_check(&self) {
        self.check_fsid.store(false, Ordering::SeqCst);
    }

    pub fn add(&self, mpath: &str) -> StoreResult<()> {
        for bucket_segment in [LOCAL_BS, CLOUD_BS] {
            let invalid = format!("/{}", bucket_segment);
            if mpath.ends_with(&invalid) {
                return Err(StoreError::InvalidParam(format!(
                    "cannot add fspath {} with suffix {}",
                    mpath, invalid
                )));
            }
            let invalid_inner = format!("{}/", invalid);
            if mpath.contains(&invalid_inner) {
                return Err(StoreError::InvalidParam(format!(
                    "fspath {} cannot contain {} anywhere in its path",
                    mpath, invalid_inner
                )));
            }
        }

        let meta = std::fs::metadata(mpath)
            .map_err(|e| StoreError::InvalidParam(format!("fspath {} does not exist: {}", mpath, e)))?;
        if !meta.is_dir() {
            return Err(StoreError::InvalidParam(format!(
                "fspath {} is not a directory",
                mpath
            )));
        }
        let stat = statvfs(Path::new(mpath))
            .map_err(|e| StoreError::Io(format!("cannot statvfs fspath {}: {}", mpath, e)))?;
        let fsid = stat.filesystem_id() as u64;
        let file_system = file_system_of(mpath);

        let clean_path = clean(mpath);
        let mp = Arc::new(MountpathInfo::new(mpath, clean_path, fsid, file_system));

        let mut fs_ids = self.fs_ids.lock().unwrap();
        let (mut available, disabled) = self.mountpaths_copy();
        if available.contains_key(&mp.path) || disabled.contains_key(&mp.path) {
            return Err(StoreError::AlreadyExists(format!(
                "tried to add already registered mountpath: {}",
                mp.path
            )));
        }
        if self.check_fsid.load(Ordering::SeqCst) {
            if let Some(existing) = fs_ids.get(&fsid) {
                return Err(StoreError::AlreadyExists(format!(
                    "tried to add path {} but the same fsid was already registered by {}",
                    mpath, existing
                )));
            }
        }

        self.iostat.add_mpath(&mp.path, &mp.file_system);
        fs_ids.insert(fsid, mpath.to_string());
        available.insert(mp.path.clone(), mp);
        self.update_paths(available, disabled);
        Ok(())
    }

    /// Removes a mountpath, searching available first and disabled second.
    /// Removing the last available mountpath is logged as an error but still
    /// succeeds; the coordinator uses that signal to unregister the target.
    pub fn remove(&self, mpath: &str) -> StoreResult<()> {
        let mut fs_ids = self.fs_ids.lock().unwrap();
        let mpath = clean(mpath);
        let (mut available, mut disabled) = self.mountpaths_copy();

        if let Some(mp) = available.remove(&mpath) {
            self.iostat.remove_mpath(&mpath);
            fs_ids.remove(&mp.fsid);
            if available.is_empty() {
                error!("removed the last available mountpath {}", mp.describe());
            } else {
                info!(
                    "removed mountpath {} ({} remain active)",
                    mp.describe(),
                    available.len()
                );
            }
            self.update_paths(available, disabled);
            return Ok(());
        }

        if let Some(mp) = disabled.remove(&mpath) {
            fs_ids.remove(&mp.fsid);
            self.update_paths(available, disabled);
            return Ok(());
        }

        Err(StoreError::NotFound(format!(
            "tried to remove non-existing mountpath: {}",
            mpath
        )))
    }

    /// Moves a disabled mountpath back to available. Returns
    /// `(enabled, exists)`; re-enabling an already-available mountpath
    /// returns `(false, true)`.
    pub fn enable(&self, mpath: &str) -> (bool, bool) {
        let _fs_ids = self.fs_ids.lock().unwrap();
        let mpath = clean(mpath);
        let (mut available, mut disabled) = self.mountpaths_copy();
        if available.contains_key(&mpath) {
            return (false, true);
        }
        if let Some(mp) = disabled.remove(&mpath) {
            self.iostat.add_mpath(&mpath, &mp.file_system);
            available.insert(mpath, mp);
            self.update_paths(available, disabled);
            return (true, true);
        }
        (false, false)
    }

    /// Moves an available mountpath to disabled. Returns `(disabled, exists)`.
    pub fn disable(&self, mpath: &str) -> (bool, bool) {
        let _fs_ids = self.fs_ids.lock().unwrap();
        let mpath = clean(mpath);
        let (mut available, mut disabled) = self.mountpaths_copy();
        if let Some(mp) = available.remove(&mpath) {
            self.iostat.remove_mpath(&mpath);
            if available.is_empty() {
                error!("disabled the last available mountpath {}", mp.describe());
            } else {
                info!(
                    "disabled mountpath {} ({} remain active)",
                    mp.describe(),
                    available.len()
                );
            }
            disabled.insert(mpath, mp);
            self.update_paths(available, disabled);
            return (true, true);
        }
        if disabled.contains_key(&mpath) {
            return (false, true);
        }
        (false, false)
    }

    /// Snapshot of the available and disabled maps; never blocks.
    pub fn get(&self) -> (Arc<MpathMap>, Arc<MpathMap>) {
        (self.available.load_full(), self.disabled.load_full())
    }

    pub fn num_avail(&self) -> usize {
        self.available.load().len()
    }

    /// Resolves the available mountpath whose cleaned path is a prefix of
    /// the given FQN.
    pub fn mpath_for_fqn(&self, fqn: &str) -> Option<Arc<MountpathInfo>> {
        let available = self.available.load();
        let mut best: Option<&Arc<MountpathInfo>> = None;
        for mp in available.values() {
            if fqn.starts_with(&mp.path)
                && fqn[mp.path.len()..].starts_with('/')
                && best.map(|b| mp.path.len() > b.path.len()).unwrap_or(true)
            {
                best = Some(mp);
            }
        }
        best.cloned()
    }

    /// Deterministic object placement: the available mountpath winning the
    /// highest-random-weight draw for this object uname.
    pub fn hrw_mpath(&self, uname: &str) -> StoreResult<Arc<MountpathInfo>> {
        let available = self.available.load();
        available
            .values()
            .max_by_key(|mp| path_digest(&format!("{}|{}", mp.path, uname)))
            .cloned()
            .ok_or_else(|| StoreError::InvalidState("no mountpath available".to_string()))
    }

    /// The available mountpath with the largest path digest; used to persist
    /// bucket metadata. Cached; the cache is invalidated on every
    /// publication.
    pub fn mpath_for_xattr(&self) -> StoreResult<Arc<MountpathInfo>> {
        if let Some(mp) = self.xattr_mpath.load().as_ref() {
            return Ok(mp.clone());
        }

        let available = self.available.load();
        let best = available
            .values()
            .max_by_key(|mp| mp.path_digest)
            .cloned()
            .ok_or_else(|| StoreError::InvalidState("no mountpath available".to_string()))?;
        self.xattr_mpath.store(Arc::new(Some(best.clone())));
        Ok(best)
    }

    /// Aggregates used bytes and capacity over the distinct filesystems
    /// backing the available mountpaths.
    pub fn fetch_fs_info(&self) -> FsInfo {
        let mut info = FsInfo::default();
        let (available, _) = self.get();
        let mut visited: Vec<u64> = Vec::new();
        for mp in available.values() {
            let stat = match statvfs(Path::new(&mp.path)) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to statvfs mountpath {}: {}", mp.path, e);
                    continue;
                }
            };
            if visited.contains(&mp.fsid) {
                continue;
            }
            visited.push(mp.fsid);
            let frsize = stat.fragment_size() as u64;
            info.used += (stat.blocks() as u64 - stat.blocks_available() as u64) * frsize;
            info.capacity += stat.blocks() as u64 * frsize;
        }
        if info.capacity > 0 {
            info.pct_used = (info.used * 100) as f64 / info.capacity as f64;
        }
        info
    }

    /// True when the mountpath's current disk utilization is below the low
    /// watermark.
    pub fn is_mpath_idle(&self, mp: &MountpathInfo, low_wm: i64) -> bool {
        let util = self.iostat.get_disk_util(&mp.path);
        util >= 0 && util < low_wm
    }

    /// Creates `<mpath>/<content-type>/<locality>/<bucket>` on every
    /// available mountpath for every registered content type.
    pub fn create_bucket_dirs(
        &self,
        content_types: &[&str],
        bucket: &str,
        bck_is_local: bool,
    ) -> StoreResult<()> {
        let (available, _) = self.get();
        for mp in available.values() {
            for ct in content_types {
                let dir = mp.make_path_bucket(ct, bucket, bck_is_local);
                std::fs::create_dir_all(&dir)
                    .map_err(|e| StoreError::Io(format!("create {}: {}", dir.display(), e)))?;
            }
        }
        Ok(())
    }

    /// Renders the available set, one mountpath per line.
    pub fn describe(&self) -> String {
        let (available, _) = self.get();
        let mut lines: Vec<String> = available.values().map(|mp| mp.describe()).collect();
        lines.sort();
        lines.join("\n")
    }

    fn update_paths(&self, available: MpathMap, disabled: MpathMap) {
        self.available.store(Arc::new(available));
        self.disabled.store(Arc::new(disabled));
        self.xattr_mpath.store(Arc::new(None));
    }

    fn mountpaths_copy(&self) -> (MpathMap, MpathMap) {
        let (available, disabled) = self.get();
        ((*available).clone(), (*disabled).clone())
    }
}

impl Default for MountedFs {
    fn default() -> Self {
        Self::new()
    }
}

fn clean(path: &str) -> String {
    let mut cleaned = PathBuf::new();
    for comp in Path::new(path).components() {
        cleaned.push(comp);
    }
    let s = cleaned.to_string_lossy().to_string();
    if s.len() > 1 {
        s.trim_end_matches('/').to_string()
    } else {
        s
    }
}

/// Best-effort resolution of the filesystem (device) backing a path: the
/// `/proc/mounts` entry with the longest mount-point prefix wins.
fn file_system_of(path: &str) -> String {
    let mounts = match std::fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(e) => {
            warn!("cannot read /proc/mounts: {}", e);
            return "unknown".to_string();
        }
    };
    let clean_path = clean(path);
    let mut best: Option<(&str, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        if clean_path == mount_point
            || (clean_path.starts_with(mount_point)
                && (mount_point == "/" || clean_path[mount_point.len()..].starts_with('/')))
        {
            if best.map(|(_, mp)| mount_point.len() > mp.len()).unwrap_or(true) {
                best = Some((device, mount_point));
            }
        }
    }
    best.map(|(device, _)| device.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
