use crate::lom_xattr::{read_lom_xattr, write_lom_xattr, LomXattr};
use crate::{ContentSpecMgr, ParsedFqn, LOM_CACHE_MASK};
use log::debug;
use ostore_lib::{file_checksum, name_digest, uname, Checksum, StoreError, StoreResult};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Immutable snapshot of a LOM kept in the per-mountpath cache. Entries are
/// weak: any discrepancy with the filesystem invalidates them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LomMeta {
    pub size: i64,
    pub atime_ns: i64,
    pub cksum: Option<Checksum>,
    pub version: Option<String>,
    pub copy_fqn: Vec<String>,
}

/// Local Object Metadata: the in-memory representation of one object on one
/// target, backed by a file plus one extended attribute.
#[derive(Clone)]
pub struct Lom {
    pub bucket: String,
    pub objname: String,
    pub fqn: String,
    pub parsed: ParsedFqn,
    pub bck_is_local: bool,

    pub size: i64,
    pub atime_ns: i64,
    pub cksum: Option<Checksum>,
    pub version: Option<String>,
    copy_fqn: Vec<String>,
    pub exists: bool,
}

impl Lom {
    /// Parses the FQN and resolves its mountpath. Fails on a malformed FQN
    /// or an unknown mountpath; does not touch the file.
    pub fn init(fqn: &str, csm: &ContentSpecMgr) -> StoreResult<Lom> {
        let parsed = csm.parse_fqn(fqn)?;
        Ok(Lom {
            bucket: parsed.bucket.clone(),
            objname: parsed.objname.clone(),
            fqn: fqn.to_string(),
            bck_is_local: parsed.bck_is_local,
            parsed,
            size: 0,
            atime_ns: 0,
            cksum: None,
            version: None,
            copy_fqn: Vec::new(),
            exists: false,
        })
    }

    pub fn uname(&self) -> String {
        uname(&self.bucket, &self.objname)
    }

    fn cache_idx(&self) -> usize {
        (name_digest(&self.uname()) & LOM_CACHE_MASK) as usize
    }

    /// Fills the LOM from the cache when present, falling back to the
    /// filesystem. `add_to_cache` controls residency after a fallback load.
    pub fn load(&mut self, add_to_cache: bool) -> StoreResult<()> {
        let key = self.uname();
        let shard = self.parsed.mpath.lom_cache(self.cache_idx());
        if let Some(meta) = shard.get(&key).map(|e| e.value().clone()) {
            // weak entry: verify against the file before trusting it
            match std::fs::metadata(&self.fqn) {
                Ok(stat) if stat.len() as i64 == meta.size => {
                    self.apply_meta(&meta);
                    self.exists = true;
                    return Ok(());
                }
                _ => {
                    debug!("stale LOM cache entry for {}, reloading", key);
                    shard.remove(&key);
                }
            }
        }

        self.load_meta_from_fs()?;
        if add_to_cache {
            self.recache();
        }
        Ok(())
    }

    /// Forces a fresh read of the file stats and the metadata record,
    /// bypassing the cache.
    pub fn load_meta_from_fs(&mut self) -> StoreResult<()> {
        self.from_fs()?;
        let meta = read_lom_xattr(&self.fqn)?;
        self.cksum = meta.cksum;
        self.version = meta.version;
        self.copy_fqn = meta.copy_fqn;
        Ok(())
    }

    /// Stat-only refresh of size and access time; used for content (slices,
    /// workfiles) that carries no metadata record.
    pub fn from_fs(&mut self) -> StoreResult<()> {
        let stat = std::fs::metadata(&self.fqn)
            .map_err(|e| StoreError::NotFound(format!("stat {}: {}", self.fqn, e)))?;
        self.size = stat.len() as i64;
        self.atime_ns = stat
            .accessed()
            .or_else(|_| stat.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.exists = true;
        Ok(())
    }

    /// Marshals (version, checksum, copy-FQN list) and writes it as a single
    /// extended attribute.
    pub fn persist(&self) -> StoreResult<()> {
        let meta = LomXattr {
            cksum: self.cksum.clone(),
            version: self.version.clone(),
            copy_fqn: self.copy_fqn.clone(),
        };
        write_lom_xattr(&self.fqn, &meta)
    }

    /// Recomputes the payload checksum and compares it with the stored one.
    pub async fn validate_checksum(&self) -> StoreResult<()> {
        let Some(stored) = &self.cksum else {
            return Ok(());
        };
        let computed = file_checksum(&self.fqn, stored.ty).await?;
        match computed {
            Some(c) if c == *stored => Ok(()),
            Some(c) => Err(StoreError::BadChecksum(format!(
                "{}: stored {} != computed {}",
                self.fqn, stored, c
            ))),
            None => Ok(()),
        }
    }

    pub fn has_copies(&self) -> bool {
        !self.copy_fqn.is_empty()
    }

    pub fn copy_fqn(&self) -> &[String] {
        &self.copy_fqn
    }

    pub fn add_xcopy(&mut self, fqn: impl Into<String>) {
        let fqn = fqn.into();
        if !self.copy_fqn.contains(&fqn) {
            self.copy_fqn.push(fqn);
        }
    }

    pub fn set_copy_fqn(&mut self, fqns: Vec<String>) {
        self.copy_fqn = fqns;
    }

    /// A LOM for the same object at a different FQN (a local mirror copy).
    pub fn clone_to(&self, fqn: &str, csm: &ContentSpecMgr) -> StoreResult<Lom> {
        let mut lom = Lom::init(fqn, csm)?;
        lom.size = self.size;
        lom.atime_ns = self.atime_ns;
        lom.cksum = self.cksum.clone();
        lom.version = self.version.clone();
        lom.exists = self.exists;
        Ok(lom)
    }

    /// Inserts or refreshes this LOM's cache entry.
    pub fn recache(&self) {
        let shard = self.parsed.mpath.lom_cache(self.cache_idx());
        shard.insert(self.uname(), Arc::new(self.snapshot()));
    }

    /// Drops this LOM's cache entry.
    pub fn uncache(&self) {
        let shard = self.parsed.mpath.lom_cache(self.cache_idx());
        shard.remove(&self.uname());
    }

    fn snapshot(&self) -> LomMeta {
        LomMeta {
            size: self.size,
            atime_ns: self.atime_ns,
            cksum: self.cksum.clone(),
            version: self.version.clone(),
            copy_fqn: self.copy_fqn.clone(),
        }
    }

    fn apply_meta(&mut self, meta: &LomMeta) {
        self.size = meta.size;
        self.atime_ns = meta.atime_ns;
        self.cksum = meta.cksum.clone();
        self.version = meta.version.clone();
        self.copy_fqn = meta.copy_fqn.clone();
    }
}

impl std::fmt::Display for Lom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lom[{}/{} fqn={}]", self.bucket, self.objname, self.fqn)
    }
}
