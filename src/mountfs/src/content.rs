use crate::{MountedFs, MountpathInfo, CLOUD_BS, LOCAL_BS, OBJECT_TYPE, WORKFILE_TYPE};
use once_cell::sync::Lazy;
use ostore_lib::{StoreError, StoreResult};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

// Workfile tie-breakers must be collision-free within the lifetime of a
// write; a monotonic counter folded with a process-random salt is enough.
static TIE_SALT: Lazy<u64> = Lazy::new(|| rand::rng().next_u64());
static TIE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_tie() -> u16 {
    let n = TIE_COUNTER.fetch_add(1, Ordering::Relaxed);
    ((n ^ *TIE_SALT) & 0xffff) as u16
}

/// Per-content-type naming rules.
pub trait ContentResolver: Send + Sync {
    /// Whether files of this type survive restarts (objects do, workfiles
    /// do not).
    fn permanent(&self) -> bool;

    /// Turns an object name into this content type's on-disk name.
    fn gen_unique_name(&self, objname: &str, role: &str, tie: u16) -> String;

    /// Recovers the object name from an on-disk name.
    fn parse_unique_name(&self, name: &str) -> StoreResult<String>;
}

pub struct ObjectContentResolver;

impl ContentResolver for ObjectContentResolver {
    fn permanent(&self) -> bool {
        true
    }

    fn gen_unique_name(&self, objname: &str, _role: &str, _tie: u16) -> String {
        objname.to_string()
    }

    fn parse_unique_name(&self, name: &str) -> StoreResult<String> {
        Ok(name.to_string())
    }
}

/// Workfile names carry a 16-bit hex tie-breaker and a role tag so that two
/// concurrent writers of the same object cannot collide.
pub struct WorkfileContentResolver;

impl ContentResolver for WorkfileContentResolver {
    fn permanent(&self) -> bool {
        false
    }

    fn gen_unique_name(&self, objname: &str, role: &str, tie: u16) -> String {
        format!("{}.{:04x}.{}", objname, tie, role)
    }

    fn parse_unique_name(&self, name: &str) -> StoreResult<String> {
        let mut parts = name.rsplitn(3, '.');
        let _role = parts.next();
        let tie = parts.next();
        let base = parts.next();
        match (base, tie) {
            (Some(base), Some(tie)) if tie.len() == 4 && u16::from_str_radix(tie, 16).is_ok() => {
                Ok(base.to_string())
            }
            _ => Err(StoreError::InvalidParam(format!(
                "malformed workfile name: {}",
                name
            ))),
        }
    }
}

/// FQN parsed into its constituents.
#[derive(Clone)]
pub struct ParsedFqn {
    pub mpath: Arc<MountpathInfo>,
    pub content_type: String,
    pub bck_is_local: bool,
    pub bucket: String,
    pub objname: String,
}

/// Registry of content types and the FQN scheme
/// `<mountpath>/<content-type>/{local|cloud}/<bucket>/<object-name>`.
pub struct ContentSpecMgr {
    mfs: Arc<MountedFs>,
    resolvers: RwLock<HashMap<String, Arc<dyn ContentResolver>>>,
}

impl ContentSpecMgr {
    pub fn new(mfs: Arc<MountedFs>) -> Self {
        Self {
            mfs,
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the built-in object and workfile types.
    pub fn with_defaults(mfs: Arc<MountedFs>) -> Self {
        let csm = Self::new(mfs);
        csm.register(OBJECT_TYPE, Arc::new(ObjectContentResolver))
            .expect("fresh registry");
        csm.register(WORKFILE_TYPE, Arc::new(WorkfileContentResolver))
            .expect("fresh registry");
        csm
    }

    pub fn mfs(&self) -> &Arc<MountedFs> {
        &self.mfs
    }

    pub fn register(&self, content_type: &str, resolver: Arc<dyn ContentResolver>) -> StoreResult<()> {
        let mut resolvers = self.resolvers.write().unwrap();
        if resolvers.contains_key(content_type) {
            return Err(StoreError::AlreadyExists(format!(
                "content type {} already registered",
                content_type
            )));
        }
        resolvers.insert(content_type.to_string(), resolver);
        Ok(())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let resolvers = self.resolvers.read().unwrap();
        let mut types: Vec<String> = resolvers.keys().cloned().collect();
        types.sort();
        types
    }

    /// The canonical FQN for an object of the given content type.
    pub fn fqn(
        &self,
        mp: &MountpathInfo,
        content_type: &str,
        bck_is_local: bool,
        bucket: &str,
        objname: &str,
    ) -> String {
        mp.make_path_bucket_object(content_type, bucket, objname, bck_is_local)
            .to_string_lossy()
            .to_string()
    }

    /// A fresh workfile-style FQN derived from a parsed object FQN; the
    /// tie-breaker comes from the process-wide counter.
    pub fn gen_content_fqn(
        &self,
        parsed: &ParsedFqn,
        content_type: &str,
        role: &str,
    ) -> StoreResult<String> {
        let resolvers = self.resolvers.read().unwrap();
        let resolver = resolvers.get(content_type).ok_or_else(|| {
            StoreError::InvalidParam(format!("unknown content type: {}", content_type))
        })?;
        let name = resolver.gen_unique_name(&parsed.objname, role, next_tie());
        Ok(self.fqn(
            &parsed.mpath,
            content_type,
            parsed.bck_is_local,
            &parsed.bucket,
            &name,
        ))
    }

    /// Parses a well-formed FQN back into (mountpath, content-type,
    /// locality, bucket, object).
    pub fn parse_fqn(&self, fqn: &str) -> StoreResult<ParsedFqn> {
        let mp = self
            .mfs
            .mpath_for_fqn(fqn)
            .ok_or_else(|| StoreError::InvalidParam(format!("fqn {} is not on any mountpath", fqn)))?;

        let rel = &fqn[mp.path.len() + 1..];
        let mut parts = rel.splitn(4, '/');
        let content_type = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::InvalidParam(format!("fqn {} lacks a content type", fqn)))?;
        let locality = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::InvalidParam(format!("fqn {} lacks a locality", fqn)))?;
        let bucket = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::InvalidParam(format!("fqn {} lacks a bucket", fqn)))?;
        let objname = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::InvalidParam(format!("fqn {} lacks an object name", fqn)))?;

        {
            let resolvers = self.resolvers.read().unwrap();
            if !resolvers.contains_key(content_type) {
                return Err(StoreError::InvalidParam(format!(
                    "fqn {} has unknown content type {}",
                    fqn, content_type
                )));
            }
        }
        let bck_is_local = match locality {
            LOCAL_BS => true,
            CLOUD_BS => false,
            other => {
                return Err(StoreError::InvalidParam(format!(
                    "fqn {} has unknown bucket locality {}",
                    fqn, other
                )))
            }
        };

        Ok(ParsedFqn {
            mpath: mp,
            content_type: content_type.to_string(),
            bck_is_local,
            bucket: bucket.to_string(),
            objname: objname.to_string(),
        })
    }
}
