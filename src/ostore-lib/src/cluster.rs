use crate::{EcConf, MirrorConf};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// One storage server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    pub daemon_id: String,
    /// Base URL for the lightweight intra-cluster request stream.
    pub intra_control_url: String,
    /// Base URL for the bulk intra-cluster data stream.
    pub intra_data_url: String,
}

impl Snode {
    pub fn new(daemon_id: impl Into<String>) -> Self {
        let daemon_id = daemon_id.into();
        Self {
            intra_control_url: format!("http://{}:9080", daemon_id),
            intra_data_url: format!("http://{}:9081", daemon_id),
            daemon_id,
        }
    }
}

/// Cluster map: a versioned view of all targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: i64,
    pub tmap: HashMap<String, Snode>,
}

impl Smap {
    pub fn count_targets(&self) -> usize {
        self.tmap.len()
    }

    pub fn get_target(&self, daemon_id: &str) -> Option<&Snode> {
        self.tmap.get(daemon_id)
    }
}

/// Owner of the cluster-map view. The map itself is swapped atomically;
/// version bumps are additionally broadcast so listeners can react.
pub struct SmapOwner {
    smap: ArcSwap<Smap>,
    version_tx: watch::Sender<i64>,
}

impl SmapOwner {
    pub fn new(smap: Smap) -> Self {
        let version = smap.version;
        let (version_tx, _) = watch::channel(version);
        Self {
            smap: ArcSwap::from_pointee(smap),
            version_tx,
        }
    }

    pub fn get(&self) -> Arc<Smap> {
        self.smap.load_full()
    }

    /// Installs a new cluster map if it is newer than the current one.
    /// Returns true when the map was accepted.
    pub fn put(&self, smap: Smap) -> bool {
        let current = self.smap.load();
        if smap.version <= current.version {
            return false;
        }
        let version = smap.version;
        self.smap.store(Arc::new(smap));
        let _ = self.version_tx.send(version);
        true
    }

    pub fn listen(&self) -> watch::Receiver<i64> {
        self.version_tx.subscribe()
    }
}

/// Per-bucket properties relevant to the data plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketProps {
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub ec: EcConf,
}

/// Bucket metadata: a versioned map of local buckets to their properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketMd {
    pub version: i64,
    pub lbmap: HashMap<String, BucketProps>,
}

impl BucketMd {
    pub fn is_local(&self, bucket: &str) -> bool {
        self.lbmap.contains_key(bucket)
    }

    pub fn props(&self, bucket: &str) -> Option<&BucketProps> {
        self.lbmap.get(bucket)
    }

    /// True when at least one bucket has erasure coding enabled.
    pub fn ec_used(&self) -> bool {
        self.lbmap.values().any(|p| p.ec.enabled)
    }
}

pub struct BmdOwner {
    bmd: ArcSwap<BucketMd>,
    version_tx: watch::Sender<i64>,
}

impl BmdOwner {
    pub fn new(bmd: BucketMd) -> Self {
        let version = bmd.version;
        let (version_tx, _) = watch::channel(version);
        Self {
            bmd: ArcSwap::from_pointee(bmd),
            version_tx,
        }
    }

    pub fn get(&self) -> Arc<BucketMd> {
        self.bmd.load_full()
    }

    pub fn put(&self, bmd: BucketMd) -> bool {
        let current = self.bmd.load();
        if bmd.version <= current.version {
            return false;
        }
        let version = bmd.version;
        self.bmd.store(Arc::new(bmd));
        let _ = self.version_tx.send(version);
        true
    }

    pub fn listen(&self) -> watch::Receiver<i64> {
        self.version_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smap_owner_rejects_stale_versions() {
        let mut smap = Smap::default();
        smap.version = 3;
        smap.tmap.insert("t1".to_string(), Snode::new("t1"));
        let owner = SmapOwner::new(smap);

        let mut stale = Smap::default();
        stale.version = 3;
        assert!(!owner.put(stale));
        assert_eq!(owner.get().count_targets(), 1);

        let mut newer = Smap::default();
        newer.version = 4;
        newer.tmap.insert("t1".to_string(), Snode::new("t1"));
        newer.tmap.insert("t2".to_string(), Snode::new("t2"));
        assert!(owner.put(newer));
        assert_eq!(owner.get().count_targets(), 2);
        assert_eq!(*owner.listen().borrow(), 4);
    }

    #[test]
    fn test_bmd_ec_used() {
        let mut bmd = BucketMd::default();
        bmd.lbmap.insert("plain".to_string(), BucketProps::default());
        assert!(!bmd.ec_used());

        let mut props = BucketProps::default();
        props.ec.enabled = true;
        bmd.lbmap.insert("coded".to_string(), props);
        assert!(bmd.ec_used());
        assert!(bmd.is_local("plain"));
        assert!(!bmd.is_local("missing"));
    }
}
