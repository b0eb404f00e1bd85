use crate::fspathrgrp::FsPathRunGroup;
use async_trait::async_trait;
use ec::{
    BckXacts, EcAction, EcRecvRequest, EcRecvResponse, EcRequest, EcXactResolver, XactGet, XactPut,
    XactRespond, ECMETA_TYPE, ECSLICE_TYPE, REQ_STREAM_NAME, RESP_STREAM_NAME,
};
use log::{error, info, warn};
use mirror::XactCopy;
use mountfs::{
    ContentSpecMgr, Lom, MountedFs, ObjectContentResolver, PathRunner, OBJECT_TYPE, WORKFILE_PUT,
    WORKFILE_TYPE,
};
use ostore_lib::{
    file_checksum, uname, BmdOwner, BucketMd, ChecksumType, Config, ConfigOwner, EcConf, Smap,
    SmapOwner, Snode, StoreError, StoreResult, Xact,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{
    Header, PeerTransport, Receiver, SliceRegistry, StreamBundle, INTRA_BUNDLE_MULTIPLIER,
};

/// Local capacity ceiling; encoding is refused above it.
const FS_OOS_PCT_USED: f64 = 98.0;

/// Owns the per-bucket EC xaction triples, the two stream bundles (brought
/// up lazily on first EC-enabled bucket), and the reactions to cluster-map
/// and bucket-metadata changes.
pub struct EcManager {
    smap: Arc<SmapOwner>,
    bmd: Arc<BmdOwner>,
    config: Arc<ConfigOwner>,
    csm: Arc<ContentSpecMgr>,
    si: Snode,
    target_cnt: AtomicUsize,
    xacts: Mutex<HashMap<String, BckXacts>>,
    bundles: Mutex<Option<(Arc<StreamBundle>, Arc<StreamBundle>)>>,
    transport: Arc<dyn PeerTransport>,
    slices: Arc<SliceRegistry>,
    last_bmd: Mutex<Arc<BucketMd>>,
}

impl EcManager {
    pub fn new(
        si: Snode,
        smap: Arc<SmapOwner>,
        bmd: Arc<BmdOwner>,
        config: Arc<ConfigOwner>,
        csm: Arc<ContentSpecMgr>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let target_cnt = smap.get().count_targets();
        let last_bmd = bmd.get();
        let mgr = Arc::new(Self {
            smap,
            bmd,
            config,
            csm,
            si,
            target_cnt: AtomicUsize::new(target_cnt),
            xacts: Mutex::new(HashMap::new()),
            bundles: Mutex::new(None),
            transport,
            slices: Arc::new(SliceRegistry::new()),
            last_bmd: Mutex::new(last_bmd.clone()),
        });

        if last_bmd.ec_used() {
            mgr.ensure_bundles();
        }
        mgr
    }

    /// Registers the EC receive handlers on the target's stream registry.
    pub fn register_streams(self: &Arc<Self>, receiver: &Receiver) -> StoreResult<()> {
        let resolver: Arc<dyn EcXactResolver> = self.clone();
        receiver.register(REQ_STREAM_NAME, EcRecvRequest::new(resolver.clone()))?;
        receiver.register(RESP_STREAM_NAME, EcRecvResponse::new(resolver))?;
        Ok(())
    }

    pub fn target_cnt(&self) -> usize {
        self.target_cnt.load(Ordering::SeqCst)
    }

    fn bucket_ec(&self, bucket: &str) -> EcConf {
        self.bmd
            .get()
            .props(bucket)
            .map(|p| p.ec.clone())
            .unwrap_or_default()
    }

    /// Brings the request/response bundles up exactly once; they are never
    /// torn down while the target runs (the xactions close themselves on
    /// idle instead).
    fn ensure_bundles(&self) -> (Arc<StreamBundle>, Arc<StreamBundle>) {
        let mut bundles = self.bundles.lock().unwrap();
        if let Some((req, resp)) = bundles.as_ref() {
            return (req.clone(), resp.clone());
        }
        let cb: transport::SendCallback = Arc::new(|hdr: &Header, err| {
            if let Some(err) = err {
                error!("failed to send {}/{}: {}", hdr.bucket, hdr.objname, err);
            }
        });
        let req = Arc::new(StreamBundle::new(
            REQ_STREAM_NAME,
            self.smap.clone(),
            self.si.daemon_id.clone(),
            self.transport.clone(),
            INTRA_BUNDLE_MULTIPLIER,
            Some(cb),
        ));
        let resp = Arc::new(StreamBundle::new(
            RESP_STREAM_NAME,
            self.smap.clone(),
            self.si.daemon_id.clone(),
            self.transport.clone(),
            INTRA_BUNDLE_MULTIPLIER,
            None,
        ));
        *bundles = Some((req.clone(), resp.clone()));
        info!("EC stream bundles initialized");
        (req, resp)
    }

    pub fn restore_bck_put_xact(&self, bucket: &str) -> Arc<XactPut> {
        let (req_b, resp_b) = self.ensure_bundles();
        let mut xacts = self.xacts.lock().unwrap();
        let entry = xacts.entry(bucket.to_string()).or_default();
        if let Some(xact) = entry.put() {
            if !xact.xact().finished() {
                return xact.clone();
            }
        }
        let conf = self.config.get();
        let xact = XactPut::new(
            bucket,
            self.bucket_ec(bucket),
            self.smap.clone(),
            self.si.clone(),
            self.csm.clone(),
            self.slices.clone(),
            req_b,
            resp_b,
            conf.timeout.send_file(),
            conf.periodic.stats_time(),
        );
        let _ = xact.run();
        entry.set_put(xact.clone());
        xact
    }

    pub fn restore_bck_get_xact(&self, bucket: &str) -> Arc<XactGet> {
        let (req_b, resp_b) = self.ensure_bundles();
        let mut xacts = self.xacts.lock().unwrap();
        let entry = xacts.entry(bucket.to_string()).or_default();
        if let Some(xact) = entry.get() {
            if !xact.xact().finished() {
                return xact.clone();
            }
        }
        let conf = self.config.get();
        let xact = XactGet::new(
            bucket,
            self.bucket_ec(bucket),
            self.smap.clone(),
            self.si.clone(),
            self.csm.clone(),
            self.slices.clone(),
            req_b,
            resp_b,
            conf.timeout.send_file(),
        );
        let _ = xact.run();
        entry.set_get(xact.clone());
        xact
    }

    pub fn restore_bck_resp_xact(&self, bucket: &str) -> Arc<XactRespond> {
        let (req_b, resp_b) = self.ensure_bundles();
        let mut xacts = self.xacts.lock().unwrap();
        let entry = xacts.entry(bucket.to_string()).or_default();
        if let Some(xact) = entry.respond() {
            if !xact.xact().finished() {
                return xact.clone();
            }
        }
        let conf = self.config.get();
        let xact = XactRespond::new(
            bucket,
            self.smap.clone(),
            self.si.clone(),
            self.csm.clone(),
            self.slices.clone(),
            req_b,
            resp_b,
            conf.timeout.send_file(),
        );
        let _ = xact.run();
        entry.set_respond(xact.clone());
        xact
    }

    /// Schedules erasure coding of a just-written object. Small objects are
    /// replicated instead; encoding proper requires
    /// `data + parity + 1` live targets.
    pub async fn encode_object(&self, mut lom: Lom) -> StoreResult<()> {
        let bmd = self.bmd.get();
        let props = bmd
            .props(&lom.bucket)
            .ok_or_else(|| StoreError::NotFound(format!("bucket {} not found", lom.bucket)))?;
        if !props.ec.enabled {
            return Err(StoreError::EcDisabled(lom.bucket.clone()));
        }
        let fs_info = self.csm.mfs().fetch_fs_info();
        if fs_info.capacity > 0 && fs_info.pct_used > FS_OOS_PCT_USED {
            return Err(StoreError::OutOfSpace(format!(
                "{:.1}% of local capacity used",
                fs_info.pct_used
            )));
        }
        let is_copy = props.ec.is_ec_copy(lom.size);
        let target_cnt = self.target_cnt();
        // tradeoff: replicating a small object may need just one extra
        // target, so the copy path is not gated on the full requirement
        if !is_copy {
            let required = props.ec.required_encode_targets();
            if target_cnt < required {
                warn!(
                    "not enough targets to encode the object; actual: {}, required: {}",
                    target_cnt, required
                );
                return Err(StoreError::InsufficientTargets {
                    actual: target_cnt,
                    required,
                });
            }
        }
        lom.load(true)?;
        self.restore_bck_put_xact(&lom.bucket)
            .encode(EcRequest::new(EcAction::Split, lom, is_copy))
            .await;
        Ok(())
    }

    /// Restores a lost object from peer slices/replicas and waits for the
    /// result.
    pub async fn restore_object(&self, lom: Lom) -> StoreResult<()> {
        let bmd = self.bmd.get();
        let props = bmd
            .props(&lom.bucket)
            .ok_or_else(|| StoreError::NotFound(format!("bucket {} not found", lom.bucket)))?;
        if !props.ec.enabled {
            return Err(StoreError::EcDisabled(lom.bucket.clone()));
        }
        let target_cnt = self.target_cnt();
        let required = props.ec.required_restore_targets();
        if target_cnt < required {
            warn!(
                "not enough targets to restore the object; actual: {}, required: {}",
                target_cnt, required
            );
            return Err(StoreError::InsufficientTargets {
                actual: target_cnt,
                required,
            });
        }
        let (req, rx) = EcRequest::new(EcAction::Restore, lom, false).with_reply();
        self.restore_bck_get_xact(&req.lom.bucket.clone())
            .decode(req)
            .await;
        rx.await
            .map_err(|_| StoreError::Aborted("restore request dropped".to_string()))?
    }

    /// Removes all slices and replicas after the main object is deleted.
    pub async fn cleanup_object(&self, lom: Lom) {
        let bmd = self.bmd.get();
        let enabled = bmd.props(&lom.bucket).map(|p| p.ec.enabled).unwrap_or(false);
        if !enabled {
            return;
        }
        self.restore_bck_put_xact(&lom.bucket.clone())
            .cleanup(EcRequest::new(EcAction::Delete, lom, false))
            .await;
    }

    /// Starts rejecting new EC requests for the bucket and fails the
    /// pending ones.
    pub async fn disable_bck(&self, bucket: &str) {
        self.restore_bck_get_xact(bucket).req.clear_requests().await;
        self.restore_bck_put_xact(bucket).req.clear_requests().await;
    }

    /// Re-arms request acceptance; uses the same channel as disable so the
    /// two are applied in arrival order.
    pub async fn enable_bck(&self, bucket: &str) {
        self.restore_bck_get_xact(bucket).req.enable_requests().await;
        self.restore_bck_put_xact(bucket).req.enable_requests().await;
    }

    /// Reacts to a bucket-metadata version change: first-ever EC enable
    /// initializes the bundles; per-bucket flips enable or disable the
    /// request flow.
    pub async fn bucket_md_changed(&self) {
        let new_bmd = self.bmd.get();
        let old_bmd = {
            let mut last = self.last_bmd.lock().unwrap();
            if new_bmd.version <= last.version {
                return;
            }
            std::mem::replace(&mut *last, new_bmd.clone())
        };

        // streams stay up once created: idle xactions close themselves
        if new_bmd.ec_used() && !old_bmd.ec_used() {
            self.ensure_bundles();
        }

        for (bucket, new_props) in &new_bmd.lbmap {
            if let Some(old_props) = old_bmd.lbmap.get(bucket) {
                if !old_props.ec.enabled && new_props.ec.enabled {
                    self.enable_bck(bucket).await;
                } else if old_props.ec.enabled && !new_props.ec.enabled {
                    self.disable_bck(bucket).await;
                }
            }
        }
    }

    /// Follows cluster-map versions: stops the per-bucket Put/Get xactions
    /// that can no longer be satisfied by the shrunken cluster. Respond
    /// xactions keep answering peers no matter what.
    pub fn listen_smap_changed(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let mut version_rx = self.smap.listen();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        let xacts = this.xacts.lock().unwrap();
                        for bck in xacts.values() {
                            bck.stop_get();
                            bck.stop_put();
                        }
                        return;
                    }
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let smap = this.smap.get();
                        let target_cnt = smap.count_targets();
                        this.target_cnt.store(target_cnt, Ordering::SeqCst);

                        let bmd = this.bmd.get();
                        let xacts = this.xacts.lock().unwrap();
                        for (bucket, props) in &bmd.lbmap {
                            if !props.ec.enabled {
                                continue;
                            }
                            let Some(bck) = xacts.get(bucket) else { continue };
                            if target_cnt < props.ec.required_encode_targets() {
                                warn!(
                                    "not enough targets for EC encoding for bucket {}; actual: {}, expected: {}",
                                    bucket, target_cnt, props.ec.required_encode_targets()
                                );
                                bck.stop_put();
                            }
                            if target_cnt < props.ec.required_restore_targets() {
                                warn!(
                                    "not enough targets for EC restoring for bucket {}; actual: {}, expected: {}",
                                    bucket, target_cnt, props.ec.required_restore_targets()
                                );
                                bck.stop_get();
                            }
                        }
                    }
                }
            }
        })
    }

    /// Forwards a mountpath event to every live per-bucket xaction.
    fn broadcast_mpath<F: Fn(&dyn PathRunner)>(&self, f: F) {
        let xacts = self.xacts.lock().unwrap();
        for bck in xacts.values() {
            if let Some(put) = bck.put() {
                f(put.as_ref());
            }
            if let Some(get) = bck.get() {
                f(get.as_ref());
            }
        }
    }
}

impl PathRunner for EcManager {
    fn req_add_mountpath(&self, mpath: &str) {
        self.broadcast_mpath(|r| r.req_add_mountpath(mpath));
    }

    fn req_remove_mountpath(&self, mpath: &str) {
        self.broadcast_mpath(|r| r.req_remove_mountpath(mpath));
    }

    fn req_enable_mountpath(&self, mpath: &str) {
        self.broadcast_mpath(|r| r.req_enable_mountpath(mpath));
    }

    fn req_disable_mountpath(&self, mpath: &str) {
        self.broadcast_mpath(|r| r.req_disable_mountpath(mpath));
    }
}

#[async_trait]
impl EcXactResolver for EcManager {
    async fn respond_xact(&self, bucket: &str) -> Option<Arc<XactRespond>> {
        Some(self.restore_bck_resp_xact(bucket))
    }

    async fn get_xact(&self, bucket: &str) -> Option<Arc<XactGet>> {
        Some(self.restore_bck_get_xact(bucket))
    }
}

/// The per-bucket mirror xactions as one path-runner, so mountpath events
/// reach every live copier.
struct MirrorGroup {
    xacts: Mutex<HashMap<String, Arc<XactCopy>>>,
}

impl MirrorGroup {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            xacts: Mutex::new(HashMap::new()),
        })
    }

    fn snapshot(&self) -> Vec<Arc<XactCopy>> {
        self.xacts.lock().unwrap().values().cloned().collect()
    }
}

impl PathRunner for MirrorGroup {
    fn req_add_mountpath(&self, mpath: &str) {
        for xact in self.snapshot() {
            xact.req_add_mountpath(mpath);
        }
    }

    fn req_remove_mountpath(&self, mpath: &str) {
        for xact in self.snapshot() {
            xact.req_remove_mountpath(mpath);
        }
    }

    fn req_enable_mountpath(&self, mpath: &str) {
        for xact in self.snapshot() {
            xact.req_enable_mountpath(mpath);
        }
    }

    fn req_disable_mountpath(&self, mpath: &str) {
        for xact in self.snapshot() {
            xact.req_disable_mountpath(mpath);
        }
    }
}

/// The per-target coordinator: wires the mountpath manager, content
/// registry, disk-utilization sampler, mirror engine, and the EC manager
/// together, and runs the object write/read/delete paths that everything
/// else hangs off.
pub struct Target {
    pub si: Snode,
    pub config: Arc<ConfigOwner>,
    pub smap: Arc<SmapOwner>,
    pub bmd: Arc<BmdOwner>,
    pub mfs: Arc<MountedFs>,
    pub csm: Arc<ContentSpecMgr>,
    pub receiver: Arc<Receiver>,
    pub ecm: Arc<EcManager>,
    pub fsprg: Arc<FsPathRunGroup>,
    mirrors: Arc<MirrorGroup>,
    runner_ids: Vec<u64>,
    stop: CancellationToken,
}

impl Target {
    pub fn new(
        daemon_id: &str,
        config: Config,
        smap: Smap,
        mut bmd: BucketMd,
        transport: Arc<dyn PeerTransport>,
    ) -> StoreResult<Arc<Self>> {
        config.validate()?;
        let si = Snode::new(daemon_id);
        let mfs = Arc::new(MountedFs::new());

        if config.test_fspaths.in_use() {
            // co-located virtual mountpaths share one filesystem
            mfs.disable_fsid_check();
            let base = Path::new(&config.test_fspaths.root)
                .join(format!("{}", config.test_fspaths.instance));
            let mut fspaths = Vec::with_capacity(config.test_fspaths.count);
            for i in 0..config.test_fspaths.count {
                let mpath = base.join(format!("mp{}", i + 1));
                std::fs::create_dir_all(&mpath)
                    .map_err(|e| StoreError::Io(format!("create {}: {}", mpath.display(), e)))?;
                fspaths.push(mpath.to_string_lossy().to_string());
            }
            mfs.init(&fspaths)?;
        } else {
            mfs.init(&config.fspaths)?;
        }

        let csm = Arc::new(ContentSpecMgr::with_defaults(mfs.clone()));
        csm.register(ECSLICE_TYPE, Arc::new(ObjectContentResolver))?;
        csm.register(ECMETA_TYPE, Arc::new(ObjectContentResolver))?;

        // pick up the last persisted bucket-metadata snapshot until the
        // gossip collaborator delivers a fresher view
        if bmd.version == 0 {
            if let Some(snapshot) = Self::load_bmd_snapshot(&mfs) {
                info!("loaded bucket-metadata snapshot v{}", snapshot.version);
                bmd = snapshot;
            }
        }

        let stop = CancellationToken::new();
        let config = Arc::new(ConfigOwner::new(config));
        let _ = mfs.iostat.run(&config.get().disk, stop.clone());

        let smap = Arc::new(SmapOwner::new(smap));
        let bmd = Arc::new(BmdOwner::new(bmd));
        let receiver = Arc::new(Receiver::new());

        let ecm = EcManager::new(
            si.clone(),
            smap.clone(),
            bmd.clone(),
            config.clone(),
            csm.clone(),
            transport,
        );
        ecm.register_streams(&receiver)?;
        let _ = ecm.listen_smap_changed(stop.clone());

        let fsprg = Arc::new(FsPathRunGroup::new());
        let mirrors = MirrorGroup::new();
        let runner_ids = vec![fsprg.reg(ecm.clone()), fsprg.reg(mirrors.clone())];

        let target = Arc::new(Self {
            si,
            config,
            smap,
            bmd,
            mfs,
            csm,
            receiver,
            ecm,
            fsprg,
            mirrors,
            runner_ids,
            stop,
        });
        target.listen_bmd_changed();
        info!("target {} is up:\n{}", target.si.daemon_id, target.mfs.describe());
        Ok(target)
    }

    fn listen_bmd_changed(self: &Arc<Self>) {
        let this = self.clone();
        let mut version_rx = self.bmd.listen();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        this.ecm.bucket_md_changed().await;
                        Self::persist_bmd_snapshot(&this.mfs, &this.bmd.get());
                    }
                }
            }
        });
    }

    /// The write path: land the bytes on the HRW mountpath through a
    /// workfile, persist the LOM, then hand the object to the mirror and EC
    /// engines per the bucket configuration.
    pub async fn put_object(&self, bucket: &str, objname: &str, data: &[u8]) -> StoreResult<Lom> {
        let bmd = self.bmd.get();
        let props = bmd
            .props(bucket)
            .ok_or_else(|| StoreError::NotFound(format!("bucket {} not found", bucket)))?
            .clone();

        let obj_uname = uname(bucket, objname);
        let mp = self.mfs.hrw_mpath(&obj_uname)?;
        let fqn = self.csm.fqn(&mp, OBJECT_TYPE, true, bucket, objname);

        // carry the version over when overwriting
        let next_version = {
            let mut prev = Lom::init(&fqn, &self.csm)?;
            match prev.load(false) {
                Ok(()) => prev
                    .version
                    .as_deref()
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|v| (v + 1).to_string())
                    .unwrap_or_else(|| "1".to_string()),
                Err(_) => "1".to_string(),
            }
        };

        let parsed = self.csm.parse_fqn(&fqn)?;
        let work_fqn = self.csm.gen_content_fqn(&parsed, WORKFILE_TYPE, WORKFILE_PUT)?;
        if let Some(parent) = Path::new(&work_fqn).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&work_fqn, data)
            .await
            .map_err(|e| StoreError::Io(format!("write {}: {}", work_fqn, e)))?;
        if let Some(parent) = Path::new(&fqn).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("create {}: {}", parent.display(), e)))?;
        }
        if let Err(e) = tokio::fs::rename(&work_fqn, &fqn).await {
            let _ = tokio::fs::remove_file(&work_fqn).await;
            return Err(StoreError::Io(format!("rename {} -> {}: {}", work_fqn, fqn, e)));
        }

        let mut lom = Lom::init(&fqn, &self.csm)?;
        lom.from_fs()?;
        lom.cksum = file_checksum(&fqn, ChecksumType::XXHash).await?;
        lom.version = Some(next_version);
        lom.persist()?;
        lom.recache();

        if props.mirror.enabled {
            self.mirror_xact(bucket, &props.mirror).copy(lom.clone())?;
        }
        if props.ec.enabled {
            self.ecm.encode_object(lom.clone()).await?;
        }
        Ok(lom)
    }

    /// The read path: serve from whichever mountpath holds a replica; with
    /// EC enabled, a lost object is restored from peers first.
    pub async fn get_object(&self, bucket: &str, objname: &str) -> StoreResult<Vec<u8>> {
        if let Some(fqn) = self.find_object(bucket, objname) {
            return tokio::fs::read(&fqn)
                .await
                .map_err(|e| StoreError::Io(format!("read {}: {}", fqn, e)));
        }

        let bmd = self.bmd.get();
        let ec_enabled = bmd.props(bucket).map(|p| p.ec.enabled).unwrap_or(false);
        if !ec_enabled {
            return Err(StoreError::NotFound(format!("{}/{}", bucket, objname)));
        }

        let obj_uname = uname(bucket, objname);
        let mp = self.mfs.hrw_mpath(&obj_uname)?;
        let fqn = self.csm.fqn(&mp, OBJECT_TYPE, true, bucket, objname);
        let lom = Lom::init(&fqn, &self.csm)?;
        self.ecm.restore_object(lom).await?;
        tokio::fs::read(&fqn)
            .await
            .map_err(|e| StoreError::Io(format!("read restored {}: {}", fqn, e)))
    }

    /// The delete path: drop the object and its cache entry, then fan the
    /// cleanup out to the mirror copies and EC slices.
    pub async fn delete_object(&self, bucket: &str, objname: &str) -> StoreResult<()> {
        let fqn = self
            .find_object(bucket, objname)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", bucket, objname)))?;
        let mut lom = Lom::init(&fqn, &self.csm)?;
        if lom.load(false).is_ok() {
            for copy_fqn in lom.copy_fqn().to_vec() {
                if let Err(e) = tokio::fs::remove_file(&copy_fqn).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to remove copy {}: {}", copy_fqn, e);
                    }
                }
            }
        }
        lom.uncache();
        tokio::fs::remove_file(&fqn)
            .await
            .map_err(|e| StoreError::Io(format!("remove {}: {}", fqn, e)))?;
        self.ecm.cleanup_object(lom).await;
        Ok(())
    }

    pub fn add_mountpath(&self, mpath: &str) -> StoreResult<()> {
        self.fsprg.add_mountpath(&self.mfs, mpath)?;
        // pre-create the per-bucket directory trees on the new mountpath
        let bmd = self.bmd.get();
        let types = self.csm.registered_types();
        let types: Vec<&str> = types.iter().map(|s| s.as_str()).collect();
        for bucket in bmd.lbmap.keys() {
            self.mfs.create_bucket_dirs(&types, bucket, true)?;
        }
        Ok(())
    }

    pub fn remove_mountpath(&self, mpath: &str) -> StoreResult<()> {
        self.fsprg.remove_mountpath(&self.mfs, mpath)
    }

    pub fn enable_mountpath(&self, mpath: &str) -> (bool, bool) {
        self.fsprg.enable_mountpath(&self.mfs, mpath)
    }

    pub fn disable_mountpath(&self, mpath: &str) -> (bool, bool) {
        self.fsprg.disable_mountpath(&self.mfs, mpath)
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
        for id in &self.runner_ids {
            self.fsprg.unreg(*id);
        }
        for xact in self.mirrors.snapshot() {
            xact.xact().abort();
        }
    }

    fn load_bmd_snapshot(mfs: &MountedFs) -> Option<BucketMd> {
        let mp = mfs.mpath_for_xattr().ok()?;
        let raw = xattr::get(&mp.path, mountfs::XATTR_BMD).ok()??;
        serde_json::from_slice(&raw).ok()
    }

    fn persist_bmd_snapshot(mfs: &MountedFs, bmd: &BucketMd) {
        let mp = match mfs.mpath_for_xattr() {
            Ok(mp) => mp,
            Err(e) => {
                warn!("no mountpath to persist bucket metadata: {}", e);
                return;
            }
        };
        match serde_json::to_vec(bmd) {
            Ok(raw) => {
                if let Err(e) = xattr::set(&mp.path, mountfs::XATTR_BMD, &raw) {
                    warn!("failed to persist bucket metadata on {}: {}", mp.path, e);
                }
            }
            Err(e) => warn!("failed to marshal bucket metadata: {}", e),
        }
    }

    fn find_object(&self, bucket: &str, objname: &str) -> Option<String> {
        let (available, _) = self.mfs.get();
        for mp in available.values() {
            let fqn = self.csm.fqn(mp, OBJECT_TYPE, true, bucket, objname);
            if Path::new(&fqn).is_file() {
                return Some(fqn);
            }
        }
        None
    }

    fn mirror_xact(&self, bucket: &str, conf: &ostore_lib::MirrorConf) -> Arc<XactCopy> {
        let mut xacts = self.mirrors.xacts.lock().unwrap();
        if let Some(xact) = xacts.get(bucket) {
            if !xact.xact().finished() {
                return xact.clone();
            }
        }
        let xact = XactCopy::new(bucket, true, conf.clone(), self.mfs.clone(), self.csm.clone());
        let _ = xact.run();
        xacts.insert(bucket.to_string(), xact.clone());
        xact
    }
}
