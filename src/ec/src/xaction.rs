use crate::{ControlMsg, EcMetadata, EcRequest, IntraAct, IntraReq, ECMETA_TYPE, ECSLICE_TYPE};
use log::warn;
use mountfs::{read_lom_xattr, ContentSpecMgr, MountpathInfo, OBJECT_TYPE};
use ostore_lib::{SmapOwner, Snode, StoreError, StoreResult, XactDemandBase};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use transport::{Header, ObjectAttrs, SendBody, SendCallback, SliceRegistry, StreamBundle};

const MPATH_QUEUE_DEPTH: usize = 8;
const CONTROL_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub enum MpathEvent {
    Add(String),
    Remove(String),
}

/// Running EC counters, rendered on the periodic stats tick.
#[derive(Default)]
pub struct EcStats {
    pub encode_count: AtomicU64,
    pub encode_bytes: AtomicU64,
    pub decode_count: AtomicU64,
    pub delete_count: AtomicU64,
    pub error_count: AtomicU64,
}

impl EcStats {
    pub fn describe(&self, bucket: &str) -> String {
        format!(
            "ec[{}]: encoded {} ({}B), restored {}, deleted {}, errors {}",
            bucket,
            self.encode_count.load(Ordering::Relaxed),
            self.encode_bytes.load(Ordering::Relaxed),
            self.decode_count.load(Ordering::Relaxed),
            self.delete_count.load(Ordering::Relaxed),
            self.error_count.load(Ordering::Relaxed),
        )
    }
}

/// State shared by the three per-bucket EC xactions: identity, cluster
/// views, the two stream bundles, and the pending-writer registry.
pub struct XactEcBase {
    pub demand: XactDemandBase,
    pub bck_name: String,
    pub smap: Arc<SmapOwner>,
    pub si: Snode,
    pub csm: Arc<ContentSpecMgr>,
    pub slices: Arc<SliceRegistry>,
    pub req_bundle: Arc<StreamBundle>,
    pub resp_bundle: Arc<StreamBundle>,
    pub send_file_timeout: Duration,
    pub stats: EcStats,
}

impl XactEcBase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        kind: &'static str,
        bck_name: String,
        smap: Arc<SmapOwner>,
        si: Snode,
        csm: Arc<ContentSpecMgr>,
        slices: Arc<SliceRegistry>,
        req_bundle: Arc<StreamBundle>,
        resp_bundle: Arc<StreamBundle>,
        send_file_timeout: Duration,
    ) -> Self {
        // EC xactions idle out after three full send-file timeouts
        let demand = XactDemandBase::with_idle(id, kind, bck_name.clone(), true, send_file_timeout * 3);
        Self {
            demand,
            bck_name,
            smap,
            si,
            csm,
            slices,
            req_bundle,
            resp_bundle,
            send_file_timeout,
            stats: EcStats::default(),
        }
    }

    /// A request descriptor stamped with the local daemon id; `exists`
    /// starts true and is flipped when the local file turns out to be
    /// unreadable or missing.
    pub fn new_intra_req(&self, act: IntraAct, meta: Option<EcMetadata>) -> IntraReq {
        IntraReq {
            act,
            sender: self.si.daemon_id.clone(),
            meta,
            exists: true,
            is_slice: false,
        }
    }

    /// The deterministic mountpath owning this object's EC content locally.
    pub fn slice_mpath(&self, uname: &str) -> StoreResult<Arc<MountpathInfo>> {
        self.csm.mfs().hrw_mpath(uname)
    }

    /// Finds the object file on any available mountpath.
    pub fn find_object_fqn(&self, bucket: &str, objname: &str) -> Option<String> {
        let (available, _) = self.csm.mfs().get();
        for mp in available.values() {
            let fqn = self.csm.fqn(mp, OBJECT_TYPE, true, bucket, objname);
            if Path::new(&fqn).is_file() {
                return Some(fqn);
            }
        }
        None
    }

    pub fn slice_fqn(&self, bucket: &str, objname: &str) -> StoreResult<String> {
        let uname = ostore_lib::uname(bucket, objname);
        let mp = self.slice_mpath(&uname)?;
        Ok(self.csm.fqn(&mp, ECSLICE_TYPE, true, bucket, objname))
    }

    pub fn meta_fqn(&self, bucket: &str, objname: &str) -> StoreResult<String> {
        let uname = ostore_lib::uname(bucket, objname);
        let mp = self.slice_mpath(&uname)?;
        Ok(self.csm.fqn(&mp, ECMETA_TYPE, true, bucket, objname))
    }

    /// Sends local content (a slice, replica, or metadata record) back to
    /// the requesting target. A missing or empty file turns into an
    /// `exists = false` response with no body.
    pub async fn data_response(
        &self,
        fqn: &str,
        bucket: &str,
        objname: &str,
        meta: Option<EcMetadata>,
        is_slice: bool,
        to_daemon: &str,
    ) -> StoreResult<()> {
        let mut ireq = self.new_intra_req(IntraAct::Resp, meta);
        ireq.is_slice = is_slice;

        let (body, attrs) = match std::fs::metadata(fqn) {
            Ok(stat) if stat.len() > 0 => {
                let mut attrs = ObjectAttrs {
                    size: stat.len() as i64,
                    ..Default::default()
                };
                // objects carry their record; slices and metafiles do not
                if let Ok(meta) = read_lom_xattr(fqn) {
                    if let Some(cksum) = meta.cksum {
                        attrs.cksum_type = cksum.ty.as_str().to_string();
                        attrs.cksum_value = cksum.value;
                    }
                    attrs.version = meta.version.unwrap_or_default();
                }
                (SendBody::File(fqn.into()), attrs)
            }
            _ => {
                ireq.exists = false;
                (SendBody::None, ObjectAttrs::default())
            }
        };

        let hdr = Header {
            bucket: bucket.to_string(),
            objname: objname.to_string(),
            opaque: ireq.marshal()?,
            obj_attrs: attrs,
        };
        self.resp_bundle
            .send_by_daemon_id(&[to_daemon.to_string()], hdr, body, None)
            .await
    }

    /// Ships a slice/replica/metadata body to the given targets over the
    /// response bundle.
    pub async fn write_remote(
        &self,
        daemon_ids: &[String],
        bucket: &str,
        objname: &str,
        body: SendBody,
        attrs: ObjectAttrs,
        meta: Option<EcMetadata>,
        is_slice: bool,
        cb: Option<SendCallback>,
    ) -> StoreResult<()> {
        let mut ireq = self.new_intra_req(IntraAct::Put, meta);
        ireq.is_slice = is_slice;
        let hdr = Header {
            bucket: bucket.to_string(),
            objname: objname.to_string(),
            opaque: ireq.marshal()?,
            obj_attrs: attrs,
        };
        self.resp_bundle
            .send_by_daemon_id(daemon_ids, hdr, body, cb)
            .await
    }

    /// Key of the pending writer waiting for `uname` content from a given
    /// peer.
    pub fn writer_key(&self, sender: &str, uname: &str) -> String {
        format!("{}|{}", sender, uname)
    }
}

/// Request-side plumbing shared by the Put and Get xactions: the work,
/// control, and mountpath-event channels plus the reject flag.
pub struct ReqBase {
    pub ec_tx: mpsc::Sender<EcRequest>,
    pub ec_rx: Mutex<Option<mpsc::Receiver<EcRequest>>>,
    pub mpath_tx: mpsc::Sender<MpathEvent>,
    pub mpath_rx: Mutex<Option<mpsc::Receiver<MpathEvent>>>,
    pub control_tx: mpsc::Sender<ControlMsg>,
    pub control_rx: Mutex<Option<mpsc::Receiver<ControlMsg>>>,
    reject: AtomicBool,
}

impl ReqBase {
    pub fn new(request_buf: usize) -> Self {
        let (ec_tx, ec_rx) = mpsc::channel(request_buf);
        let (mpath_tx, mpath_rx) = mpsc::channel(MPATH_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        Self {
            ec_tx,
            ec_rx: Mutex::new(Some(ec_rx)),
            mpath_tx,
            mpath_rx: Mutex::new(Some(mpath_rx)),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            reject: AtomicBool::new(false),
        }
    }

    /// Disables receiving new EC requests and drains the pending ones with
    /// an error. Re-enabling must be requested explicitly when EC is turned
    /// back on.
    pub async fn clear_requests(&self) {
        let _ = self.control_tx.send(ControlMsg::ClearRequests).await;
    }

    pub async fn enable_requests(&self) {
        let _ = self.control_tx.send(ControlMsg::EnableRequests).await;
    }

    pub fn set_requests_disabled(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn set_requests_enabled(&self) {
        self.reject.store(false, Ordering::SeqCst);
    }

    pub fn requests_enabled(&self) -> bool {
        !self.reject.load(Ordering::SeqCst)
    }

    pub fn req_add_mountpath(&self, mpath: &str) {
        if self.mpath_tx.try_send(MpathEvent::Add(mpath.to_string())).is_err() {
            warn!("mountpath event queue is full, dropping add of {}", mpath);
        }
    }

    pub fn req_remove_mountpath(&self, mpath: &str) {
        if self
            .mpath_tx
            .try_send(MpathEvent::Remove(mpath.to_string()))
            .is_err()
        {
            warn!("mountpath event queue is full, dropping remove of {}", mpath);
        }
    }

    /// Fails one request on its reply channel, when it has one.
    pub fn fail_request(&self, mut req: EcRequest, why: &str) {
        req.resolve(Err(StoreError::EcDisabled(why.to_string())));
    }
}

/// Jogger index for a request: the jogger owning the primary's mountpath.
pub fn jogger_key(req: &EcRequest) -> String {
    req.lom.parsed.mpath.path.clone()
}

/// Shorthand used by both get and put joggers.
pub fn ensure_parent(fqn: &str) -> StoreResult<()> {
    if let Some(parent) = Path::new(fqn).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Io(format!("create {}: {}", parent.display(), e)))?;
    }
    Ok(())
}
