use crate::{ensure_parent, EcRequest, IntraAct, MemWriter, Slicer, XactGet, REQUEST_BUF_SIZE_FS};
use log::{debug, error, warn};
use mountfs::{WORKFILE_EC, WORKFILE_TYPE};
use ostore_lib::{bytes_checksum, hrw_peers, Checksum, ChecksumType, StoreError, StoreResult, XactDemandBase};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{Header, ObjectAttrs, SendBody, SliceWriter};

/// Per-mountpath worker of the Get xaction: restores objects whose primary
/// location is on its mountpath.
pub struct GetJogger {
    tx: mpsc::Sender<EcRequest>,
    stop: CancellationToken,
    _task: JoinHandle<()>,
}

impl GetJogger {
    pub fn spawn(parent: Arc<XactGet>, mpath: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<EcRequest>(REQUEST_BUF_SIZE_FS);
        let stop = CancellationToken::new();
        let stop_rx = stop.clone();
        let mpath = mpath.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.cancelled() => return,
                    req = rx.recv() => {
                        let Some(mut req) = req else { return };
                        req.dispatched_at = Some(std::time::Instant::now());
                        let result = restore(&parent, &mut req).await;
                        if let Err(e) = &result {
                            parent
                                .base
                                .stats
                                .error_count
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            error!("ec get jogger {}: {} failed: {}", mpath, req.lom.uname(), e);
                            if matches!(e, StoreError::Io(_)) {
                                parent.base.csm.mfs().report_io_error(&req.lom.fqn, e);
                            }
                        }
                        req.resolve(result);
                        parent.base.demand.dec_pending();
                    }
                }
            }
        });
        Self {
            tx,
            stop,
            _task: task,
        }
    }

    pub fn post(&self, req: EcRequest, demand: &XactDemandBase) {
        if let Err(e) = self.tx.try_send(req) {
            demand.dec_pending();
            match e {
                mpsc::error::TrySendError::Full(mut req) => {
                    req.resolve(Err(StoreError::InvalidState(
                        "EC jogger queue is full".to_string(),
                    )));
                }
                mpsc::error::TrySendError::Closed(mut req) => {
                    req.resolve(Err(StoreError::Aborted("EC jogger stopped".to_string())));
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

struct PendingSlice {
    daemon_id: String,
    key: String,
    buf: MemWriter,
    writer: Arc<SliceWriter>,
}

/// Restore pipeline: broadcast a content request, collect slices or a full
/// replica from whoever answers within the send-file timeout, rebuild, and
/// persist the object. On failure the LOM is left untouched.
pub async fn restore(parent: &Arc<XactGet>, req: &mut EcRequest) -> StoreResult<()> {
    let base = &parent.base;
    let ec = &parent.ec_conf;
    let lom = &mut req.lom;
    let obj_uname = lom.uname();

    let smap = base.smap.get();
    let peers = hrw_peers(&obj_uname, &smap, &base.si.daemon_id);
    if peers.is_empty() {
        return Err(StoreError::InsufficientTargets {
            actual: smap.count_targets(),
            required: ec.required_restore_targets(),
        });
    }

    // one pending writer per candidate holder
    let mut pending: Vec<PendingSlice> = Vec::with_capacity(peers.len());
    for peer in &peers {
        let key = base.writer_key(&peer.daemon_id, &obj_uname);
        let buf = MemWriter::new();
        let writer = SliceWriter::new(Box::new(buf.clone()));
        if !base.slices.reg_writer(&key, writer.clone()) {
            warn!("writer for {} is already registered, skipping peer", key);
            continue;
        }
        let ireq = base.new_intra_req(IntraAct::Get, None);
        let hdr = Header {
            bucket: lom.bucket.clone(),
            objname: lom.objname.clone(),
            opaque: ireq.marshal()?,
            obj_attrs: ObjectAttrs::default(),
        };
        if let Err(e) = base
            .req_bundle
            .send_by_daemon_id(&[peer.daemon_id.clone()], hdr, SendBody::None, None)
            .await
        {
            debug!("requesting {} from {} failed: {}", obj_uname, peer.daemon_id, e);
            base.slices.unreg_writer(&key);
            continue;
        }
        pending.push(PendingSlice {
            daemon_id: peer.daemon_id.clone(),
            key,
            buf,
            writer,
        });
    }
    if pending.is_empty() {
        return Err(StoreError::NotEnoughSlices(format!(
            "{}: no peer accepted the restore request",
            obj_uname
        )));
    }

    // bounded per-slice wait, each with its own full send-file budget;
    // late responses find no writer and are dropped
    for slice in &pending {
        if slice.writer.wg.wait_timeout(base.send_file_timeout).await {
            debug!("timed out waiting for {} from {}", obj_uname, slice.daemon_id);
        }
    }

    // collect what arrived
    let slicer = Slicer::new(ec.data_slices, ec.parity_slices)?;
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; slicer.total()];
    let mut replica: Option<Vec<u8>> = None;
    let mut obj_size: usize = 0;
    let mut obj_cksum: Option<String> = None;
    let mut obj_version: Option<String> = None;

    for slice in &pending {
        base.slices.unreg_writer(&slice.key);
        let meta = parent.resp_meta.remove(&slice.key).map(|(_, m)| m);
        if !slice.writer.exists() {
            continue;
        }
        let data = slice.buf.take();
        let Some(meta) = meta else {
            warn!("{} sent data without metadata, ignoring", slice.daemon_id);
            continue;
        };
        obj_size = meta.size.max(0) as usize;
        obj_cksum = obj_cksum.or(meta.obj_cksum.clone());
        obj_version = obj_version.or(meta.obj_version.clone());
        if meta.slice_id == 0 {
            replica = Some(data);
        } else if meta.slice_id <= slicer.total() && !data.is_empty() {
            shards[meta.slice_id - 1] = Some(data);
        }
    }

    let payload = match replica {
        Some(data) => data,
        None => slicer.reconstruct(shards, obj_size).map_err(|e| match e {
            StoreError::NotEnoughSlices(msg) => {
                StoreError::NotEnoughSlices(format!("{}: {}", obj_uname, msg))
            }
            other => other,
        })?,
    };

    // write through a workfile so the object appears atomically
    let work_fqn = base
        .csm
        .gen_content_fqn(&lom.parsed, WORKFILE_TYPE, WORKFILE_EC)?;
    ensure_parent(&work_fqn)?;
    tokio::fs::write(&work_fqn, &payload)
        .await
        .map_err(|e| StoreError::Io(format!("write {}: {}", work_fqn, e)))?;
    ensure_parent(&lom.fqn)?;
    if let Err(e) = tokio::fs::rename(&work_fqn, &lom.fqn).await {
        let _ = tokio::fs::remove_file(&work_fqn).await;
        return Err(StoreError::Io(format!(
            "rename {} -> {}: {}",
            work_fqn, lom.fqn, e
        )));
    }

    lom.from_fs()?;
    lom.version = obj_version;
    lom.cksum = match obj_cksum {
        Some(value) => Some(Checksum::new(ChecksumType::XXHash, value)),
        None => bytes_checksum(ChecksumType::XXHash, &payload),
    };
    lom.persist()?;
    lom.recache();
    debug!("restored {} from {} peers", obj_uname, pending.len());
    Ok(())
}
