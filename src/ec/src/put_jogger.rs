use crate::{
    ensure_parent, EcAction, EcMetadata, EcRequest, Slicer, XactPut, REQUEST_BUF_SIZE_FS,
};
use log::{debug, error};
use ostore_lib::{hrw_peers, StoreError, StoreResult, XactDemandBase};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{ObjectAttrs, SendBody};

/// Per-mountpath worker of the Put xaction: encodes and deletes objects
/// whose primary replica lives on its mountpath.
pub struct PutJogger {
    tx: mpsc::Sender<EcRequest>,
    stop: CancellationToken,
    _task: JoinHandle<()>,
}

impl PutJogger {
    pub fn spawn(parent: Arc<XactPut>, mpath: &str) -> Self {
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
                        let result = match req.action {
                            EcAction::Split => encode(&parent, &mut req).await,
                            EcAction::Delete => cleanup(&parent, &mut req).await,
                            EcAction::Restore => Err(StoreError::InvalidParam(
                                "restore routed to a put jogger".to_string(),
                            )),
                        };
                        if let Err(e) = &result {
                            parent
                                .base
                                .stats
                                .error_count
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            error!("ec put jogger {}: {} failed: {}", mpath, req.lom.uname(), e);
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
                mpsc::error::TrySendError::Full(req) => {
                    let mut req = req;
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

/// Split/encode pipeline: read the primary, produce data+parity slices,
/// stream them (with metadata riding in the opaque header) to HRW-selected
/// peers, persist the local metadata record, and finally persist the LOM.
async fn encode(parent: &Arc<XactPut>, req: &mut EcRequest) -> StoreResult<()> {
    let base = &parent.base;
    let ec = &parent.ec_conf;
    let lom = &mut req.lom;
    let obj_uname = lom.uname();

    let smap = base.smap.get();
    let peers = hrw_peers(&obj_uname, &smap, &base.si.daemon_id);
    if peers.is_empty() {
        return Err(StoreError::InsufficientTargets {
            actual: smap.count_targets(),
            required: ec.required_encode_targets(),
        });
    }

    let meta = EcMetadata {
        size: lom.size,
        data_slices: ec.data_slices,
        parity_slices: ec.parity_slices,
        slice_id: 0,
        obj_cksum: lom.cksum.as_ref().map(|c| c.value.clone()),
        obj_version: lom.version.clone(),
        is_copy: req.is_copy,
    };

    // the local metadata record lands on the deterministic slice mountpath
    let meta_fqn = base.meta_fqn(&lom.bucket, &lom.objname)?;
    let meta_json = serde_json::to_vec(&meta)
        .map_err(|e| StoreError::Internal(format!("marshal slice meta: {}", e)))?;
    ensure_parent(&meta_fqn)?;
    std::fs::write(&meta_fqn, &meta_json)
        .map_err(|e| StoreError::Io(format!("write {}: {}", meta_fqn, e)))?;

    let attrs = ObjectAttrs {
        size: lom.size,
        version: lom.version.clone().unwrap_or_default(),
        atime_ns: lom.atime_ns,
        cksum_type: lom
            .cksum
            .as_ref()
            .map(|c| c.ty.as_str().to_string())
            .unwrap_or_default(),
        cksum_value: lom.cksum.as_ref().map(|c| c.value.clone()).unwrap_or_default(),
    };

    if req.is_copy {
        // small object: full replicas to `parity` peers instead of slices
        let n = ec.parity_slices.min(peers.len());
        let dests: Vec<String> = peers[..n].iter().map(|p| p.daemon_id.clone()).collect();
        base.write_remote(
            &dests,
            &lom.bucket,
            &lom.objname,
            SendBody::File(lom.fqn.clone().into()),
            attrs,
            Some(meta),
            false,
            None,
        )
        .await?;
    } else {
        let payload = tokio::fs::read(&lom.fqn)
            .await
            .map_err(|e| StoreError::Io(format!("read {}: {}", lom.fqn, e)))?;
        let slicer = Slicer::new(ec.data_slices, ec.parity_slices)?;
        let slice_size = slicer.slice_size(payload.len());
        let shards = slicer.encode(&payload)?;

        for (i, shard) in shards.into_iter().enumerate() {
            let dest = &peers[i % peers.len()];
            let slice_meta = EcMetadata {
                slice_id: i + 1,
                ..meta.clone()
            };
            let slice_attrs = ObjectAttrs {
                size: slice_size as i64,
                ..attrs.clone()
            };
            base.write_remote(
                &[dest.daemon_id.clone()],
                &lom.bucket,
                &lom.objname,
                SendBody::Bytes(Arc::new(shard)),
                slice_attrs,
                Some(slice_meta),
                true,
                None,
            )
            .await?;
        }

        // one standalone metadata replica on the next spare peer; an empty
        // body marks a metadata-only put. With no peer to spare, every
        // slice already travels with its own metadata record.
        if let Some(meta_dest) = peers.get(ec.data_slices + ec.parity_slices) {
            base.write_remote(
                &[meta_dest.daemon_id.clone()],
                &lom.bucket,
                &lom.objname,
                SendBody::None,
                ObjectAttrs::default(),
                Some(meta),
                false,
                None,
            )
            .await?;
        }
    }

    lom.persist()?;
    lom.recache();
    debug!("ec encode of {} complete", obj_uname);
    Ok(())
}

/// Removes local slices and metadata and asks every peer to do the same.
async fn cleanup(parent: &Arc<XactPut>, req: &mut EcRequest) -> StoreResult<()> {
    let base = &parent.base;
    let lom = &req.lom;
    let obj_uname = lom.uname();

    for fqn in [
        base.slice_fqn(&lom.bucket, &lom.objname)?,
        base.meta_fqn(&lom.bucket, &lom.objname)?,
    ] {
        if let Err(e) = std::fs::remove_file(&fqn) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StoreError::Io(format!("remove {}: {}", fqn, e)));
            }
        }
    }

    let smap = base.smap.get();
    let peers = hrw_peers(&obj_uname, &smap, &base.si.daemon_id);
    if peers.is_empty() {
        return Ok(());
    }
    let ireq = base.new_intra_req(crate::IntraAct::Del, None);
    let hdr = transport::Header {
        bucket: lom.bucket.clone(),
        objname: lom.objname.clone(),
        opaque: ireq.marshal()?,
        obj_attrs: ObjectAttrs::default(),
    };
    let dests: Vec<String> = peers.iter().map(|p| p.daemon_id.clone()).collect();
    // best-effort: peers without slices simply ignore the request
    base.req_bundle
        .send_by_daemon_id(&dests, hdr, SendBody::None, None)
        .await
}
