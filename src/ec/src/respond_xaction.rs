use crate::{
    ensure_parent, EcMetadata, IntraAct, IntraReq, XactEcBase, XACT_EC_RESPOND_KIND,
};
use log::{debug, error, info, warn};
use mountfs::{write_lom_xattr, LomXattr, OBJECT_TYPE, WORKFILE_EC, WORKFILE_TYPE};
use ostore_lib::{next_xact_id, Checksum, ChecksumType, SmapOwner, Snode, StoreError, StoreResult, Xact};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use transport::{BodyReader, ObjectAttrs, SliceRegistry, StreamBundle};

/// Serves peers: answers slice/replica/metadata requests and stores the
/// content other targets push during encode. This xaction keeps running
/// even when the cluster shrinks below the encode or restore requirements.
pub struct XactRespond {
    pub base: XactEcBase,
}

impl XactRespond {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bck_name: &str,
        smap: Arc<SmapOwner>,
        si: Snode,
        csm: Arc<mountfs::ContentSpecMgr>,
        slices: Arc<SliceRegistry>,
        req_bundle: Arc<StreamBundle>,
        resp_bundle: Arc<StreamBundle>,
        send_file_timeout: Duration,
    ) -> Arc<Self> {
        let base = XactEcBase::new(
            next_xact_id(),
            XACT_EC_RESPOND_KIND,
            bck_name.to_string(),
            smap,
            si,
            csm,
            slices,
            req_bundle,
            resp_bundle,
            send_file_timeout,
        );
        Arc::new(Self { base })
    }

    pub fn xact(&self) -> &dyn Xact {
        &self.base.demand
    }

    /// Idle/abort bookkeeping only; the work arrives through dispatch.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!("starting {}", this.base.demand.describe());
            let abort = this.base.demand.abort_token();
            let mut idle_tick = this.base.demand.idle_ticker();
            loop {
                tokio::select! {
                    _ = abort.cancelled() => {
                        this.stop();
                        return;
                    }
                    _ = idle_tick.tick() => {
                        if this.base.demand.timeout() {
                            debug!("{}: idle time is over", this.base.demand.describe());
                            this.stop();
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        if !self.base.demand.finished() {
            self.base.demand.base().set_end_time();
        }
    }

    /// Handles a lightweight peer request from the request bundle.
    pub async fn dispatch_req(&self, ireq: IntraReq, bucket: &str, objname: &str) {
        self.base.demand.renew();
        self.base.demand.inc_pending();
        let result = match ireq.act {
            IntraAct::Get => self.respond_content(&ireq, bucket, objname).await,
            IntraAct::Meta => self.respond_meta(&ireq, bucket, objname).await,
            IntraAct::Del => self.delete_local(bucket, objname).await,
            other => {
                warn!("unexpected request action {:?} on the request stream", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.base
                .stats
                .error_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            error!(
                "respond[{}]: {:?} for {}/{} failed: {}",
                self.base.bck_name, ireq.act, bucket, objname, e
            );
        }
        self.base.demand.dec_pending();
    }

    /// Stores a slice, replica, or metadata record pushed by a peer over
    /// the response bundle.
    pub async fn dispatch_resp(
        &self,
        ireq: IntraReq,
        bucket: &str,
        objname: &str,
        attrs: ObjectAttrs,
        body: BodyReader,
    ) {
        self.base.demand.renew();
        self.base.demand.inc_pending();
        let result = self.store_content(&ireq, bucket, objname, &attrs, body).await;
        if let Err(e) = result {
            self.base
                .stats
                .error_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            error!(
                "respond[{}]: storing {}/{} failed: {}",
                self.base.bck_name, bucket, objname, e
            );
        }
        self.base.demand.dec_pending();
    }

    /// Returns the local slice when one exists, the full object otherwise.
    async fn respond_content(&self, ireq: &IntraReq, bucket: &str, objname: &str) -> StoreResult<()> {
        let slice_fqn = self.base.slice_fqn(bucket, objname)?;
        let meta = self.read_meta(bucket, objname);
        if std::path::Path::new(&slice_fqn).is_file() {
            return self
                .base
                .data_response(&slice_fqn, bucket, objname, meta, true, &ireq.sender)
                .await;
        }
        let obj_fqn = self
            .base
            .find_object_fqn(bucket, objname)
            .unwrap_or_else(|| slice_fqn.clone());
        self.base
            .data_response(&obj_fqn, bucket, objname, meta, false, &ireq.sender)
            .await
    }

    async fn respond_meta(&self, ireq: &IntraReq, bucket: &str, objname: &str) -> StoreResult<()> {
        let meta_fqn = self.base.meta_fqn(bucket, objname)?;
        let meta = self.read_meta(bucket, objname);
        self.base
            .data_response(&meta_fqn, bucket, objname, meta, false, &ireq.sender)
            .await
    }

    /// Removes whatever EC content this target holds for the object.
    async fn delete_local(&self, bucket: &str, objname: &str) -> StoreResult<()> {
        let meta = self.read_meta(bucket, objname);
        if meta.as_ref().map(|m| m.is_copy).unwrap_or(false) {
            if let Some(obj_fqn) = self.base.find_object_fqn(bucket, objname) {
                remove_quiet(&obj_fqn)?;
            }
        }
        remove_quiet(&self.base.slice_fqn(bucket, objname)?)?;
        remove_quiet(&self.base.meta_fqn(bucket, objname)?)?;
        Ok(())
    }

    async fn store_content(
        &self,
        ireq: &IntraReq,
        bucket: &str,
        objname: &str,
        attrs: &ObjectAttrs,
        mut body: BodyReader,
    ) -> StoreResult<()> {
        if ireq.act != IntraAct::Put {
            // command requests should not ride the response stream; drain
            // the body to keep the stream healthy
            let _ = transport::drain_body(body).await;
            return Err(StoreError::InvalidParam(format!(
                "unexpected action {:?} on the response stream",
                ireq.act
            )));
        }

        // an empty-bodied put carries only the metadata record
        if attrs.size == 0 && !ireq.is_slice {
            let _ = transport::drain_body(body).await;
            return self.write_meta(bucket, objname, ireq.meta.as_ref());
        }

        let final_fqn = if ireq.is_slice {
            self.base.slice_fqn(bucket, objname)?
        } else {
            let uname = ostore_lib::uname(bucket, objname);
            let mp = self.base.slice_mpath(&uname)?;
            self.base.csm.fqn(&mp, OBJECT_TYPE, true, bucket, objname)
        };

        // stream into a workfile, then rename into place
        let parsed = {
            let uname = ostore_lib::uname(bucket, objname);
            let mp = self.base.slice_mpath(&uname)?;
            mountfs::ParsedFqn {
                mpath: mp,
                content_type: OBJECT_TYPE.to_string(),
                bck_is_local: true,
                bucket: bucket.to_string(),
                objname: objname.to_string(),
            }
        };
        let work_fqn = self
            .base
            .csm
            .gen_content_fqn(&parsed, WORKFILE_TYPE, WORKFILE_EC)?;
        ensure_parent(&work_fqn)?;
        let mut file = tokio::fs::File::create(&work_fqn)
            .await
            .map_err(|e| StoreError::Io(format!("create {}: {}", work_fqn, e)))?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| StoreError::Io(format!("receive {}: {}", work_fqn, e)))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Io(format!("flush {}: {}", work_fqn, e)))?;
        drop(file);

        ensure_parent(&final_fqn)?;
        if let Err(e) = tokio::fs::rename(&work_fqn, &final_fqn).await {
            let _ = tokio::fs::remove_file(&work_fqn).await;
            return Err(StoreError::Io(format!(
                "rename {} -> {}: {}",
                work_fqn, final_fqn, e
            )));
        }

        // replicas keep a metadata record in their xattr like any object
        if !ireq.is_slice {
            let cksum = if attrs.cksum_type.is_empty() {
                None
            } else {
                ChecksumType::parse(&attrs.cksum_type)
                    .ok()
                    .map(|ty| Checksum::new(ty, attrs.cksum_value.clone()))
            };
            let record = LomXattr {
                cksum,
                version: if attrs.version.is_empty() {
                    None
                } else {
                    Some(attrs.version.clone())
                },
                copy_fqn: Vec::new(),
            };
            write_lom_xattr(&final_fqn, &record)?;
        }
        self.write_meta(bucket, objname, ireq.meta.as_ref())
    }

    fn write_meta(&self, bucket: &str, objname: &str, meta: Option<&EcMetadata>) -> StoreResult<()> {
        let Some(meta) = meta else {
            return Err(StoreError::InvalidParam(format!(
                "{}/{}: put without slice metadata",
                bucket, objname
            )));
        };
        let meta_fqn = self.base.meta_fqn(bucket, objname)?;
        let json = serde_json::to_vec(meta)
            .map_err(|e| StoreError::Internal(format!("marshal slice meta: {}", e)))?;
        ensure_parent(&meta_fqn)?;
        std::fs::write(&meta_fqn, json).map_err(|e| StoreError::Io(format!("write {}: {}", meta_fqn, e)))
    }

    fn read_meta(&self, bucket: &str, objname: &str) -> Option<EcMetadata> {
        let meta_fqn = self.base.meta_fqn(bucket, objname).ok()?;
        let raw = std::fs::read(&meta_fqn).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

fn remove_quiet(fqn: &str) -> StoreResult<()> {
    match std::fs::remove_file(fqn) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(format!("remove {}: {}", fqn, e))),
    }
}
