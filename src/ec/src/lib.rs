mod get_jogger;
mod get_xaction;
mod put_jogger;
mod put_xaction;
mod recv;
mod respond_xaction;
mod slicer;
mod xaction;

pub use get_xaction::*;
pub use put_xaction::*;
pub use recv::*;
pub use respond_xaction::*;
pub use slicer::*;
pub use xaction::*;

#[cfg(test)]
mod ec_tests;

use mountfs::Lom;
use ostore_lib::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Stream names of the two EC bundles.
pub const REQ_STREAM_NAME: &str = "ec-req";
pub const RESP_STREAM_NAME: &str = "ec-resp";

/// Content types for erasure-coded slices and their metadata records.
pub const ECSLICE_TYPE: &str = "ecs";
pub const ECMETA_TYPE: &str = "ecm";

/// Request-channel capacities: per bucket and per mountpath jogger.
pub const REQUEST_BUF_SIZE_GLOBAL: usize = 140;
pub const REQUEST_BUF_SIZE_FS: usize = 70;

pub const XACT_EC_GET_KIND: &str = "ec-get";
pub const XACT_EC_PUT_KIND: &str = "ec-put";
pub const XACT_EC_RESPOND_KIND: &str = "ec-resp";

/// Intra-cluster EC message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntraAct {
    /// Request the slice/replica body.
    Get,
    /// Request the metadata record.
    Meta,
    /// Push a slice/replica (or, with an empty body, just the metadata
    /// record) for storage.
    Put,
    /// Reply to Get/Meta; routed to the requester's pending writer.
    Resp,
    /// Remove local slices of the object.
    Del,
}

/// Per-slice metadata accompanying every EC send and persisted beside every
/// slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcMetadata {
    /// Size of the whole object.
    pub size: i64,
    pub data_slices: usize,
    pub parity_slices: usize,
    /// 1-based slice index; 0 means a full replica.
    pub slice_id: usize,
    pub obj_cksum: Option<String>,
    pub obj_version: Option<String>,
    /// The object was small enough to be replicated rather than sliced.
    pub is_copy: bool,
}

/// The opaque request descriptor riding in every intra-target header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntraReq {
    pub act: IntraAct,
    pub sender: String,
    pub meta: Option<EcMetadata>,
    /// "The local object exists"; flipped to false when a respondent has
    /// nothing to return.
    pub exists: bool,
    pub is_slice: bool,
}

impl IntraReq {
    pub fn marshal(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Internal(format!("marshal intra req: {}", e)))
    }

    pub fn unmarshal(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::InvalidParam(format!("unmarshal intra req: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcAction {
    Split,
    Delete,
    Restore,
}

/// One unit of EC work, routed to the jogger owning the primary's
/// mountpath.
pub struct EcRequest {
    pub action: EcAction,
    pub lom: Lom,
    /// Replicate instead of slice (object below `ec.obj_size_limit`).
    pub is_copy: bool,
    /// Optional completion/error reply.
    pub done_tx: Option<oneshot::Sender<StoreResult<()>>>,
    pub enqueued_at: Option<std::time::Instant>,
    pub dispatched_at: Option<std::time::Instant>,
}

impl EcRequest {
    pub fn new(action: EcAction, lom: Lom, is_copy: bool) -> Self {
        Self {
            action,
            lom,
            is_copy,
            done_tx: None,
            enqueued_at: None,
            dispatched_at: None,
        }
    }

    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<StoreResult<()>>) {
        let (tx, rx) = oneshot::channel();
        self.done_tx = Some(tx);
        (self, rx)
    }

    pub fn resolve(&mut self, result: StoreResult<()>) {
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    EnableRequests,
    ClearRequests,
}

/// The per-bucket triple of EC xactions.
#[derive(Default)]
pub struct BckXacts {
    get: Option<Arc<XactGet>>,
    put: Option<Arc<XactPut>>,
    respond: Option<Arc<XactRespond>>,
}

impl BckXacts {
    pub fn get(&self) -> Option<&Arc<XactGet>> {
        self.get.as_ref()
    }

    pub fn put(&self) -> Option<&Arc<XactPut>> {
        self.put.as_ref()
    }

    pub fn respond(&self) -> Option<&Arc<XactRespond>> {
        self.respond.as_ref()
    }

    pub fn set_get(&mut self, xact: Arc<XactGet>) {
        self.get = Some(xact);
    }

    pub fn set_put(&mut self, xact: Arc<XactPut>) {
        self.put = Some(xact);
    }

    pub fn set_respond(&mut self, xact: Arc<XactRespond>) {
        self.respond = Some(xact);
    }

    pub fn stop_get(&self) {
        if let Some(xact) = &self.get {
            if !xact.xact().finished() {
                xact.stop();
            }
        }
    }

    pub fn stop_put(&self) {
        if let Some(xact) = &self.put {
            if !xact.xact().finished() {
                xact.stop();
            }
        }
    }
}

/// An in-memory slice sink readable after the wait-group fires.
#[derive(Clone)]
pub struct MemWriter(Arc<Mutex<Vec<u8>>>);

impl MemWriter {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().unwrap())
    }
}

impl Default for MemWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl tokio::io::AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
