use crate::{Header, SendBody, SendCallback};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{error, warn};
use ostore_lib::{SmapOwner, Snode, StoreError, StoreResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const STREAM_QUEUE_DEPTH: usize = 64;

/// One hop to one peer; implementations are HTTP in production and an
/// in-process hub in tests and single-node clusters.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn deliver(
        &self,
        node: &Snode,
        trname: &str,
        hdr: &Header,
        body: SendBody,
    ) -> StoreResult<()>;
}

struct SendUnit {
    hdr: Header,
    body: SendBody,
    cb: Option<SendCallback>,
}

struct PeerStreams {
    txs: Vec<mpsc::Sender<SendUnit>>,
    next: AtomicUsize,
    tasks: Vec<JoinHandle<()>>,
}

/// A fan-out of multiplexed connections to peer targets for one logical
/// stream. Peers are addressed by daemon id and resolved through the
/// current cluster map; every send may name several destinations.
pub struct StreamBundle {
    trname: String,
    smap: Arc<SmapOwner>,
    local_id: String,
    transport: Arc<dyn PeerTransport>,
    multiplier: usize,
    peers: DashMap<String, Arc<PeerStreams>>,
    /// Fallback callback when the caller does not supply one.
    extra_cb: Option<SendCallback>,
}

impl StreamBundle {
    pub fn new(
        trname: impl Into<String>,
        smap: Arc<SmapOwner>,
        local_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        multiplier: usize,
        extra_cb: Option<SendCallback>,
    ) -> Self {
        Self {
            trname: trname.into(),
            smap,
            local_id: local_id.into(),
            transport,
            multiplier: multiplier.max(1),
            peers: DashMap::new(),
            extra_cb,
        }
    }

    pub fn trname(&self) -> &str {
        &self.trname
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Sends the header (and body, when present) to each destination,
    /// invoking the completion callback once per destination.
    pub async fn send(
        &self,
        hdr: Header,
        body: SendBody,
        cb: Option<SendCallback>,
        nodes: &[Snode],
    ) -> StoreResult<()> {
        if nodes.is_empty() {
            return Err(StoreError::InvalidParam("destination list is empty".to_string()));
        }
        let cb = cb.or_else(|| self.extra_cb.clone());
        for node in nodes {
            let streams = self.peer_streams(node);
            let idx = streams.next.fetch_add(1, Ordering::Relaxed) % streams.txs.len();
            let unit = SendUnit {
                hdr: hdr.clone(),
                body: body.clone(),
                cb: cb.clone(),
            };
            streams.txs[idx]
                .send(unit)
                .await
                .map_err(|_| StoreError::Aborted(format!("stream to {} is closed", node.daemon_id)))?;
        }
        Ok(())
    }

    /// Resolves daemon ids through the cluster map and sends to those found;
    /// unknown ids are logged and skipped, and an empty resolution is an
    /// error.
    pub async fn send_by_daemon_id(
        &self,
        daemon_ids: &[String],
        hdr: Header,
        body: SendBody,
        cb: Option<SendCallback>,
    ) -> StoreResult<()> {
        let smap = self.smap.get();
        let mut nodes = Vec::with_capacity(daemon_ids.len());
        for id in daemon_ids {
            match smap.get_target(id) {
                Some(node) => nodes.push(node.clone()),
                None => error!("target with id {} not found", id),
            }
        }
        self.send(hdr, body, cb, &nodes).await
    }

    /// Stops the per-peer sender tasks. In-flight units are delivered;
    /// queued units are dropped.
    pub fn close(&self) {
        for entry in self.peers.iter() {
            for task in &entry.value().tasks {
                task.abort();
            }
        }
        self.peers.clear();
    }

    fn peer_streams(&self, node: &Snode) -> Arc<PeerStreams> {
        if let Some(streams) = self.peers.get(&node.daemon_id) {
            return streams.clone();
        }
        let mut txs = Vec::with_capacity(self.multiplier);
        let mut tasks = Vec::with_capacity(self.multiplier);
        for _ in 0..self.multiplier {
            let (tx, mut rx) = mpsc::channel::<SendUnit>(STREAM_QUEUE_DEPTH);
            let transport = self.transport.clone();
            let node = node.clone();
            let trname = self.trname.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(unit) = rx.recv().await {
                    let result = transport.deliver(&node, &trname, &unit.hdr, unit.body).await;
                    if let Err(err) = &result {
                        warn!(
                            "send {}/{} to {} failed: {}",
                            unit.hdr.bucket, unit.hdr.objname, node.daemon_id, err
                        );
                    }
                    if let Some(cb) = unit.cb {
                        cb(&unit.hdr, result.as_ref().err());
                    }
                }
            }));
            txs.push(tx);
        }
        let streams = Arc::new(PeerStreams {
            txs,
            next: AtomicUsize::new(0),
            tasks,
        });
        self.peers.insert(node.daemon_id.clone(), streams.clone());
        streams
    }
}

impl Drop for StreamBundle {
    fn drop(&mut self) {
        self.close();
    }
}
