use crate::{drain_body, BodyReader, ObjectAttrs};
use log::error;
use ostore_lib::{Checksum, ChecksumType, StoreError, StoreResult, TimeoutGroup};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWrite;

pub type SliceSink = Box<dyn AsyncWrite + Send + Unpin>;

/// One registered writer waiting for a slice, replica, or metadata body
/// from a remote target.
pub struct SliceWriter {
    sink: tokio::sync::Mutex<Option<SliceSink>>,
    pub wg: Arc<TimeoutGroup>,
    cksum: Mutex<Option<Checksum>>,
    version: Mutex<Option<String>>,
    written: AtomicI64,
    exists: AtomicBool,
}

impl SliceWriter {
    pub fn new(sink: SliceSink) -> Arc<Self> {
        let wg = Arc::new(TimeoutGroup::new());
        wg.add(1);
        Arc::new(Self {
            sink: tokio::sync::Mutex::new(Some(sink)),
            wg,
            cksum: Mutex::new(None),
            version: Mutex::new(None),
            written: AtomicI64::new(0),
            exists: AtomicBool::new(false),
        })
    }

    pub fn written(&self) -> i64 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    pub fn cksum(&self) -> Option<Checksum> {
        self.cksum.lock().unwrap().clone()
    }

    pub fn version(&self) -> Option<String> {
        self.version.lock().unwrap().clone()
    }
}

/// Process-wide map of pending writers keyed by
/// `uname = daemon-id|bucket|object`.
pub struct SliceRegistry {
    slices: Mutex<HashMap<String, Arc<SliceWriter>>>,
}

impl SliceRegistry {
    pub fn new() -> Self {
        Self {
            slices: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a writer; refuses a second registration under the same
    /// uname.
    pub fn reg_writer(&self, uname: &str, writer: Arc<SliceWriter>) -> bool {
        let mut slices = self.slices.lock().unwrap();
        if slices.contains_key(uname) {
            error!("writer for {} is already registered", uname);
            return false;
        }
        slices.insert(uname.to_string(), writer);
        true
    }

    pub fn unreg_writer(&self, uname: &str) -> Option<Arc<SliceWriter>> {
        let mut slices = self.slices.lock().unwrap();
        slices.remove(uname)
    }

    pub fn get(&self, uname: &str) -> Option<Arc<SliceWriter>> {
        let slices = self.slices.lock().unwrap();
        slices.get(uname).cloned()
    }

    /// Feeds a response body into the registered writer, stamps checksum and
    /// version from the object attributes, and signals the wait-group. An
    /// `exists = false` response is drained and signalled without touching
    /// the sink; the caller learns the remote had nothing.
    pub async fn writer_receive(
        &self,
        writer: &SliceWriter,
        exists: bool,
        attrs: &ObjectAttrs,
        body: BodyReader,
    ) -> StoreResult<()> {
        if !exists {
            // drain to keep the stream healthy, then release the waiter
            let _ = drain_body(body).await;
            writer.wg.done();
            return Err(StoreError::NotFound("remote object does not exist".to_string()));
        }

        let result = async {
            let mut guard = writer.sink.lock().await;
            let sink = guard
                .as_mut()
                .ok_or_else(|| StoreError::InvalidState("slice sink already consumed".to_string()))?;
            let mut body = body;
            let n = tokio::io::copy(&mut body, sink)
                .await
                .map_err(|e| StoreError::Io(format!("receive slice: {}", e)))?;
            use tokio::io::AsyncWriteExt;
            sink.shutdown()
                .await
                .map_err(|e| StoreError::Io(format!("flush slice: {}", e)))?;
            writer.written.store(n as i64, Ordering::SeqCst);
            Ok(())
        }
        .await;

        if result.is_ok() {
            if !attrs.cksum_type.is_empty() {
                if let Ok(ty) = ChecksumType::parse(&attrs.cksum_type) {
                    *writer.cksum.lock().unwrap() =
                        Some(Checksum::new(ty, attrs.cksum_value.clone()));
                }
            }
            if !attrs.version.is_empty() {
                *writer.version.lock().unwrap() = Some(attrs.version.clone());
            }
            writer.exists.store(true, Ordering::SeqCst);
        }
        writer.wg.done();
        result
    }
}

impl Default for SliceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
