use crate::{BodyReader, Header};
use async_trait::async_trait;
use dashmap::DashMap;
use ostore_lib::{StoreError, StoreResult};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Receive side of one stream. A handler gets the header and the body
/// reader and must fully drain the body even when it decides the message is
/// bad.
#[async_trait]
pub trait ReceiveHandler: Send + Sync {
    async fn on_receive(&self, hdr: Header, body: BodyReader) -> StoreResult<()>;
}

/// Registry of per-bundle receive handlers keyed by stream name.
pub struct Receiver {
    handlers: DashMap<String, Arc<dyn ReceiveHandler>>,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, trname: &str, handler: Arc<dyn ReceiveHandler>) -> StoreResult<()> {
        if self.handlers.contains_key(trname) {
            return Err(StoreError::AlreadyExists(format!(
                "stream {} already has a handler",
                trname
            )));
        }
        self.handlers.insert(trname.to_string(), handler);
        Ok(())
    }

    pub async fn dispatch(&self, trname: &str, hdr: Header, body: BodyReader) -> StoreResult<()> {
        let handler = self
            .handlers
            .get(trname)
            .map(|h| h.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("no handler for stream {}", trname)))?;
        handler.on_receive(hdr, body).await
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the body to completion and discards it.
pub async fn drain_body(mut body: BodyReader) -> StoreResult<u64> {
    let mut sink = tokio::io::sink();
    let n = tokio::io::copy(&mut body, &mut sink)
        .await
        .map_err(|e| StoreError::Io(format!("drain body: {}", e)))?;
    Ok(n)
}

/// Reads the whole body into memory; for small control messages only.
pub async fn read_body(mut body: BodyReader) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    body.read_to_end(&mut buf)
        .await
        .map_err(|e| StoreError::Io(format!("read body: {}", e)))?;
    Ok(buf)
}
