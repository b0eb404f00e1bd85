use crate::{Header, PeerTransport, SendBody};
use async_trait::async_trait;
use ostore_lib::{Snode, StoreError, StoreResult};
use tokio_util::io::ReaderStream;

/// Name of the HTTP header carrying the marshalled stream header.
pub const STREAM_HEADER_NAME: &str = "x-ostore-stream-header";

/// Production hop: one HTTP PUT per message to the peer's intra-cluster
/// endpoint, the stream header marshalled into a request header and the
/// body streamed as-is.
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(node: &Snode, trname: &str) -> String {
        format!("{}/v1/stream/{}", node.intra_data_url, trname)
    }
}

impl Default for HttpPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn deliver(
        &self,
        node: &Snode,
        trname: &str,
        hdr: &Header,
        body: SendBody,
    ) -> StoreResult<()> {
        let marshalled = serde_json::to_string(hdr)
            .map_err(|e| StoreError::Internal(format!("marshal stream header: {}", e)))?;
        let mut request = self
            .client
            .put(Self::url(node, trname))
            .header(STREAM_HEADER_NAME, marshalled);

        request = match body.open().await? {
            Some(reader) => request.body(reqwest::Body::wrap_stream(ReaderStream::new(reader))),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Io(format!("send to {}: {}", node.daemon_id, e)))?;
        if !response.status().is_success() {
            return Err(StoreError::Io(format!(
                "peer {} rejected {}: {}",
                node.daemon_id,
                trname,
                response.status()
            )));
        }
        Ok(())
    }
}
