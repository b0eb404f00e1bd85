use crate::{IntraAct, IntraReq, XactGet, XactRespond};
use async_trait::async_trait;
use log::{error, warn};
use ostore_lib::StoreResult;
use std::sync::Arc;
use transport::{drain_body, BodyReader, Header, ReceiveHandler};

/// Looks up (renewing when finished) the per-bucket EC xactions; the
/// coordinator's EC manager implements this.
#[async_trait]
pub trait EcXactResolver: Send + Sync {
    async fn respond_xact(&self, bucket: &str) -> Option<Arc<XactRespond>>;
    async fn get_xact(&self, bucket: &str) -> Option<Arc<XactGet>>;
}

/// Handler of the lightweight request stream: peer commands (get slice,
/// get meta, delete) routed to the Respond xaction.
pub struct EcRecvRequest {
    resolver: Arc<dyn EcXactResolver>,
}

impl EcRecvRequest {
    pub fn new(resolver: Arc<dyn EcXactResolver>) -> Arc<Self> {
        Arc::new(Self { resolver })
    }
}

#[async_trait]
impl ReceiveHandler for EcRecvRequest {
    async fn on_receive(&self, hdr: Header, body: BodyReader) -> StoreResult<()> {
        // command requests should not have a body, but when they do it must
        // be drained to keep the stream healthy
        let _ = drain_body(body).await;
        if hdr.opaque.is_empty() {
            error!("empty EC request for {}/{}", hdr.bucket, hdr.objname);
            return Ok(());
        }
        let ireq = match IntraReq::unmarshal(&hdr.opaque) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to unmarshal EC request: {}", e);
                return Ok(());
            }
        };
        match self.resolver.respond_xact(&hdr.bucket).await {
            Some(xact) => xact.dispatch_req(ireq, &hdr.bucket, &hdr.objname).await,
            None => warn!("no respond xaction for bucket {}", hdr.bucket),
        }
        Ok(())
    }
}

/// Handler of the bulk response stream: pushed slices/replicas go to the
/// Respond xaction for storage; replies to our own requests go to the Get
/// xaction's pending writers.
pub struct EcRecvResponse {
    resolver: Arc<dyn EcXactResolver>,
}

impl EcRecvResponse {
    pub fn new(resolver: Arc<dyn EcXactResolver>) -> Arc<Self> {
        Arc::new(Self { resolver })
    }
}

#[async_trait]
impl ReceiveHandler for EcRecvResponse {
    async fn on_receive(&self, hdr: Header, body: BodyReader) -> StoreResult<()> {
        if hdr.opaque.is_empty() {
            error!("empty EC response for {}/{}", hdr.bucket, hdr.objname);
            let _ = drain_body(body).await;
            return Ok(());
        }
        let ireq = match IntraReq::unmarshal(&hdr.opaque) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to unmarshal EC response: {}", e);
                let _ = drain_body(body).await;
                return Ok(());
            }
        };
        match ireq.act {
            IntraAct::Put => match self.resolver.respond_xact(&hdr.bucket).await {
                Some(xact) => {
                    xact.dispatch_resp(ireq, &hdr.bucket, &hdr.objname, hdr.obj_attrs, body)
                        .await
                }
                None => {
                    warn!("no respond xaction for bucket {}", hdr.bucket);
                    let _ = drain_body(body).await;
                }
            },
            IntraAct::Resp => match self.resolver.get_xact(&hdr.bucket).await {
                // process the response even when the cluster shrank below
                // the restore requirement: the request may have been sent
                // when there was still room to complete it
                Some(xact) => {
                    xact.dispatch_resp(ireq, &hdr.bucket, &hdr.objname, hdr.obj_attrs, body)
                        .await
                }
                None => {
                    warn!("no get xaction for bucket {}", hdr.bucket);
                    let _ = drain_body(body).await;
                }
            },
            other => {
                error!("unknown EC response action {:?}", other);
                let _ = drain_body(body).await;
            }
        }
        Ok(())
    }
}
