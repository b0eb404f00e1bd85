use crate::{Header, PeerTransport, Receiver, SendBody};
use async_trait::async_trait;
use dashmap::DashMap;
use log::warn;
use ostore_lib::{Snode, StoreError, StoreResult};
use std::sync::Arc;

/// In-process hub routing deliveries straight to the destination target's
/// receive registry. Used by tests and by single-process multi-target
/// clusters.
pub struct LoopbackHub {
    receivers: DashMap<String, Arc<Receiver>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            receivers: DashMap::new(),
        })
    }

    pub fn attach(&self, daemon_id: &str, receiver: Arc<Receiver>) {
        self.receivers.insert(daemon_id.to_string(), receiver);
    }

    pub fn detach(&self, daemon_id: &str) {
        self.receivers.remove(daemon_id);
    }
}

#[async_trait]
impl PeerTransport for LoopbackHub {
    async fn deliver(
        &self,
        node: &Snode,
        trname: &str,
        hdr: &Header,
        body: SendBody,
    ) -> StoreResult<()> {
        let receiver = self
            .receivers
            .get(&node.daemon_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                StoreError::NotFound(format!("no receiver attached for {}", node.daemon_id))
            })?;
        let reader = match body.open().await? {
            Some(r) => r,
            None => Box::new(std::io::Cursor::new(Vec::new())),
        };
        if let Err(e) = receiver.dispatch(trname, hdr.clone(), reader).await {
            warn!("loopback dispatch {} to {}: {}", trname, node.daemon_id, e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        read_body, BodyReader, ObjectAttrs, ReceiveHandler, SliceRegistry, SliceWriter,
        StreamBundle, INTRA_BUNDLE_MULTIPLIER,
    };
    use ostore_lib::{Smap, SmapOwner, TimeoutGroup};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn smap_of(ids: &[&str]) -> Arc<SmapOwner> {
        let mut tmap = HashMap::new();
        for id in ids {
            tmap.insert(id.to_string(), Snode::new(*id));
        }
        Arc::new(SmapOwner::new(Smap { version: 1, tmap }))
    }

    struct Recording {
        tx: mpsc::UnboundedSender<(Header, Vec<u8>)>,
    }

    #[async_trait]
    impl ReceiveHandler for Recording {
        async fn on_receive(&self, hdr: Header, body: BodyReader) -> StoreResult<()> {
            let data = read_body(body).await?;
            let _ = self.tx.send((hdr, data));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bundle_delivers_header_and_body() {
        let hub = LoopbackHub::new();
        let receiver = Arc::new(Receiver::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver
            .register("ec-resp", Arc::new(Recording { tx }))
            .unwrap();
        hub.attach("t2", receiver);

        let smap = smap_of(&["t1", "t2"]);
        let done: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let done_cb = done.clone();
        let bundle = StreamBundle::new(
            "ec-resp",
            smap.clone(),
            "t1",
            hub.clone(),
            INTRA_BUNDLE_MULTIPLIER,
            None,
        );

        let hdr = Header {
            bucket: "B".to_string(),
            objname: "a/b.bin".to_string(),
            opaque: vec![1, 2, 3],
            obj_attrs: ObjectAttrs {
                size: 5,
                ..Default::default()
            },
        };
        bundle
            .send_by_daemon_id(
                &["t2".to_string()],
                hdr.clone(),
                SendBody::Bytes(Arc::new(b"hello".to_vec())),
                Some(Arc::new(move |h: &Header, err: Option<&StoreError>| {
                    assert_eq!(h.objname, "a/b.bin");
                    done_cb.lock().unwrap().push(err.map(|e| e.to_string()));
                })),
            )
            .await
            .unwrap();

        let (got_hdr, got_body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_hdr, hdr);
        assert_eq!(got_body, b"hello");

        // the completion callback fires after delivery
        for _ in 0..100 {
            if !done.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.lock().unwrap().as_slice(), &[None::<String>]);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let hub = LoopbackHub::new();
        let smap = smap_of(&["t1"]);
        let bundle = StreamBundle::new("ec-req", smap, "t1", hub, 1, None);
        let err = bundle
            .send_by_daemon_id(&["ghost".to_string()], Header::default(), SendBody::None, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_receiver_rejects_duplicate_registration() {
        let receiver = Receiver::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        receiver
            .register("ec-req", Arc::new(Recording { tx: tx.clone() }))
            .unwrap();
        assert!(receiver.register("ec-req", Arc::new(Recording { tx })).is_err());
    }

    #[tokio::test]
    async fn test_slice_registry_register_and_receive() {
        let registry = SliceRegistry::new();
        let buf: Vec<u8> = Vec::new();
        let writer = SliceWriter::new(Box::new(std::io::Cursor::new(buf)));
        assert!(registry.reg_writer("t1|B|obj", writer.clone()));
        assert!(!registry.reg_writer("t1|B|obj", writer.clone()));

        let attrs = ObjectAttrs {
            size: 4,
            version: "9".to_string(),
            cksum_type: "xxhash".to_string(),
            cksum_value: "0011223344556677".to_string(),
            ..Default::default()
        };
        registry
            .writer_receive(
                &writer,
                true,
                &attrs,
                Box::new(std::io::Cursor::new(b"data".to_vec())),
            )
            .await
            .unwrap();
        assert!(!writer.wg.wait_timeout(Duration::from_millis(10)).await);
        assert_eq!(writer.written(), 4);
        assert!(writer.exists());
        assert_eq!(writer.version(), Some("9".to_string()));
        assert_eq!(writer.cksum().unwrap().value, "0011223344556677");

        assert!(registry.unreg_writer("t1|B|obj").is_some());
        assert!(registry.unreg_writer("t1|B|obj").is_none());
    }

    #[tokio::test]
    async fn test_writer_receive_exists_false_drains_and_signals() {
        let registry = SliceRegistry::new();
        let writer = SliceWriter::new(Box::new(std::io::Cursor::new(Vec::new())));
        registry.reg_writer("t1|B|gone", writer.clone());

        let result = registry
            .writer_receive(
                &writer,
                false,
                &ObjectAttrs::default(),
                Box::new(std::io::Cursor::new(vec![0u8; 4096])),
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(!writer.wg.wait_timeout(Duration::from_millis(10)).await);
        assert!(!writer.exists());
        assert_eq!(writer.written(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_writer_times_out() {
        let wg = TimeoutGroup::new();
        wg.add(1);
        assert!(wg.wait_timeout(Duration::from_millis(200)).await);
    }
}
