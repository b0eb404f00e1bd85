use super::*;
use async_trait::async_trait;
use mountfs::{ContentSpecMgr, Lom, MountedFs, ObjectContentResolver, OBJECT_TYPE};
use ostore_lib::{bytes_checksum, ChecksumType, EcConf, Smap, SmapOwner, Snode, StoreError, Xact};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use transport::{
    Header, LoopbackHub, PeerTransport, Receiver, SendBody, SliceRegistry, StreamBundle,
    INTRA_BUNDLE_MULTIPLIER,
};

const SEND_FILE_TIMEOUT: Duration = Duration::from_secs(3);
const STATS_TIME: Duration = Duration::from_secs(60);

struct TestNode {
    si: Snode,
    _root: TempDir,
    mfs: Arc<MountedFs>,
    csm: Arc<ContentSpecMgr>,
    slices: Arc<SliceRegistry>,
    smap: Arc<SmapOwner>,
    req_bundle: Arc<StreamBundle>,
    resp_bundle: Arc<StreamBundle>,
    ec_conf: EcConf,
    respond: Mutex<Option<Arc<XactRespond>>>,
    get: Mutex<Option<Arc<XactGet>>>,
}

impl TestNode {
    fn respond_xact_sync(self: &Arc<Self>) -> Arc<XactRespond> {
        let mut guard = self.respond.lock().unwrap();
        if let Some(xact) = guard.as_ref() {
            if !xact.xact().finished() {
                return xact.clone();
            }
        }
        let xact = XactRespond::new(
            "B",
            self.smap.clone(),
            self.si.clone(),
            self.csm.clone(),
            self.slices.clone(),
            self.req_bundle.clone(),
            self.resp_bundle.clone(),
            SEND_FILE_TIMEOUT,
        );
        let _ = xact.run();
        *guard = Some(xact.clone());
        xact
    }

    fn get_xact_sync(self: &Arc<Self>) -> Arc<XactGet> {
        let mut guard = self.get.lock().unwrap();
        if let Some(xact) = guard.as_ref() {
            if !xact.xact().finished() {
                return xact.clone();
            }
        }
        let xact = XactGet::new(
            "B",
            self.ec_conf.clone(),
            self.smap.clone(),
            self.si.clone(),
            self.csm.clone(),
            self.slices.clone(),
            self.req_bundle.clone(),
            self.resp_bundle.clone(),
            SEND_FILE_TIMEOUT,
        );
        let _ = xact.run();
        *guard = Some(xact.clone());
        xact
    }

    fn put_xact(self: &Arc<Self>) -> Arc<XactPut> {
        let xact = XactPut::new(
            "B",
            self.ec_conf.clone(),
            self.smap.clone(),
            self.si.clone(),
            self.csm.clone(),
            self.slices.clone(),
            self.req_bundle.clone(),
            self.resp_bundle.clone(),
            SEND_FILE_TIMEOUT,
            STATS_TIME,
        );
        let _ = xact.run();
        xact
    }

    fn mpath_files(&self, content_type: &str) -> Vec<String> {
        let (available, _) = self.mfs.get();
        let mut files = Vec::new();
        for mp in available.values() {
            let dir = mp.make_path(content_type, true);
            let mut stack = vec![dir];
            while let Some(dir) = stack.pop() {
                let Ok(entries) = std::fs::read_dir(&dir) else { continue };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else {
                        files.push(path.to_string_lossy().to_string());
                    }
                }
            }
        }
        files
    }
}

struct NodeResolver(Arc<TestNode>);

#[async_trait]
impl EcXactResolver for NodeResolver {
    async fn respond_xact(&self, _bucket: &str) -> Option<Arc<XactRespond>> {
        Some(self.0.respond_xact_sync())
    }

    async fn get_xact(&self, _bucket: &str) -> Option<Arc<XactGet>> {
        Some(self.0.get_xact_sync())
    }
}

// sends complete asynchronously on the bundle's sender tasks; poll until
// the peers' stores settle
async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn peer_slice_count(nodes: &[Arc<TestNode>]) -> usize {
    nodes[1..]
        .iter()
        .map(|n| n.mpath_files(ECSLICE_TYPE).len())
        .sum()
}

fn ec_conf(data: usize, parity: usize) -> EcConf {
    EcConf {
        enabled: true,
        data_slices: data,
        parity_slices: parity,
        obj_size_limit: 1024,
    }
}

fn cluster(num_targets: usize, ec: EcConf) -> (Vec<Arc<TestNode>>, Arc<LoopbackHub>) {
    let hub = LoopbackHub::new();
    let mut tmap = HashMap::new();
    for i in 0..num_targets {
        let id = format!("t{}", i + 1);
        tmap.insert(id.clone(), Snode::new(id));
    }
    let smap = Arc::new(SmapOwner::new(Smap { version: 1, tmap }));

    let mut nodes = Vec::with_capacity(num_targets);
    for i in 0..num_targets {
        let id = format!("t{}", i + 1);
        let root = TempDir::new().unwrap();
        let mfs = Arc::new(MountedFs::new());
        mfs.disable_fsid_check();
        for m in 0..2 {
            let mp = root.path().join(format!("mp{}", m));
            std::fs::create_dir_all(&mp).unwrap();
            mfs.add(mp.to_str().unwrap()).unwrap();
        }
        let csm = Arc::new(ContentSpecMgr::with_defaults(mfs.clone()));
        csm.register(ECSLICE_TYPE, Arc::new(ObjectContentResolver)).unwrap();
        csm.register(ECMETA_TYPE, Arc::new(ObjectContentResolver)).unwrap();

        let req_bundle = Arc::new(StreamBundle::new(
            REQ_STREAM_NAME,
            smap.clone(),
            id.clone(),
            hub.clone(),
            INTRA_BUNDLE_MULTIPLIER,
            None,
        ));
        let resp_bundle = Arc::new(StreamBundle::new(
            RESP_STREAM_NAME,
            smap.clone(),
            id.clone(),
            hub.clone(),
            INTRA_BUNDLE_MULTIPLIER,
            None,
        ));

        let node = Arc::new(TestNode {
            si: Snode::new(id.clone()),
            _root: root,
            mfs,
            csm,
            slices: Arc::new(SliceRegistry::new()),
            smap: smap.clone(),
            req_bundle,
            resp_bundle,
            ec_conf: ec.clone(),
            respond: Mutex::new(None),
            get: Mutex::new(None),
        });

        let receiver = Arc::new(Receiver::new());
        let resolver: Arc<dyn EcXactResolver> = Arc::new(NodeResolver(node.clone()));
        receiver
            .register(REQ_STREAM_NAME, EcRecvRequest::new(resolver.clone()))
            .unwrap();
        receiver
            .register(RESP_STREAM_NAME, EcRecvResponse::new(resolver))
            .unwrap();
        hub.attach(&node.si.daemon_id, receiver);
        nodes.push(node);
    }
    (nodes, hub)
}

fn put_object(node: &Arc<TestNode>, objname: &str, size: usize) -> (Lom, Vec<u8>) {
    let (available, _) = node.mfs.get();
    let mut mps: Vec<_> = available.values().cloned().collect();
    mps.sort_by(|a, b| a.path.cmp(&b.path));
    let fqn = node.csm.fqn(&mps[0], OBJECT_TYPE, true, "B", objname);
    std::fs::create_dir_all(Path::new(&fqn).parent().unwrap()).unwrap();
    let data: Vec<u8> = (0..size as u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(&fqn, &data).unwrap();

    let mut lom = Lom::init(&fqn, &node.csm).unwrap();
    lom.from_fs().unwrap();
    lom.cksum = bytes_checksum(ChecksumType::XXHash, &data);
    lom.version = Some("1".to_string());
    lom.persist().unwrap();
    (lom, data)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encode_distributes_slices_and_metadata() {
    let (nodes, _hub) = cluster(6, ec_conf(2, 2));
    let primary = &nodes[0];

    let (lom, _data) = put_object(primary, "big/obj.bin", 64 * 1024);
    let put = primary.put_xact();

    let (req, rx) = EcRequest::new(EcAction::Split, lom, false).with_reply();
    put.encode(req).await;
    rx.await.unwrap().unwrap();

    // sender side persisted its metadata record on its slice mountpath
    assert_eq!(primary.mpath_files(ECMETA_TYPE).len(), 1);

    // four slices land across the peers, one each, each with a metadata
    // record, plus one standalone metadata replica on the spare peer
    assert!(
        wait_for(|| {
            peer_slice_count(&nodes) == 4
                && nodes[1..]
                    .iter()
                    .map(|n| n.mpath_files(ECMETA_TYPE).len())
                    .sum::<usize>()
                    == 5
        })
        .await,
        "slices/metadata never fully landed"
    );
    for peer in &nodes[1..] {
        assert!(
            peer.mpath_files(ECSLICE_TYPE).len() <= 1,
            "no peer holds more than one slice"
        );
    }

    put.xact().abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_object_is_replicated_not_sliced() {
    let (nodes, _hub) = cluster(6, ec_conf(2, 2));
    let primary = &nodes[0];

    let (lom, data) = put_object(primary, "small.bin", 512);
    assert!(primary.ec_conf.is_ec_copy(lom.size));
    let put = primary.put_xact();

    let (req, rx) = EcRequest::new(EcAction::Split, lom, true).with_reply();
    put.encode(req).await;
    rx.await.unwrap().unwrap();

    // parity_slices full replicas, no slices anywhere
    assert!(
        wait_for(|| {
            nodes[1..]
                .iter()
                .map(|n| n.mpath_files(OBJECT_TYPE).len())
                .sum::<usize>()
                == 2
        })
        .await,
        "replicas never landed"
    );
    for peer in &nodes[1..] {
        for fqn in peer.mpath_files(OBJECT_TYPE) {
            assert_eq!(std::fs::read(&fqn).unwrap(), data);
        }
        assert!(peer.mpath_files(ECSLICE_TYPE).is_empty());
    }

    put.xact().abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_rebuilds_lost_object() {
    let (nodes, _hub) = cluster(6, ec_conf(2, 2));
    let primary = &nodes[0];

    let (lom, data) = put_object(primary, "victim.bin", 32 * 1024);
    let fqn = lom.fqn.clone();
    let put = primary.put_xact();
    let (req, rx) = EcRequest::new(EcAction::Split, lom, false).with_reply();
    put.encode(req).await;
    rx.await.unwrap().unwrap();
    assert!(wait_for(|| peer_slice_count(&nodes) == 4).await);
    put.xact().abort();

    // lose the primary replica, then restore from the peers' slices
    std::fs::remove_file(&fqn).unwrap();
    let lost = Lom::init(&fqn, &primary.csm).unwrap();
    lost.uncache();

    let get = primary.get_xact_sync();
    let (req, rx) = EcRequest::new(EcAction::Restore, lost, false).with_reply();
    get.decode(req).await;
    rx.await.unwrap().unwrap();

    assert_eq!(std::fs::read(&fqn).unwrap(), data);
    let mut restored = Lom::init(&fqn, &primary.csm).unwrap();
    restored.load_meta_from_fs().unwrap();
    assert_eq!(restored.version, Some("1".to_string()));

    get.xact().abort();
}

/// Delays request delivery per peer, leaving responses untouched.
struct DelayedTransport {
    inner: Arc<LoopbackHub>,
    delays: HashMap<String, Duration>,
}

#[async_trait]
impl PeerTransport for DelayedTransport {
    async fn deliver(
        &self,
        node: &ostore_lib::Snode,
        trname: &str,
        hdr: &Header,
        body: SendBody,
    ) -> ostore_lib::StoreResult<()> {
        if let Some(delay) = self.delays.get(&node.daemon_id) {
            tokio::time::sleep(*delay).await;
        }
        self.inner.deliver(node, trname, hdr, body).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_gives_each_slice_its_own_timeout() {
    let (nodes, hub) = cluster(6, ec_conf(2, 2));
    let primary = &nodes[0];

    let (lom, data) = put_object(primary, "slow.bin", 16 * 1024);
    let fqn = lom.fqn.clone();
    let put = primary.put_xact();
    let (req, rx) = EcRequest::new(EcAction::Split, lom, false).with_reply();
    put.encode(req).await;
    rx.await.unwrap().unwrap();
    assert!(wait_for(|| peer_slice_count(&nodes) == 4).await);
    put.xact().abort();

    std::fs::remove_file(&fqn).unwrap();

    // peers answer progressively later: each arrival fits its own
    // send-file window but only the first would fit one shared window
    let obj_uname = ostore_lib::uname("B", "slow.bin");
    let peers = ostore_lib::hrw_peers(&obj_uname, &primary.smap.get(), "t1");
    let mut delays = HashMap::new();
    for (i, peer) in peers.iter().enumerate() {
        delays.insert(
            peer.daemon_id.clone(),
            Duration::from_millis(500 + 750 * i as u64),
        );
    }
    let slow_req_bundle = Arc::new(StreamBundle::new(
        REQ_STREAM_NAME,
        primary.smap.clone(),
        "t1",
        Arc::new(DelayedTransport {
            inner: hub.clone(),
            delays,
        }),
        INTRA_BUNDLE_MULTIPLIER,
        None,
    ));
    let get = XactGet::new(
        "B",
        primary.ec_conf.clone(),
        primary.smap.clone(),
        primary.si.clone(),
        primary.csm.clone(),
        primary.slices.clone(),
        slow_req_bundle,
        primary.resp_bundle.clone(),
        Duration::from_secs(1),
    );
    let _ = get.run();
    *primary.get.lock().unwrap() = Some(get.clone());

    let lost = Lom::init(&fqn, &primary.csm).unwrap();
    lost.uncache();
    let (req, rx) = EcRequest::new(EcAction::Restore, lost, false).with_reply();
    get.decode(req).await;
    rx.await.unwrap().unwrap();
    assert_eq!(std::fs::read(&fqn).unwrap(), data);

    get.xact().abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_fails_beyond_parity_losses() {
    let (nodes, _hub) = cluster(6, ec_conf(2, 2));
    let primary = &nodes[0];

    let (lom, _data) = put_object(primary, "doomed.bin", 32 * 1024);
    let fqn = lom.fqn.clone();
    let put = primary.put_xact();
    let (req, rx) = EcRequest::new(EcAction::Split, lom, false).with_reply();
    put.encode(req).await;
    rx.await.unwrap().unwrap();
    assert!(wait_for(|| peer_slice_count(&nodes) == 4).await);
    put.xact().abort();

    // losing more slices than there is parity makes the object
    // unrecoverable
    std::fs::remove_file(&fqn).unwrap();
    let mut killed = 0;
    for peer in &nodes[1..] {
        for slice_fqn in peer.mpath_files(ECSLICE_TYPE) {
            if killed < 3 {
                std::fs::remove_file(&slice_fqn).unwrap();
                killed += 1;
            }
        }
    }
    assert_eq!(killed, 3);

    let lost = Lom::init(&fqn, &primary.csm).unwrap();
    lost.uncache();
    let get = primary.get_xact_sync();
    let (req, rx) = EcRequest::new(EcAction::Restore, lost, false).with_reply();
    get.decode(req).await;
    match rx.await.unwrap() {
        Err(StoreError::NotEnoughSlices(_)) => {}
        other => panic!("expected NotEnoughSlices, got {:?}", other.err()),
    }
    // the failed restore must not materialize the object
    assert!(!Path::new(&fqn).exists());

    get.xact().abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clear_requests_drains_and_rejects() {
    let (nodes, _hub) = cluster(1, ec_conf(2, 2));
    let primary = &nodes[0];
    let put = primary.put_xact();

    // enqueued before the clear: resolved with an error (here: the cluster
    // is too small to encode anyway)
    let (lom1, _) = put_object(primary, "before.bin", 8 * 1024);
    let (req1, rx1) = EcRequest::new(EcAction::Split, lom1, false).with_reply();
    put.encode(req1).await;

    put.req.clear_requests().await;
    // the loop processes the control message and terminates
    for _ in 0..200 {
        if put.xact().finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(put.xact().finished());
    assert!(rx1.await.unwrap().is_err());

    // enqueued after the clear: rejected outright as disabled
    let (lom2, _) = put_object(primary, "after.bin", 8 * 1024);
    let (req2, rx2) = EcRequest::new(EcAction::Split, lom2, false).with_reply();
    put.encode(req2).await;
    match rx2.await.unwrap() {
        Err(StoreError::EcDisabled(_)) => {}
        other => panic!("expected EcDisabled, got {:?}", other.err()),
    }

    // a fresh xaction (the manager's renewal path) accepts requests again
    let put2 = primary.put_xact();
    assert!(put2.req.requests_enabled());
    put2.xact().abort();
}

#[tokio::test]
async fn test_mem_writer_roundtrip() {
    use tokio::io::AsyncWriteExt;
    let buf = MemWriter::new();
    let mut w = buf.clone();
    w.write_all(b"abc").await.unwrap();
    w.write_all(b"def").await.unwrap();
    assert_eq!(buf.take(), b"abcdef");
    assert!(buf.take().is_empty());
}

#[test]
fn test_intra_req_marshal_roundtrip() {
    let req = IntraReq {
        act: IntraAct::Put,
        sender: "t1".to_string(),
        meta: Some(EcMetadata {
            size: 100,
            data_slices: 2,
            parity_slices: 2,
            slice_id: 3,
            obj_cksum: Some("ff00".to_string()),
            obj_version: Some("2".to_string()),
            is_copy: false,
        }),
        exists: true,
        is_slice: true,
    };
    let raw = req.marshal().unwrap();
    let back = IntraReq::unmarshal(&raw).unwrap();
    assert_eq!(back.act, IntraAct::Put);
    assert_eq!(back.sender, "t1");
    assert_eq!(back.meta.unwrap().slice_id, 3);
    assert!(back.is_slice);

    assert!(IntraReq::unmarshal(b"not json").is_err());
}
