use crate::fspathrgrp::FsPathRunGroup;
use crate::target::Target;
use mountfs::{Lom, PathRunner};
use ostore_lib::{
    BucketMd, BucketProps, Config, EcConf, MirrorConf, Smap, Snode, StoreError, TestFspathConf,
    Xact,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use transport::LoopbackHub;

fn test_config(root: &TempDir, count: usize) -> Config {
    Config {
        test_fspaths: TestFspathConf {
            root: root.path().to_string_lossy().to_string(),
            count,
            instance: 0,
        },
        ..Default::default()
    }
}

fn smap_of(ids: &[&str]) -> Smap {
    let mut tmap = HashMap::new();
    for id in ids {
        tmap.insert(id.to_string(), Snode::new(*id));
    }
    Smap { version: 1, tmap }
}

fn bmd_with(bucket: &str, mirror: MirrorConf, ec: EcConf) -> BucketMd {
    let mut bmd = BucketMd {
        version: 1,
        ..Default::default()
    };
    bmd.lbmap.insert(bucket.to_string(), BucketProps { mirror, ec });
    bmd
}

fn ec_conf(data: usize, parity: usize) -> EcConf {
    EcConf {
        enabled: true,
        data_slices: data,
        parity_slices: parity,
        obj_size_limit: 1024,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_target_boots_with_virtual_mountpaths() {
    let root = TempDir::new().unwrap();
    let target = Target::new(
        "t1",
        test_config(&root, 4),
        smap_of(&["t1"]),
        BucketMd::default(),
        LoopbackHub::new(),
    )
    .unwrap();

    assert_eq!(target.mfs.num_avail(), 4);
    assert_eq!(
        target.csm.registered_types(),
        vec!["ecm", "ecs", "obj", "work"]
    );

    // unknown bucket is rejected on the write path
    match target.put_object("nope", "x", b"data").await {
        Err(StoreError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.err()),
    }
    target.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_get_delete_with_mirroring() {
    let root = TempDir::new().unwrap();
    let target = Target::new(
        "t1",
        test_config(&root, 4),
        smap_of(&["t1"]),
        bmd_with(
            "B",
            MirrorConf {
                enabled: true,
                ..Default::default()
            },
            EcConf::default(),
        ),
        LoopbackHub::new(),
    )
    .unwrap();

    let data = vec![0x42u8; 1024 * 1024];
    let lom = target.put_object("B", "a/b.bin", &data).await.unwrap();
    assert_eq!(lom.size, data.len() as i64);
    assert_eq!(lom.version, Some("1".to_string()));

    assert_eq!(target.get_object("B", "a/b.bin").await.unwrap(), data);

    // the mirror engine works asynchronously; wait for the copy
    let fqn = lom.fqn.clone();
    let csm = target.csm.clone();
    let mirrored = wait_until(move || {
        let mut check = Lom::init(&fqn, &csm).unwrap();
        check.load_meta_from_fs().is_ok() && check.has_copies()
    })
    .await;
    assert!(mirrored, "copy did not appear");

    let mut primary = Lom::init(&lom.fqn, &target.csm).unwrap();
    primary.load_meta_from_fs().unwrap();
    let copy_fqn = primary.copy_fqn()[0].clone();
    assert!(std::path::Path::new(&copy_fqn).is_file());

    // delete removes the primary and its copies
    target.delete_object("B", "a/b.bin").await.unwrap();
    assert!(matches!(
        target.get_object("B", "a/b.bin").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(!std::path::Path::new(&copy_fqn).is_file());

    // overwriting an object bumps its version
    let v1 = target.put_object("B", "v/x.bin", b"v1").await.unwrap();
    assert_eq!(v1.version, Some("1".to_string()));
    let v2 = target.put_object("B", "v/x.bin", b"v2").await.unwrap();
    assert_eq!(v2.version, Some("2".to_string()));
    target.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encode_gating_on_insufficient_targets() {
    let root = TempDir::new().unwrap();
    let target = Target::new(
        "t1",
        test_config(&root, 2),
        smap_of(&["t1", "t2", "t3"]),
        bmd_with("B", MirrorConf::default(), ec_conf(2, 2)),
        LoopbackHub::new(),
    )
    .unwrap();

    // 3 targets < data + parity + 1: the write path surfaces the shortage
    let big = vec![7u8; 8 * 1024];
    match target.put_object("B", "big.bin", &big).await {
        Err(StoreError::InsufficientTargets { actual, required }) => {
            assert_eq!(actual, 3);
            assert_eq!(required, 5);
        }
        other => panic!("expected InsufficientTargets, got {:?}", other.err()),
    }
    // the object itself landed; only the encoding was refused
    assert!(target.get_object("B", "big.bin").await.is_ok());

    // a small object takes the replication path, which is not gated on the
    // full requirement
    target.put_object("B", "small.bin", b"tiny").await.unwrap();
    target.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_smap_shrink_stops_put_and_get_but_not_respond() {
    let root = TempDir::new().unwrap();
    let target = Target::new(
        "t1",
        test_config(&root, 2),
        smap_of(&["t1", "t2", "t3", "t4", "t5", "t6"]),
        bmd_with("B", MirrorConf::default(), ec_conf(2, 2)),
        LoopbackHub::new(),
    )
    .unwrap();

    let put = target.ecm.restore_bck_put_xact("B");
    let get = target.ecm.restore_bck_get_xact("B");
    let respond = target.ecm.restore_bck_resp_xact("B");
    assert!(!put.xact().finished());

    // shrink below the restore requirement: both put and get must stop
    let mut shrunk = smap_of(&["t1", "t2"]);
    shrunk.version = 2;
    assert!(target.smap.put(shrunk));

    assert!(wait_until(|| put.xact().finished()).await, "put kept running");
    assert!(wait_until(|| get.xact().finished()).await, "get kept running");
    assert!(
        !respond.xact().finished(),
        "respond must keep answering peers"
    );
    assert_eq!(target.ecm.target_cnt(), 2);

    // and new encodes are refused
    let big = vec![7u8; 8 * 1024];
    assert!(matches!(
        target.put_object("B", "late.bin", &big).await,
        Err(StoreError::InsufficientTargets { .. })
    ));
    target.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bmd_change_disables_then_reenables_ec() {
    let root = TempDir::new().unwrap();
    let target = Target::new(
        "t1",
        test_config(&root, 2),
        smap_of(&["t1", "t2", "t3", "t4", "t5", "t6"]),
        bmd_with("B", MirrorConf::default(), ec_conf(2, 2)),
        LoopbackHub::new(),
    )
    .unwrap();

    let put = target.ecm.restore_bck_put_xact("B");
    let get = target.ecm.restore_bck_get_xact("B");

    // EC switched off for the bucket: pending requests drain, xactions stop
    let mut bmd2 = bmd_with("B", MirrorConf::default(), EcConf {
        enabled: false,
        ..ec_conf(2, 2)
    });
    bmd2.version = 2;
    assert!(target.bmd.put(bmd2));

    assert!(wait_until(|| put.xact().finished()).await, "put kept running");
    assert!(wait_until(|| get.xact().finished()).await, "get kept running");

    // switched back on: the manager renews fresh, accepting xactions
    let mut bmd3 = bmd_with("B", MirrorConf::default(), ec_conf(2, 2));
    bmd3.version = 3;
    assert!(target.bmd.put(bmd3));
    assert!(
        wait_until(|| {
            let fresh = target.ecm.restore_bck_put_xact("B");
            !fresh.xact().finished() && fresh.req.requests_enabled()
        })
        .await
    );
    target.shutdown();
}

#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<String>>,
}

impl PathRunner for RecordingRunner {
    fn req_add_mountpath(&self, mpath: &str) {
        self.calls.lock().unwrap().push(format!("add:{}", mpath));
    }

    fn req_remove_mountpath(&self, mpath: &str) {
        self.calls.lock().unwrap().push(format!("remove:{}", mpath));
    }

    fn req_enable_mountpath(&self, mpath: &str) {
        self.calls.lock().unwrap().push(format!("enable:{}", mpath));
    }

    fn req_disable_mountpath(&self, mpath: &str) {
        self.calls.lock().unwrap().push(format!("disable:{}", mpath));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mountpath_events_are_multicast() {
    let root = TempDir::new().unwrap();
    let target = Target::new(
        "t1",
        test_config(&root, 2),
        smap_of(&["t1"]),
        BucketMd::default(),
        LoopbackHub::new(),
    )
    .unwrap();

    let runner = Arc::new(RecordingRunner::default());
    let runner_id = target.fsprg.reg(runner.clone());

    let extra = root.path().join("extra");
    std::fs::create_dir_all(&extra).unwrap();
    let extra = extra.to_string_lossy().to_string();

    target.add_mountpath(&extra).unwrap();
    assert_eq!(target.mfs.num_avail(), 3);

    assert_eq!(target.disable_mountpath(&extra), (true, true));
    assert_eq!(target.disable_mountpath(&extra), (false, true));
    assert_eq!(target.enable_mountpath(&extra), (true, true));
    target.remove_mountpath(&extra).unwrap();

    let calls = runner.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            format!("add:{}", extra),
            format!("disable:{}", extra),
            format!("enable:{}", extra),
            format!("remove:{}", extra),
        ]
    );

    // an unregistered runner stops receiving events
    target.fsprg.unreg(runner_id);
    target.add_mountpath(&extra).unwrap();
    assert_eq!(runner.calls.lock().unwrap().len(), calls.len());
    target.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_mountpath_raises_unregister_signal() {
    let root = TempDir::new().unwrap();
    let fired = Arc::new(Mutex::new(Vec::<String>::new()));

    let fsprg = FsPathRunGroup::new();
    let fired_hook = fired.clone();
    fsprg.set_no_mountpaths_hook(Box::new(move |action| {
        fired_hook.lock().unwrap().push(action.to_string());
    }));

    let mfs = Arc::new(mountfs::MountedFs::new());
    mfs.disable_fsid_check();
    let mp = root.path().join("mp1");
    std::fs::create_dir_all(&mp).unwrap();
    let mp = mp.to_string_lossy().to_string();
    fsprg.add_mountpath(&mfs, &mp).unwrap();

    fsprg.remove_mountpath(&mfs, &mp).unwrap();
    assert_eq!(fired.lock().unwrap().as_slice(), &["removed".to_string()]);
}
