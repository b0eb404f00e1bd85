use super::*;
use mountfs::{ContentSpecMgr, Lom, MountedFs, OBJECT_TYPE};
use ostore_lib::{bytes_checksum, ChecksumType, MirrorConf, Xact};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Cluster {
    _root: TempDir,
    mfs: Arc<MountedFs>,
    csm: Arc<ContentSpecMgr>,
}

fn cluster(num_mpaths: usize) -> Cluster {
    let root = TempDir::new().unwrap();
    let mfs = Arc::new(MountedFs::new());
    mfs.disable_fsid_check();
    for i in 0..num_mpaths {
        let mp = root.path().join(format!("mp{}", i));
        std::fs::create_dir_all(&mp).unwrap();
        mfs.add(mp.to_str().unwrap()).unwrap();
    }
    let csm = Arc::new(ContentSpecMgr::with_defaults(mfs.clone()));
    Cluster {
        _root: root,
        mfs,
        csm,
    }
}

fn put_object(cl: &Cluster, bucket: &str, objname: &str, size: usize) -> Lom {
    let (available, _) = cl.mfs.get();
    let mut mps: Vec<_> = available.values().cloned().collect();
    mps.sort_by(|a, b| a.path.cmp(&b.path));
    let fqn = cl.csm.fqn(&mps[0], OBJECT_TYPE, true, bucket, objname);
    std::fs::create_dir_all(Path::new(&fqn).parent().unwrap()).unwrap();
    let data = vec![0x5au8; size];
    std::fs::write(&fqn, &data).unwrap();

    let mut lom = Lom::init(&fqn, &cl.csm).unwrap();
    lom.from_fs().unwrap();
    lom.cksum = bytes_checksum(ChecksumType::XXHash, &data);
    lom.version = Some("1".to_string());
    lom.persist().unwrap();
    lom
}

#[tokio::test]
async fn test_put_object_lands_on_two_distinct_mountpaths() {
    let cl = cluster(4);
    let xact = XactCopy::new(
        "B",
        true,
        MirrorConf {
            enabled: true,
            ..Default::default()
        },
        cl.mfs.clone(),
        cl.csm.clone(),
    );
    let _loop = xact.run();

    let lom = put_object(&cl, "B", "a/b.bin", 1024 * 1024);
    let primary_fqn = lom.fqn.clone();
    xact.copy(lom).unwrap();
    xact.drain().await;

    let mut primary = Lom::init(&primary_fqn, &cl.csm).unwrap();
    primary.load_meta_from_fs().unwrap();
    assert_eq!(primary.copy_fqn().len(), 1, "exactly one copy was made");

    let copy_fqn = primary.copy_fqn()[0].clone();
    assert!(copy_fqn.contains("/obj/local/B/a/b.bin"));
    let copy_meta = std::fs::metadata(&copy_fqn).unwrap();
    assert_eq!(copy_meta.len(), 1024 * 1024);

    // symmetric records: each side lists the other
    let mut copy = Lom::init(&copy_fqn, &cl.csm).unwrap();
    copy.load_meta_from_fs().unwrap();
    assert_eq!(copy.copy_fqn(), &[primary_fqn.clone()]);
    assert_ne!(
        copy.parsed.mpath.path, primary.parsed.mpath.path,
        "copies never share a mountpath"
    );
    assert_eq!(copy.cksum, primary.cksum);
    assert_eq!(copy.version, primary.version);

    xact.xact().abort();
}

#[tokio::test]
async fn test_copy_survives_primary_mountpath_disable() {
    let cl = cluster(2);
    let xact = XactCopy::new(
        "B",
        true,
        MirrorConf {
            enabled: true,
            ..Default::default()
        },
        cl.mfs.clone(),
        cl.csm.clone(),
    );
    let _loop = xact.run();

    let lom = put_object(&cl, "B", "obj.bin", 4096);
    let primary_fqn = lom.fqn.clone();
    let primary_mpath = lom.parsed.mpath.path.clone();
    xact.copy(lom).unwrap();
    xact.drain().await;

    let mut primary = Lom::init(&primary_fqn, &cl.csm).unwrap();
    primary.load_meta_from_fs().unwrap();
    let copy_fqn = primary.copy_fqn()[0].clone();

    let (disabled, existed) = cl.mfs.disable(&primary_mpath);
    assert!(disabled && existed);

    // the copy is still addressable and carries full metadata
    let mut copy = Lom::init(&copy_fqn, &cl.csm).unwrap();
    copy.load(false).unwrap();
    assert_eq!(copy.size, 4096);
    assert_eq!(copy.copy_fqn(), &[primary_fqn]);

    xact.xact().abort();
}

#[tokio::test]
async fn test_no_candidate_means_no_copy() {
    let cl = cluster(1);
    let xact = XactCopy::new(
        "B",
        true,
        MirrorConf {
            enabled: true,
            ..Default::default()
        },
        cl.mfs.clone(),
        cl.csm.clone(),
    );
    let _loop = xact.run();

    let lom = put_object(&cl, "B", "solo.bin", 512);
    let primary_fqn = lom.fqn.clone();
    xact.copy(lom).unwrap();
    xact.drain().await;

    let mut primary = Lom::init(&primary_fqn, &cl.csm).unwrap();
    primary.load_meta_from_fs().unwrap();
    assert!(!primary.has_copies());

    xact.xact().abort();
}

#[test]
fn test_find_least_utilized_skips_primary_and_existing_copies() {
    let cl = cluster(3);
    let (available, _) = cl.mfs.get();
    let mut mps: Vec<_> = available.values().cloned().collect();
    mps.sort_by(|a, b| a.path.cmp(&b.path));

    let lom = put_object(&cl, "B", "pick.bin", 64);

    // all three candidates: primary excluded, lower utilization wins
    cl.mfs.iostat.set_disk_util(&mps[1].path, 60);
    cl.mfs.iostat.set_disk_util(&mps[2].path, 10);
    let picked = find_least_utilized(&lom, mps.iter(), &cl.mfs, &cl.csm).unwrap();
    assert_eq!(picked.path, mps[2].path);

    // a mountpath already holding a copy is skipped no matter its load
    let copy_fqn = cl.csm.fqn(&mps[2], OBJECT_TYPE, true, "B", "pick.bin");
    let mut lom_with_copy = Lom::init(&lom.fqn, &cl.csm).unwrap();
    lom_with_copy.from_fs().unwrap();
    lom_with_copy.add_xcopy(&copy_fqn);
    let picked = find_least_utilized(&lom_with_copy, mps.iter(), &cl.mfs, &cl.csm).unwrap();
    assert_eq!(picked.path, mps[1].path);

    // nothing left: primary plus copies cover every mountpath
    let copy2 = cl.csm.fqn(&mps[1], OBJECT_TYPE, true, "B", "pick.bin");
    lom_with_copy.add_xcopy(&copy2);
    assert!(find_least_utilized(&lom_with_copy, mps.iter(), &cl.mfs, &cl.csm).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_idle_xaction_terminates_and_renewal_extends() {
    let cl = cluster(2);
    let xact = XactCopy::new(
        "B",
        true,
        MirrorConf::default(),
        cl.mfs.clone(),
        cl.csm.clone(),
    );
    let handle = xact.run();

    // one idle period with neither work nor renewal ends the xaction
    tokio::time::sleep(Duration::from_secs(181)).await;
    let _ = handle.await;
    assert!(xact.xact().finished());
    assert!(!xact.xact().aborted());
}
