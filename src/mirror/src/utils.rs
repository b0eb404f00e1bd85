use log::error;
use mountfs::{ContentSpecMgr, Lom, MountedFs, MountpathInfo, ParsedFqn, WORKFILE_PUT, WORKFILE_TYPE};
use ostore_lib::{StoreError, StoreResult, COPY_BUF_SIZE};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Picks the least-utilized candidate mountpath for the next copy of `lom`:
/// the primary's own mountpath and every mountpath already holding a copy
/// are skipped. Returns None when no candidate survives, which simply means
/// no copy is made.
pub fn find_least_utilized<'a>(
    lom: &Lom,
    candidates: impl Iterator<Item = &'a Arc<MountpathInfo>>,
    mfs: &MountedFs,
    csm: &ContentSpecMgr,
) -> Option<Arc<MountpathInfo>> {
    let mut best: Option<Arc<MountpathInfo>> = None;
    let mut util: i64 = 101;

    'candidates: for mp in candidates {
        if mp.path == lom.parsed.mpath.path {
            continue;
        }
        if lom.has_copies() {
            for copy_fqn in lom.copy_fqn() {
                let parsed = match csm.parse_fqn(copy_fqn) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("{}: failed to parse copy fqn {}: {}", lom, copy_fqn, e);
                        continue 'candidates;
                    }
                };
                if parsed.mpath.path == mp.path {
                    continue 'candidates;
                }
            }
        }
        let u = mfs.iostat.get_disk_util(&mp.path);
        if u < util {
            util = u;
            best = Some(mp.clone());
        }
    }
    best
}

/// Copies the primary onto the destination mountpath:
/// stream into a workfile, rename, then persist both sides of the mirror
/// relation (primary first, then the copy's own record).
pub async fn copy_to(
    lom: &mut Lom,
    dest: &Arc<MountpathInfo>,
    csm: &ContentSpecMgr,
) -> StoreResult<String> {
    let dest_parsed = ParsedFqn {
        mpath: dest.clone(),
        content_type: lom.parsed.content_type.clone(),
        bck_is_local: lom.parsed.bck_is_local,
        bucket: lom.parsed.bucket.clone(),
        objname: lom.parsed.objname.clone(),
    };
    let work_fqn = csm.gen_content_fqn(&dest_parsed, WORKFILE_TYPE, WORKFILE_PUT)?;

    copy_file(&lom.fqn, &work_fqn).await?;

    let copy_fqn = csm.fqn(
        dest,
        &lom.parsed.content_type,
        lom.bck_is_local,
        &lom.bucket,
        &lom.objname,
    );
    if let Some(parent) = Path::new(&copy_fqn).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Io(format!("create {}: {}", parent.display(), e)))?;
    }
    if let Err(e) = tokio::fs::rename(&work_fqn, &copy_fqn).await {
        if let Err(rm_err) = tokio::fs::remove_file(&work_fqn).await {
            error!("failed to remove {}: {}", work_fqn, rm_err);
        }
        return Err(StoreError::Io(format!(
            "rename {} -> {}: {}",
            work_fqn, copy_fqn, e
        )));
    }

    lom.add_xcopy(&copy_fqn);
    let meta_result = (|| -> StoreResult<()> {
        lom.persist()?;
        let mut copy_lom = lom.clone_to(&copy_fqn, csm)?;
        copy_lom.set_copy_fqn(vec![lom.fqn.clone()]);
        copy_lom.persist()
    })();

    match meta_result {
        Ok(()) => {
            lom.recache();
            Ok(copy_fqn)
        }
        Err(e) => {
            // best-effort removal of the data file; the primary's metadata
            // is not rolled back and heals at read-time reconciliation
            if let Err(rm_err) = tokio::fs::remove_file(&copy_fqn).await {
                if rm_err.kind() != std::io::ErrorKind::NotFound {
                    error!("failed to remove {}: {}", copy_fqn, rm_err);
                }
            }
            lom.recache();
            Err(e)
        }
    }
}

/// Fixed-size buffered file copy into a freshly created destination.
async fn copy_file(src: &str, dst: &str) -> StoreResult<()> {
    if let Some(parent) = Path::new(dst).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Io(format!("create {}: {}", parent.display(), e)))?;
    }
    let mut reader = tokio::fs::File::open(src)
        .await
        .map_err(|e| StoreError::Io(format!("open {}: {}", src, e)))?;
    let mut writer = tokio::fs::File::create(dst)
        .await
        .map_err(|e| StoreError::Io(format!("create {}: {}", dst, e)))?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StoreError::Io(format!("read {}: {}", src, e)))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| StoreError::Io(format!("write {}: {}", dst, e)))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| StoreError::Io(format!("flush {}: {}", dst, e)))?;
    Ok(())
}
