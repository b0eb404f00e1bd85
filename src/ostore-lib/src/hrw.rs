use crate::{Smap, Snode};
use xxhash_rust::xxh64::xxh64;

/// Salt for path digests. Distinct from the zero seed used for object
/// checksums so the two digest spaces never collide.
pub const PATH_DIGEST_SEED: u64 = 1_103_515_245;

pub fn path_digest(path: &str) -> u64 {
    xxh64(path.as_bytes(), PATH_DIGEST_SEED)
}

pub fn name_digest(name: &str) -> u64 {
    xxh64(name.as_bytes(), 0)
}

/// Highest-random-weight ordering of cluster targets for a given object
/// uname. The first entry is the object's primary owner; slice placement
/// walks the list in order.
pub fn hrw_targets(uname: &str, smap: &Smap) -> Vec<Snode> {
    let mut weighted: Vec<(u64, &Snode)> = smap
        .tmap
        .values()
        .map(|node| {
            let key = format!("{}|{}", node.daemon_id, uname);
            (xxh64(key.as_bytes(), PATH_DIGEST_SEED), node)
        })
        .collect();
    weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.daemon_id.cmp(&b.1.daemon_id)));
    weighted.into_iter().map(|(_, node)| node.clone()).collect()
}

/// Same ordering with the local daemon excluded; used to pick slice and
/// replica destinations.
pub fn hrw_peers(uname: &str, smap: &Smap, self_id: &str) -> Vec<Snode> {
    hrw_targets(uname, smap)
        .into_iter()
        .filter(|node| node.daemon_id != self_id)
        .collect()
}
