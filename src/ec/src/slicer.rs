use ostore_lib::{StoreError, StoreResult};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Reed-Solomon split/parity math behind the encode and restore pipelines.
pub struct Slicer {
    data: usize,
    parity: usize,
    rs: ReedSolomon,
}

impl Slicer {
    pub fn new(data: usize, parity: usize) -> StoreResult<Self> {
        let rs = ReedSolomon::new(data, parity)
            .map_err(|e| StoreError::InvalidParam(format!("bad slice counts {}+{}: {}", data, parity, e)))?;
        Ok(Self { data, parity, rs })
    }

    pub fn data(&self) -> usize {
        self.data
    }

    pub fn parity(&self) -> usize {
        self.parity
    }

    pub fn total(&self) -> usize {
        self.data + self.parity
    }

    /// Every slice of an object of `obj_size` bytes has this length; the
    /// last data slice is zero-padded up to it.
    pub fn slice_size(&self, obj_size: usize) -> usize {
        obj_size.div_ceil(self.data).max(1)
    }

    /// Splits the payload into `data` equal slices and appends `parity`
    /// parity slices.
    pub fn encode(&self, payload: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let slice_size = self.slice_size(payload.len());
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total());
        for i in 0..self.data {
            let start = i * slice_size;
            let end = ((i + 1) * slice_size).min(payload.len());
            let mut shard = if start < payload.len() {
                payload[start..end].to_vec()
            } else {
                Vec::new()
            };
            shard.resize(slice_size, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity {
            shards.push(vec![0u8; slice_size]);
        }
        self.rs
            .encode(&mut shards)
            .map_err(|e| StoreError::Internal(format!("encode: {}", e)))?;
        Ok(shards)
    }

    /// Rebuilds the original payload from any `data` surviving slices.
    /// `shards` is indexed by slice id - 1; missing entries are None.
    pub fn reconstruct(&self, mut shards: Vec<Option<Vec<u8>>>, obj_size: usize) -> StoreResult<Vec<u8>> {
        if shards.len() != self.total() {
            return Err(StoreError::InvalidParam(format!(
                "expected {} shards, got {}",
                self.total(),
                shards.len()
            )));
        }
        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < self.data {
            return Err(StoreError::NotEnoughSlices(format!(
                "{} of {} data slices available",
                present, self.data
            )));
        }
        self.rs
            .reconstruct(&mut shards)
            .map_err(|e| StoreError::NotEnoughSlices(format!("reconstruct: {}", e)))?;

        let mut payload = Vec::with_capacity(obj_size);
        for shard in shards.into_iter().take(self.data) {
            payload.extend_from_slice(&shard.expect("reconstructed"));
        }
        payload.truncate(obj_size);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_reconstruct_roundtrip() {
        let slicer = Slicer::new(2, 2).unwrap();
        let payload: Vec<u8> = (0..10_001u32).map(|i| (i % 251) as u8).collect();
        let shards = slicer.encode(&payload).unwrap();
        assert_eq!(shards.len(), 4);
        let slice_size = slicer.slice_size(payload.len());
        assert!(shards.iter().all(|s| s.len() == slice_size));

        // loses as many slices as there is parity: still restorable
        let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        partial[0] = None;
        partial[3] = None;
        let restored = slicer.reconstruct(partial, payload.len()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_too_many_losses_fail() {
        let slicer = Slicer::new(2, 1).unwrap();
        let payload = vec![9u8; 4096];
        let shards = slicer.encode(&payload).unwrap();

        let mut partial: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        partial[0] = None;
        partial[2] = None;
        match slicer.reconstruct(partial, payload.len()) {
            Err(StoreError::NotEnoughSlices(_)) => {}
            other => panic!("expected NotEnoughSlices, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_tiny_objects_pad() {
        let slicer = Slicer::new(4, 2).unwrap();
        let payload = b"ab".to_vec();
        let shards = slicer.encode(&payload).unwrap();
        assert_eq!(shards.len(), 6);

        let partial: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        let restored = slicer.reconstruct(partial, payload.len()).unwrap();
        assert_eq!(restored, payload);
    }
}
