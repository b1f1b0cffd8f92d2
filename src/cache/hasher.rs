use sha1::{Digest, Sha1};

/// Computes the SHA-1 digest of a fully-resident piece's block buffers.
///
/// `block_cache.cpp` does this inline on the thread calling `mark_as_done`,
/// with a comment that it should become a worker-thread operation instead.
/// Here it runs on the blocking pool so the owning cache task never stalls on
/// a multi-megabyte hash while other pieces are waiting on it.
pub async fn hash_resident_piece(buffers: Vec<Vec<u8>>) -> [u8; 20] {
    tokio::task::spawn_blocking(move || {
        let mut hasher = Sha1::new();
        for buf in &buffers {
            hasher.update(buf);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    })
    .await
    .expect("hashing task panicked")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matches_direct_sha1() {
        let buffers = vec![vec![1u8; 16384], vec![2u8; 16384]];
        let via_pool = hash_resident_piece(buffers.clone()).await;

        let mut hasher = Sha1::new();
        for buf in &buffers {
            hasher.update(buf);
        }
        let mut direct = [0u8; 20];
        direct.copy_from_slice(&hasher.finalize());

        assert_eq!(via_pool, direct);
    }
}
