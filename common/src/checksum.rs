use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::object::ObjectStorage;

const BUFFER_SIZE: usize = 1 << 20;

/// Size and SHA-256 digest of a stored object, computed while streaming it.
pub async fn sha256(storage: &dyn ObjectStorage, key: &str) -> anyhow::Result<(u64, Vec<u8>)> {
    let mut reader = storage.get(key, 0, None).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((total, hasher.finalize().to_vec()))
}

/// True when both objects have the same size and content.
pub async fn same_content(
    src: &dyn ObjectStorage,
    dst: &dyn ObjectStorage,
    key: &str,
) -> anyhow::Result<bool> {
    let (src_sum, dst_sum) = tokio::try_join!(sha256(src, key), sha256(dst, key))?;
    if src_sum != dst_sum {
        tracing::debug!(
            "{} differs: {} bytes {} vs {} bytes {}",
            key,
            src_sum.0,
            hex::encode(&src_sum.1),
            dst_sum.0,
            hex::encode(&dst_sum.1)
        );
    }
    Ok(src_sum == dst_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemStorage;

    #[tokio::test]
    async fn digest_of_known_input() {
        let storage = MemStorage::new("sum");
        storage.insert("k", "hello world", 0);
        let (size, digest) = sha256(&storage, "k").await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(
            hex::encode(digest),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn compares_both_sides() {
        let src = MemStorage::new("src");
        let dst = MemStorage::new("dst");
        src.insert("same", "abc", 0);
        dst.insert("same", "abc", 5);
        src.insert("diff", "abc", 0);
        dst.insert("diff", "abd", 0);
        assert!(same_content(&src, &dst, "same").await.unwrap());
        assert!(!same_content(&src, &dst, "diff").await.unwrap());
        assert!(same_content(&src, &dst, "missing").await.is_err());
    }
}
