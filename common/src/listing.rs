//! Sorted listing of a whole storage
//!
//! Storages that can list one directory level at a time are listed concurrently: every prefix
//! down to the configured depth gets its own task and the results are stitched back together in
//! key order. Everything else falls back to the storage's own `list_all` stream.

use async_recursion::async_recursion;
use std::sync::Arc;
use tracing::instrument;

use crate::object::{Entry, EntryStream, ObjectStorage, Result};

const CHANNEL_SIZE: usize = 1000;

enum Segment {
    Entry(Entry),
    Subtree(EntryStream),
}

/// List every key of `storage` in sorted order.
#[instrument(skip(storage), fields(storage = %storage))]
pub async fn list_sorted(
    storage: &Arc<dyn ObjectStorage>,
    threads: usize,
    depth: usize,
) -> Result<EntryStream> {
    if depth == 0 || storage.as_directory_lister().is_none() {
        tracing::debug!("listing {} sequentially", storage);
        return storage.list_all("", "").await;
    }
    tracing::debug!(
        "listing {} with {} threads down to depth {}",
        storage,
        threads,
        depth
    );
    let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_SIZE);
    let permits = Arc::new(tokio::sync::Semaphore::new(threads.max(1)));
    tokio::spawn(list_level(
        storage.clone(),
        String::new(),
        depth,
        permits,
        tx,
    ));
    Ok(rx)
}

#[async_recursion]
async fn list_level(
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
    depth: usize,
    permits: Arc<tokio::sync::Semaphore>,
    tx: tokio::sync::mpsc::Sender<Result<Entry>>,
) {
    let listed = {
        // the semaphore is never closed
        let _permit = permits.acquire().await.ok();
        match storage.as_directory_lister() {
            Some(lister) => lister.list_delimited(&prefix).await,
            None => Ok(vec![]),
        }
    };
    let entries = match listed {
        Ok(entries) => entries,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };
    let mut segments = Vec::with_capacity(entries.len());
    for entry in entries {
        if !entry.is_prefix || entry.key == prefix {
            segments.push(Segment::Entry(entry));
            continue;
        }
        let (sub_tx, sub_rx) = tokio::sync::mpsc::channel(CHANNEL_SIZE);
        if depth > 1 {
            tokio::spawn(list_level(
                storage.clone(),
                entry.key,
                depth - 1,
                permits.clone(),
                sub_tx,
            ));
        } else {
            tokio::spawn(forward_all(storage.clone(), entry.key, sub_tx));
        }
        segments.push(Segment::Subtree(sub_rx));
    }
    for segment in segments {
        match segment {
            Segment::Entry(entry) => {
                if tx.send(Ok(entry)).await.is_err() {
                    return;
                }
            }
            Segment::Subtree(mut rx) => {
                while let Some(item) = rx.recv().await {
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                }
            }
        }
    }
}

async fn forward_all(
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
    tx: tokio::sync::mpsc::Sender<Result<Entry>>,
) {
    let mut rx = match storage.list_all(&prefix, "").await {
        Ok(rx) => rx,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };
    while let Some(item) = rx.recv().await {
        if tx.send(item).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemStorage;
    use proptest::prelude::*;

    async fn collect(mut rx: EntryStream) -> Vec<String> {
        let mut keys = Vec::new();
        while let Some(entry) = rx.recv().await {
            keys.push(entry.unwrap().key);
        }
        keys
    }

    fn storage(keys: &[&str]) -> Arc<dyn ObjectStorage> {
        let mem = MemStorage::new("list");
        for key in keys {
            mem.insert(key, "x", 0);
        }
        Arc::new(mem)
    }

    #[tokio::test]
    async fn concurrent_listing_keeps_order() {
        let keys = [
            "a", "a-1", "a/", "a/b/c", "a/b/d", "a/e", "b/x/y/z", "b0", "c/",
        ];
        let storage = storage(&keys);
        for depth in 0..4 {
            for threads in [1, 4] {
                let listed = collect(list_sorted(&storage, threads, depth).await.unwrap()).await;
                assert_eq!(listed, keys, "depth {depth} threads {threads}");
            }
        }
    }

    proptest! {
        #[test]
        fn matches_sequential_listing(
            keys in proptest::collection::btree_set("[ab]{1,2}(/[ab]{1,2}){0,3}/?", 0..40),
            depth in 0usize..4,
            threads in 1usize..4,
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .build()
                .unwrap();
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            let storage = storage(&keys);
            let (sequential, concurrent) = runtime.block_on(async {
                let sequential = collect(storage.list_all("", "").await.unwrap()).await;
                let concurrent =
                    collect(list_sorted(&storage, threads, depth).await.unwrap()).await;
                (sequential, concurrent)
            });
            prop_assert_eq!(sequential, concurrent);
        }
    }
}
