//! Paged walk over the file catalog.
//!
//! One lister pages through `file/<prefix>` keys and feeds a pool of fetchers
//! that resolve each path's metadata. Items come out in no particular order.
//! A failed page ends the walk with an `Err`; a failed metadata read is
//! reported on its own item.

use crate::error::Result;
use crate::files::{FileCatalog, FileMeta};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_FETCHERS: usize = 8;

#[derive(Debug)]
pub struct WalkItem {
    pub path: String,
    pub meta: Result<FileMeta>,
}

#[derive(Clone)]
pub struct PathWalker {
    catalog: FileCatalog,
    page_size: usize,
    fetchers: usize,
}

impl PathWalker {
    pub fn new(catalog: FileCatalog) -> Self {
        Self {
            catalog,
            page_size: DEFAULT_PAGE_SIZE,
            fetchers: DEFAULT_FETCHERS,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_fetchers(mut self, fetchers: usize) -> Self {
        self.fetchers = fetchers.max(1);
        self
    }

    /// Walk every path under `prefix`, optionally resuming after `start_after`.
    /// The receiver closes once the walk is finished or cancelled.
    pub fn walk(
        &self,
        prefix: &str,
        start_after: Option<String>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<WalkItem>> {
        let (path_tx, path_rx) = mpsc::channel::<String>(self.page_size);
        let (out_tx, out_rx) = mpsc::channel(self.page_size);
        let path_rx = Arc::new(Mutex::new(path_rx));

        for _ in 0..self.fetchers {
            tokio::spawn(fetch_meta(
                self.catalog.clone(),
                path_rx.clone(),
                out_tx.clone(),
                cancel.clone(),
            ));
        }
        tokio::spawn(list_paths(
            self.catalog.clone(),
            prefix.to_string(),
            start_after,
            self.page_size,
            path_tx,
            out_tx,
            cancel,
        ));
        out_rx
    }
}

async fn list_paths(
    catalog: FileCatalog,
    prefix: String,
    mut after: Option<String>,
    page_size: usize,
    paths: mpsc::Sender<String>,
    out: mpsc::Sender<Result<WalkItem>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let page = match catalog
            .list_paths(&prefix, after.as_deref(), page_size)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!("path listing failed prefix={} error={}", prefix, error);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = out.send(Err(error)) => {}
                }
                return;
            }
        };

        let done = page.len() < page_size;
        for path in page {
            after = Some(path.clone());
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = paths.send(path) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
        if done {
            return;
        }
    }
}

async fn fetch_meta(
    catalog: FileCatalog,
    paths: Arc<Mutex<mpsc::Receiver<String>>>,
    out: mpsc::Sender<Result<WalkItem>>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut paths = paths.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                path = paths.recv() => path,
            }
        };
        let Some(path) = next else {
            return;
        };

        let meta = match catalog.get(&path).await {
            Ok(Some(meta)) => Ok(meta),
            // Unlinked since it was listed.
            Ok(None) => continue,
            Err(error) => Err(error),
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = out.send(Ok(WalkItem { path, meta })) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CairnError;
    use crate::keys;
    use crate::store::{
        KeyRange, MemoryStore, MetaStore, Precondition, Versioned, WriteOp, WriteOutcome,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn collect(mut rx: mpsc::Receiver<Result<WalkItem>>) -> Vec<Result<WalkItem>> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    async fn catalog_with(count: usize) -> (Arc<dyn MetaStore>, FileCatalog) {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryStore::new());
        let catalog = FileCatalog::new(store.clone());
        for i in 0..count {
            catalog
                .link(&format!("dir/{:03}", i), FileMeta::new("aa", i as u64))
                .await
                .unwrap();
        }
        (store, catalog)
    }

    #[tokio::test]
    async fn test_walk_visits_every_path_once() {
        let (_, catalog) = catalog_with(25).await;
        catalog.link("other/x", FileMeta::new("bb", 1)).await.unwrap();

        let walker = PathWalker::new(catalog).with_page_size(10).with_fetchers(3);
        let items = collect(walker.walk("dir/", None, CancellationToken::new())).await;

        let mut paths: Vec<String> = items
            .into_iter()
            .map(|item| item.unwrap().path)
            .collect();
        paths.sort();
        let expected: Vec<String> = (0..25).map(|i| format!("dir/{:03}", i)).collect();
        assert_eq!(paths, expected);
    }

    #[tokio::test]
    async fn test_walk_resumes_after_path() {
        let (_, catalog) = catalog_with(5).await;
        let walker = PathWalker::new(catalog).with_page_size(2);

        let items = collect(walker.walk("dir/", Some("dir/002".to_string()), CancellationToken::new())).await;
        let mut paths: Vec<String> = items.into_iter().map(|item| item.unwrap().path).collect();
        paths.sort();
        assert_eq!(paths, vec!["dir/003", "dir/004"]);
    }

    #[tokio::test]
    async fn test_bad_record_is_reported_on_its_item() {
        let (store, catalog) = catalog_with(3).await;
        store
            .set(&keys::file("dir/bad"), b"not json".to_vec(), None)
            .await
            .unwrap();

        let items = collect(PathWalker::new(catalog).walk("dir/", None, CancellationToken::new())).await;
        assert_eq!(items.len(), 4);
        let failed: Vec<&WalkItem> = items
            .iter()
            .map(|item| item.as_ref().unwrap())
            .filter(|item| item.meta.is_err())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].path, "dir/bad");
    }

    /// Memory store whose scans start failing after a number of calls.
    struct FlakyScanStore {
        inner: MemoryStore,
        scans_left: AtomicUsize,
    }

    #[async_trait]
    impl MetaStore for FlakyScanStore {
        async fn get(&self, key: &str) -> Result<Option<Versioned>> {
            self.inner.get(key).await
        }

        async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Versioned>> {
            self.inner.get_many(keys).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn write_if(
            &self,
            key: &str,
            precondition: Precondition,
            op: WriteOp,
        ) -> Result<WriteOutcome> {
            self.inner.write_if(key, precondition, op).await
        }

        async fn scan(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
            let left = self.scans_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(CairnError::Internal("scan failed".to_string()));
            }
            self.scans_left.store(left - 1, Ordering::SeqCst);
            self.inner.scan(range).await
        }
    }

    #[tokio::test]
    async fn test_page_error_ends_walk() {
        let store: Arc<dyn MetaStore> = Arc::new(FlakyScanStore {
            inner: MemoryStore::new(),
            scans_left: AtomicUsize::new(1),
        });
        let catalog = FileCatalog::new(store);
        for i in 0..4 {
            catalog
                .link(&format!("dir/{}", i), FileMeta::new("aa", 1))
                .await
                .unwrap();
        }

        let items = collect(
            PathWalker::new(catalog)
                .with_page_size(2)
                .walk("dir/", None, CancellationToken::new()),
        )
        .await;
        assert_eq!(items.iter().filter(|item| item.is_ok()).count(), 2);
        assert_eq!(items.iter().filter(|item| item.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_walk_closes() {
        let (_, catalog) = catalog_with(50).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items = collect(PathWalker::new(catalog).with_page_size(5).walk("dir/", None, cancel)).await;
        assert!(items.len() < 50);
    }
}
