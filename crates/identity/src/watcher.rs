//! The watch loop keeping the cache current.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::IdentityCache;
use crate::source::IdentitySource;

/// Tuning knobs for the watch loop.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Full re-list interval guarding against missed deltas.
    pub resync_interval: Duration,
    /// Delay before retrying after a failed list or broken watch stream.
    pub retry_backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60 * 60),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Owns at most one running watch task against the identity source.
///
/// Reconfiguration must fully stop the previous watch before starting a new
/// one; both transitions happen under this type's own mutex so two watches
/// against different hosts can never run concurrently.
pub struct IdentityWatcher {
    cache: Arc<IdentityCache>,
    config: WatcherConfig,
    active: tokio::sync::Mutex<Option<WatchHandle>>,
}

struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl IdentityWatcher {
    /// A watcher feeding `cache`, with default tuning.
    pub fn new(cache: Arc<IdentityCache>) -> Self {
        Self::with_config(cache, WatcherConfig::default())
    }

    /// A watcher feeding `cache` with explicit tuning.
    pub fn with_config(cache: Arc<IdentityCache>, config: WatcherConfig) -> Self {
        Self {
            cache,
            config,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// The cache this watcher maintains.
    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Stop any running watch, then start watching `source`.
    pub async fn restart(&self, source: Arc<dyn IdentitySource>) {
        let mut active = self.active.lock().await;
        stop_handle(active.take()).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_loop(
            source,
            Arc::clone(&self.cache),
            self.config.clone(),
            cancel.clone(),
        ));
        *active = Some(WatchHandle { cancel, task });
        info!("identity watch started");
    }

    /// Stop the running watch, if any, and wait for it to wind down.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        stop_handle(active.take()).await;
    }

    /// Whether a watch task is currently registered.
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

async fn stop_handle(handle: Option<WatchHandle>) {
    if let Some(WatchHandle { cancel, task }) = handle {
        cancel.cancel();
        if task.await.is_err() {
            warn!("identity watch task panicked during shutdown");
        }
        info!("identity watch stopped");
    }
}

async fn watch_loop(
    source: Arc<dyn IdentitySource>,
    cache: Arc<IdentityCache>,
    config: WatcherConfig,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // List, replace the cache, then consume deltas from that version.
        let list = tokio::select! {
            () = cancel.cancelled() => return,
            list = source.list() => list,
        };
        let list = match list {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "identity list failed; backing off");
                if sleep_or_cancelled(config.retry_backoff, &cancel).await {
                    return;
                }
                continue;
            }
        };
        debug!(count = list.items.len(), "identity list complete");
        cache.replace_all(list.items).await;

        let stream = tokio::select! {
            () = cancel.cancelled() => return,
            stream = source.watch(&list.resource_version) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "identity watch failed to start; backing off");
                if sleep_or_cancelled(config.retry_backoff, &cancel).await {
                    return;
                }
                continue;
            }
        };

        let resync = tokio::time::sleep(config.resync_interval);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = &mut resync => {
                    debug!("periodic full resync");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => cache.apply(event).await,
                    Some(Err(err)) => {
                        warn!(error = %err, "identity watch stream failed; re-listing");
                        if sleep_or_cancelled(config.retry_backoff, &cancel).await {
                            return;
                        }
                        break;
                    }
                    None => {
                        debug!("identity watch stream ended; re-listing");
                        break;
                    }
                },
            }
        }
    }
}

/// Sleep for `duration`; returns true when cancelled instead.
async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::IdentityObject;
    use crate::source::{EventStream, IdentityList, WatchEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn object(name: &str) -> IdentityObject {
        IdentityObject {
            namespace: Some("ns".to_string()),
            name: name.to_string(),
            annotations: std::collections::BTreeMap::new(),
        }
    }

    /// Source that serves one list, then a watch stream carrying one add and
    /// staying open.
    struct ScriptedSource {
        lists: AtomicUsize,
        watches: AtomicUsize,
    }

    #[async_trait]
    impl IdentitySource for ScriptedSource {
        async fn list(&self) -> crate::Result<IdentityList> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(IdentityList {
                resource_version: "v1".to_string(),
                items: vec![object("listed")],
            })
        }

        async fn watch(&self, resource_version: &str) -> crate::Result<EventStream> {
            assert_eq!(resource_version, "v1");
            self.watches.fetch_add(1, Ordering::SeqCst);
            let events = vec![Ok(WatchEvent::Added(object("watched")))];
            // Keep the stream open after the scripted events so the loop
            // parks in select! instead of immediately re-listing.
            let stream = futures::stream::iter(events).chain(futures::stream::pending());
            Ok(Box::pin(stream))
        }
    }

    #[tokio::test]
    async fn restart_stops_previous_watch_before_starting() {
        let cache = Arc::new(IdentityCache::new());
        let watcher = IdentityWatcher::with_config(
            Arc::clone(&cache),
            WatcherConfig {
                resync_interval: Duration::from_secs(3600),
                retry_backoff: Duration::from_millis(10),
            },
        );

        let first = Arc::new(ScriptedSource {
            lists: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
        });
        watcher.restart(Arc::clone(&first) as Arc<dyn IdentitySource>).await;
        assert!(watcher.is_running().await);

        // Let the first watch get going.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.lists.load(Ordering::SeqCst), 1);
        assert!(cache.get("ns/listed").await.is_some());
        assert!(cache.get("ns/watched").await.is_some());

        let second = Arc::new(ScriptedSource {
            lists: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
        });
        watcher.restart(Arc::clone(&second) as Arc<dyn IdentitySource>).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The first source is no longer being consumed; the second is.
        assert_eq!(first.lists.load(Ordering::SeqCst), 1);
        assert_eq!(second.lists.load(Ordering::SeqCst), 1);

        watcher.stop().await;
        assert!(!watcher.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let watcher = IdentityWatcher::new(Arc::new(IdentityCache::new()));
        watcher.stop().await;
        assert!(!watcher.is_running().await);
    }
}
