//! Background task keeping the routing table in step with the cache.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::domain::routing::{SharedRoutingTable, Snapshot};
use crate::domain::service::decode_services;
use crate::error::{CacheError, SyncError};
use crate::sync::cache::Cache;

/// Where the service list lives and how to follow changes to it.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Key holding the serialized service list.
    pub services_key: String,
    /// Channel the producer publishes on after changing the list.
    pub channel: String,
    /// Pause between a lost subscription and the next attempt.
    pub retry_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            services_key: "services".to_string(),
            channel: "inress-router".to_string(),
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// The single writer of the routing table.
///
/// Every notification triggers a full reload of the service list rather than
/// applying a delta, so a missed message can never leave the table drifting.
pub struct SyncLoop<C> {
    cache: C,
    table: SharedRoutingTable,
    config: SyncConfig,
}

impl<C: Cache> SyncLoop<C> {
    /// Create a sync loop writing into `table`.
    pub fn new(cache: C, table: SharedRoutingTable, config: SyncConfig) -> Self {
        Self { cache, table, config }
    }

    /// Fetch, decode and install the full service list once.
    ///
    /// On error the table is left exactly as it was.
    pub async fn reload(&self) -> Result<Arc<Snapshot>, SyncError> {
        let payload = self.cache.get(&self.config.services_key).await?;
        let services = decode_services(&payload)?;
        Ok(self.table.update(&services)?)
    }

    async fn apply(&self) {
        match self.reload().await {
            Ok(snapshot) => info!(
                plain = snapshot.plain_routes(),
                secure = snapshot.secure_routes(),
                "routes updated"
            ),
            Err(e) => warn!(error = %e, "failed to sync services, keeping previous routes"),
        }
    }

    /// Follow the notification channel until the subscription is lost,
    /// reloading on every message. Returns why the subscription ended.
    pub async fn follow(&self) -> CacheError {
        let mut notifications = match self.cache.subscribe(&self.config.channel).await {
            Ok(notifications) => notifications,
            Err(e) => return e,
        };
        info!(channel = %self.config.channel, "subscribed to service updates");

        while let Some(notification) = notifications.next().await {
            match notification {
                Ok(()) => self.apply().await,
                Err(e) => return e,
            }
        }

        CacheError::Closed
    }

    /// Run for the lifetime of the process.
    pub async fn run(self) {
        self.apply().await;

        loop {
            let err = self.follow().await;
            warn!(
                error = %err,
                retry_in = ?self.config.retry_interval,
                "subscription to updates lost, retrying"
            );
            time::sleep(self.config.retry_interval).await;
        }
    }
}

impl<C: Cache + 'static> SyncLoop<C> {
    /// Spawn the loop as a background Tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::routing::RoutingTable;
    use crate::sync::cache::Notifications;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    const PLAIN_A: &str = r#"[{"hostnames":["a.example"],"target":{"kind":"forward","address":"http://backend-a"}}]"#;
    const PLAIN_B: &str = r#"[{"hostnames":["b.example"],"target":{"kind":"forward","address":"http://backend-b"}}]"#;

    /// What the next `subscribe` call should do.
    enum Script {
        Fail,
        Stream(mpsc::UnboundedReceiver<Result<(), CacheError>>),
    }

    #[derive(Default)]
    struct FakeCache {
        payload: Mutex<Option<String>>,
        scripts: Mutex<VecDeque<Script>>,
        subscribe_calls: Mutex<Vec<Instant>>,
    }

    impl FakeCache {
        fn set_payload(&self, payload: Option<&str>) {
            *self.payload.lock().unwrap() = payload.map(str::to_string);
        }

        fn push_stream(&self) -> mpsc::UnboundedSender<Result<(), CacheError>> {
            let (tx, rx) = mpsc::unbounded();
            self.scripts.lock().unwrap().push_back(Script::Stream(rx));
            tx
        }

        fn subscribe_calls(&self) -> Vec<Instant> {
            self.subscribe_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Cache for Arc<FakeCache> {
        async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
            assert_eq!(key, "services");
            match self.payload.lock().unwrap().clone() {
                Some(payload) => Ok(Bytes::from(payload)),
                None => Err(CacheError::Closed),
            }
        }

        async fn subscribe(&self, channel: &str) -> Result<Notifications, CacheError> {
            assert_eq!(channel, "inress-router");
            self.subscribe_calls.lock().unwrap().push(Instant::now());
            match self.scripts.lock().unwrap().pop_front() {
                Some(Script::Stream(rx)) => Ok(rx.boxed()),
                Some(Script::Fail) | None => Err(CacheError::Protocol("refused".into())),
            }
        }
    }

    fn setup() -> (Arc<FakeCache>, SharedRoutingTable, SyncLoop<Arc<FakeCache>>) {
        let cache = Arc::new(FakeCache::default());
        let table = Arc::new(RoutingTable::new());
        let sync = SyncLoop::new(Arc::clone(&cache), Arc::clone(&table), SyncConfig::default());
        (cache, table, sync)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !condition() {
                time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_reload_installs_services() {
        let (cache, table, sync) = setup();
        cache.set_payload(Some(PLAIN_A));

        let snapshot = sync.reload().await.unwrap();
        assert_eq!(snapshot.plain_routes(), 1);
        assert!(table.resolve("a.example", false).is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_table() {
        let (cache, table, sync) = setup();
        cache.set_payload(Some(PLAIN_A));
        sync.reload().await.unwrap();

        cache.set_payload(None);
        assert!(matches!(sync.reload().await, Err(SyncError::Fetch(_))));
        assert!(table.resolve("a.example", false).is_some());
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_table() {
        let (cache, table, sync) = setup();
        cache.set_payload(Some(PLAIN_A));
        sync.reload().await.unwrap();

        cache.set_payload(Some(r#"[{"hostnames":"#));
        assert!(matches!(sync.reload().await, Err(SyncError::Decode(_))));
        assert!(table.resolve("a.example", false).is_some());
    }

    #[tokio::test]
    async fn test_invalid_services_keep_table() {
        let (cache, table, sync) = setup();
        cache.set_payload(Some(PLAIN_A));
        sync.reload().await.unwrap();

        cache.set_payload(Some(r#"[{"hostnames":["s.example"],"mode":"secure","target":{"kind":"static","status":200}}]"#));
        assert!(matches!(sync.reload().await, Err(SyncError::Table(_))));
        assert!(table.resolve("a.example", false).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_trigger_reload() {
        let (cache, table, sync) = setup();
        cache.set_payload(Some(PLAIN_A));
        let notify = cache.push_stream();

        let handle = sync.spawn();
        wait_until(|| table.resolve("a.example", false).is_some()).await;

        cache.set_payload(Some(PLAIN_B));
        notify.unbounded_send(Ok(())).unwrap();
        wait_until(|| table.resolve("b.example", false).is_some()).await;
        assert!(table.resolve("a.example", false).is_none());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_still_subscribes() {
        let (cache, table, sync) = setup();
        let notify = cache.push_stream();

        let handle = sync.spawn();
        wait_until(|| cache.subscribe_calls().len() == 1).await;
        assert!(table.resolve("a.example", false).is_none());

        cache.set_payload(Some(PLAIN_A));
        notify.unbounded_send(Ok(())).unwrap();
        wait_until(|| table.resolve("a.example", false).is_some()).await;

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_subscription_resubscribes_after_backoff() {
        let (cache, table, sync) = setup();
        cache.set_payload(Some(PLAIN_A));
        let first = cache.push_stream();
        let second = cache.push_stream();

        let handle = sync.spawn();
        wait_until(|| cache.subscribe_calls().len() == 1).await;

        first.unbounded_send(Err(CacheError::Closed)).unwrap();
        time::sleep(Duration::from_secs(11)).await;
        let calls = cache.subscribe_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_secs(10));

        cache.set_payload(Some(PLAIN_B));
        second.unbounded_send(Ok(())).unwrap();
        wait_until(|| table.resolve("b.example", false).is_some()).await;

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_subscribe_failures_do_not_busy_loop() {
        let (cache, _table, sync) = setup();
        cache.scripts.lock().unwrap().extend([Script::Fail, Script::Fail, Script::Fail]);

        let start = Instant::now();
        let handle = sync.spawn();
        time::sleep(Duration::from_secs(35)).await;
        handle.abort();

        let calls = cache.subscribe_calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0] - start < Duration::from_secs(1));
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(10));
        }
    }
}
