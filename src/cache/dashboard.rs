//! Dashboard state cache
//!
//! Composes one [`TtlCache`] per dashboard domain with the loaders that fill
//! it from the REST API, and accepts server-pushed deltas from the
//! connection manager's dispatch path.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ttl::TtlCache;
use crate::protocol::kinds;
use crate::types::Result;

/// Dashboard data domains, each with its own TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Services,
    Metrics,
    Users,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Services, Domain::Metrics, Domain::Users];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Services => "services",
            Domain::Metrics => "metrics",
            Domain::Users => "users",
        }
    }

    /// Domain fed by a live-update message kind
    pub fn from_kind(kind: &str) -> Option<Domain> {
        match kind {
            kinds::SERVICE_UPDATE => Some(Domain::Services),
            kinds::METRICS_UPDATE => Some(Domain::Metrics),
            kinds::USER_UPDATE => Some(Domain::Users),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        match self {
            Domain::Services => 0,
            Domain::Metrics => 1,
            Domain::Users => 2,
        }
    }
}

/// TTLs and housekeeping intervals
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub services_ttl: Duration,
    pub metrics_ttl: Duration,
    pub users_ttl: Duration,
    pub sweep_interval: Duration,
    /// Capacity of the recent-log ring
    pub max_recent_logs: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            services_ttl: Duration::from_secs(30),
            metrics_ttl: Duration::from_secs(10),
            users_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            max_recent_logs: 500,
        }
    }
}

impl DashboardConfig {
    pub fn ttl(&self, domain: Domain) -> Duration {
        match domain {
            Domain::Services => self.services_ttl,
            Domain::Metrics => self.metrics_ttl,
            Domain::Users => self.users_ttl,
        }
    }
}

/// Busy/error state of one domain, for rendering spinners and banners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    pub loading: bool,
    pub error: Option<String>,
    /// Unix timestamp (ms) of the last successful load
    pub last_loaded_at: Option<i64>,
}

/// Receiver of server-pushed deltas routed by the connection manager
pub trait LiveUpdateSink: Send + Sync {
    fn apply_live_update(&self, domain: Domain, value: Value);

    /// Append a pushed log line. Ignored unless the sink keeps logs.
    fn append_log(&self, _entry: Value) {}
}

#[derive(Default)]
struct SlotState {
    status: DomainStatus,
    /// Loads started and not yet finished or dropped
    in_flight: usize,
}

struct DomainSlot {
    domain: Domain,
    ttl: Duration,
    cache: Arc<TtlCache<Domain, Value>>,
    state: Mutex<SlotState>,
}

/// Marks one load as running for as long as it lives
struct InFlight<'a> {
    state: &'a Mutex<SlotState>,
}

impl<'a> InFlight<'a> {
    fn enter(state: &'a Mutex<SlotState>) -> Self {
        let mut guard = state.lock();
        guard.in_flight += 1;
        guard.status.loading = true;
        Self { state }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.state.lock();
        guard.in_flight -= 1;
        guard.status.loading = guard.in_flight > 0;
    }
}

/// Application-level cache for services, metrics and users
pub struct DashboardCache {
    config: DashboardConfig,
    slots: [DomainSlot; 3],
    logs: Mutex<VecDeque<Value>>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl DashboardCache {
    pub fn new() -> Self {
        Self::with_config(DashboardConfig::default())
    }

    pub fn with_config(config: DashboardConfig) -> Self {
        let slots = Domain::ALL.map(|domain| DomainSlot {
            domain,
            ttl: config.ttl(domain),
            cache: Arc::new(TtlCache::new()),
            state: Mutex::new(SlotState::default()),
        });
        Self {
            config,
            slots,
            logs: Mutex::new(VecDeque::new()),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    fn slot(&self, domain: Domain) -> &DomainSlot {
        &self.slots[domain.index()]
    }

    /// Cached value for `domain`, or the loader's result when the cache is
    /// empty, expired, or `force` is set.
    ///
    /// Overlapping loads each run their own loader. The domain reports
    /// `loading` until the last of them finishes.
    pub async fn load<F, Fut>(&self, domain: Domain, loader: F, force: bool) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let slot = self.slot(domain);
        if !force {
            if let Some(value) = slot.cache.get(&slot.domain) {
                return Ok(value);
            }
        }

        let result = {
            let _in_flight = InFlight::enter(&slot.state);
            loader().await
        };

        let mut state = slot.state.lock();
        let status = &mut state.status;
        match result {
            Ok(value) => {
                slot.cache.set(slot.domain, value.clone(), slot.ttl);
                status.error = None;
                status.last_loaded_at = Some(chrono::Utc::now().timestamp_millis());
                debug!(domain = domain.as_str(), "dashboard domain loaded");
                Ok(value)
            }
            Err(e) => {
                warn!(domain = domain.as_str(), error = %e, "dashboard loader failed");
                status.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// [`load`](Self::load) and deserialize into `T`
    pub async fn load_as<T, F, Fut>(&self, domain: Domain, loader: F, force: bool) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let value = self.load(domain, loader, force).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn status(&self, domain: Domain) -> DomainStatus {
        self.slot(domain).state.lock().status.clone()
    }

    /// Live cached value without invoking a loader
    pub fn get(&self, domain: Domain) -> Option<Value> {
        let slot = self.slot(domain);
        slot.cache.get(&slot.domain)
    }

    pub fn invalidate(&self, domain: Domain) {
        let slot = self.slot(domain);
        slot.cache.remove(&slot.domain);
    }

    /// Underlying TTL cache, for binding UI observers
    pub fn cache(&self, domain: Domain) -> Arc<TtlCache<Domain, Value>> {
        self.slot(domain).cache.clone()
    }

    pub fn services(&self) -> Option<Value> {
        self.get(Domain::Services)
    }

    pub fn metrics(&self) -> Option<Value> {
        self.get(Domain::Metrics)
    }

    pub fn users(&self) -> Option<Value> {
        self.get(Domain::Users)
    }

    /// One service from the cached collection
    pub fn service(&self, id: &str) -> Option<Value> {
        let services = self.services()?;
        services
            .as_array()?
            .iter()
            .find(|item| item.get("id").and_then(Value::as_str) == Some(id))
            .cloned()
    }

    /// Count of cached services per `status` value
    pub fn service_status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        let Some(Value::Array(services)) = self.services() else {
            return counts;
        };
        for service in &services {
            let status = service
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            *counts.entry(status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Most recent pushed log lines, oldest first
    pub fn recent_logs(&self) -> Vec<Value> {
        self.logs.lock().iter().cloned().collect()
    }

    /// Start one expiry sweeper per domain. Stopped on drop.
    pub fn start_sweepers(&self) {
        let mut sweepers = self.sweepers.lock();
        if !sweepers.is_empty() {
            return;
        }
        for slot in &self.slots {
            sweepers.push(slot.cache.spawn_sweeper(self.config.sweep_interval));
        }
    }

    pub fn stop_sweepers(&self) {
        for handle in self.sweepers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl LiveUpdateSink for DashboardCache {
    fn apply_live_update(&self, domain: Domain, value: Value) {
        let slot = self.slot(domain);
        slot.cache.upsert(slot.domain, slot.ttl, |current| match current {
            None if is_item(&value) => {
                debug!(
                    domain = domain.as_str(),
                    "no cached collection, dropping item update until next load"
                );
                None
            }
            current => Some(merge_by_id(current, value)),
        });
    }

    fn append_log(&self, entry: Value) {
        let mut logs = self.logs.lock();
        logs.push_back(entry);
        while logs.len() > self.config.max_recent_logs {
            logs.pop_front();
        }
    }
}

impl Default for DashboardCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DashboardCache {
    fn drop(&mut self) {
        self.stop_sweepers();
    }
}

/// A single collection member, as opposed to a whole domain value
fn is_item(value: &Value) -> bool {
    value.get("id").is_some()
}

/// Merge a delta into a cached collection by `id`.
///
/// Object fields of a matching item are overwritten one by one; items
/// without a match are appended. Non-array cached values are replaced by
/// whole values and kept as they are for item deltas.
fn merge_by_id(current: Option<Value>, update: Value) -> Value {
    let mut items = match current {
        Some(Value::Array(items)) => items,
        Some(current) if is_item(&update) => return current,
        _ => return update,
    };

    let updates = match update {
        Value::Array(updates) => updates,
        other => vec![other],
    };

    for update in updates {
        let id = update.get("id").cloned();
        let position = id
            .as_ref()
            .and_then(|id| items.iter().position(|item| item.get("id") == Some(id)));

        match (position, update) {
            (Some(pos), Value::Object(fields)) => match &mut items[pos] {
                Value::Object(existing) => existing.extend(fields),
                slot => *slot = Value::Object(fields),
            },
            (Some(pos), other) => items[pos] = other,
            (None, other) => items.push(other),
        }
    }

    Value::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio::time::advance;

    fn services() -> Value {
        json!([
            {"id": "web", "status": "running", "image": "nginx"},
            {"id": "db", "status": "stopped", "image": "postgres"}
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_uses_cache_until_expiry() {
        let cache = DashboardCache::new();
        let calls = AtomicUsize::new(0);
        let loader = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(services())
        };

        cache.load(Domain::Services, loader, false).await.unwrap();
        cache.load(Domain::Services, loader, false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(31)).await;
        cache.load(Domain::Services, loader, false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_bypasses_cache() {
        let cache = DashboardCache::new();
        cache
            .load(Domain::Users, || async { Ok(json!([{"id": "u1"}])) }, false)
            .await
            .unwrap();

        let value = cache
            .load(Domain::Users, || async { Ok(json!([{"id": "u2"}])) }, true)
            .await
            .unwrap();
        assert_eq!(value, json!([{"id": "u2"}]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_error_is_recorded() {
        let cache = DashboardCache::new();
        let result = cache
            .load(
                Domain::Metrics,
                || async { Err(SyncError::Loader("502 Bad Gateway".to_string())) },
                false,
            )
            .await;

        assert!(result.is_err());
        let status = cache.status(Domain::Metrics);
        assert!(!status.loading);
        assert_eq!(status.error.as_deref(), Some("loader failed: 502 Bad Gateway"));

        cache
            .load(Domain::Metrics, || async { Ok(json!({"cpu": 0.4})) }, false)
            .await
            .unwrap();
        assert_eq!(cache.status(Domain::Metrics).error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_loads_stay_loading_until_last_finishes() {
        let cache = Arc::new(DashboardCache::new());
        let (first_tx, first_rx) = oneshot::channel::<Value>();
        let (second_tx, second_rx) = oneshot::channel::<Value>();

        let spawn_load = |rx: oneshot::Receiver<Value>| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .load(
                        Domain::Services,
                        || async move { rx.await.map_err(|e| SyncError::Loader(e.to_string())) },
                        true,
                    )
                    .await
            })
        };
        let first = spawn_load(first_rx);
        let second = spawn_load(second_rx);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(cache.status(Domain::Services).loading);

        first_tx.send(json!([{"id": "web"}])).unwrap();
        first.await.unwrap().unwrap();
        assert!(cache.status(Domain::Services).loading);

        second_tx.send(services()).unwrap();
        second.await.unwrap().unwrap();
        let status = cache.status(Domain::Services);
        assert!(!status.loading);
        assert!(status.last_loaded_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_load_clears_loading() {
        let cache = DashboardCache::new();
        let (_tx, rx) = oneshot::channel::<Value>();
        let load = cache.load(
            Domain::Users,
            || async move { rx.await.map_err(|e| SyncError::Loader(e.to_string())) },
            false,
        );

        let timed_out = tokio::time::timeout(Duration::from_secs(1), load).await;
        assert!(timed_out.is_err());
        assert!(!cache.status(Domain::Users).loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_update_merges_by_id() {
        let cache = DashboardCache::new();
        cache
            .load(Domain::Services, || async { Ok(services()) }, false)
            .await
            .unwrap();

        cache.apply_live_update(Domain::Services, json!({"id": "db", "status": "running"}));
        cache.apply_live_update(Domain::Services, json!({"id": "cache", "status": "running"}));

        let db = cache.service("db").unwrap();
        assert_eq!(db["status"], "running");
        assert_eq!(db["image"], "postgres");
        assert_eq!(cache.services().unwrap().as_array().unwrap().len(), 3);
        assert_eq!(cache.service_status_counts().get("running"), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_update_refreshes_expiry() {
        let cache = DashboardCache::new();
        cache
            .load(Domain::Services, || async { Ok(services()) }, false)
            .await
            .unwrap();

        advance(Duration::from_secs(25)).await;
        cache.apply_live_update(Domain::Services, json!({"id": "web", "status": "restarting"}));
        advance(Duration::from_secs(25)).await;

        assert_eq!(cache.service("web").unwrap()["status"], "restarting");
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_update_replaces_non_collection() {
        let cache = DashboardCache::new();
        cache.apply_live_update(Domain::Metrics, json!({"cpu": 0.1}));
        cache.apply_live_update(Domain::Metrics, json!({"cpu": 0.9}));
        assert_eq!(cache.metrics(), Some(json!({"cpu": 0.9})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_update_before_load_does_not_shadow_loader() {
        let cache = DashboardCache::new();
        let calls = AtomicUsize::new(0);
        cache.apply_live_update(Domain::Services, json!({"id": "web", "status": "stopped"}));
        assert_eq!(cache.services(), None);

        let loaded = cache
            .load(
                Domain::Services,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(services())
                },
                false,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loaded, services());
        assert_eq!(cache.service("web").unwrap()["status"], "running");
        assert_eq!(cache.service_status_counts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_update_after_expiry_waits_for_reload() {
        let cache = DashboardCache::new();
        cache
            .load(Domain::Services, || async { Ok(services()) }, false)
            .await
            .unwrap();

        advance(Duration::from_secs(31)).await;
        cache.apply_live_update(Domain::Services, json!({"id": "db", "status": "running"}));
        assert_eq!(cache.services(), None);

        let loaded = cache
            .load(Domain::Services, || async { Ok(services()) }, false)
            .await
            .unwrap();
        assert!(loaded.is_array());
        assert_eq!(cache.service("db").unwrap()["status"], "stopped");
    }

    #[test]
    fn test_recent_logs_are_bounded() {
        let cache = DashboardCache::with_config(DashboardConfig {
            max_recent_logs: 2,
            ..DashboardConfig::default()
        });
        for i in 0..3 {
            cache.append_log(json!({"line": i}));
        }
        assert_eq!(cache.recent_logs(), vec![json!({"line": 1}), json!({"line": 2})]);
    }

    #[test]
    fn test_domain_from_kind() {
        assert_eq!(Domain::from_kind("service_update"), Some(Domain::Services));
        assert_eq!(Domain::from_kind("metrics_update"), Some(Domain::Metrics));
        assert_eq!(Domain::from_kind("chat"), None);
    }
}
