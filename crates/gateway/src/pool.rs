//! Upstream API connection cache.
//!
//! At most one in-flight dial per key; concurrent callers for the same key
//! block on the same result. Ready connections are shared through
//! reference-counted handles and evicted only once no handle is
//! outstanding, by age (TTL) or to respect the capacity bound (LRU).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{Mutex, OnceCell};

use common::params::ErrorCode;

use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::runtime::Clock;
use crate::upstream::{ControllerApi, DialInfo};

/// A live upstream connection together with the information used to dial it.
pub struct ApiConn {
    pub api: Arc<dyn ControllerApi>,
    pub info: DialInfo,
}

/// Caller-held reference to a pooled connection. Dropping the handle
/// releases the reference; the pool owns the connection itself.
pub struct ConnHandle {
    conn: Arc<ApiConn>,
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("info", &self.conn.info)
            .finish_non_exhaustive()
    }
}

impl ConnHandle {
    pub fn api(&self) -> &dyn ControllerApi {
        self.conn.api.as_ref()
    }

    pub fn info(&self) -> &DialInfo {
        &self.conn.info
    }

    /// A shared reference to the API, for calls that outlive the handle's
    /// borrow (detached tasks raced against cancellation).
    pub fn clone_api(&self) -> Arc<dyn ControllerApi> {
        self.conn.api.clone()
    }

    pub fn close(self) {}
}

#[derive(Clone)]
struct SharedError {
    code: ErrorCode,
    message: String,
}

type SlotResult = std::result::Result<Arc<ApiConn>, SharedError>;

struct Slot {
    cell: OnceCell<SlotResult>,
    created: DateTime<Utc>,
    last_used: std::sync::Mutex<DateTime<Utc>>,
}

pub struct ConnCache {
    entries: Mutex<HashMap<String, Arc<Slot>>>,
    ttl: chrono::Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl ConnCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Returns the cached connection for `key`, or dials one. Concurrent
    /// callers for the same key share a single dial; distinct keys are
    /// independent. The dial is abandoned if every waiter cancels first.
    pub async fn open_api<F, Fut>(&self, ctx: &Context, key: &str, dial: F) -> Result<ConnHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Arc<dyn ControllerApi>, DialInfo)>> + Send,
    {
        let now = self.clock.now();
        let slot = {
            let mut entries = self.entries.lock().await;
            self.evict_expired(&mut entries, now);
            entries
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        cell: OnceCell::new(),
                        created: now,
                        last_used: std::sync::Mutex::new(now),
                    })
                })
                .clone()
        };

        let hit = slot.cell.initialized();
        let result = tokio::select! {
            res = slot.cell.get_or_init(|| async {
                counter!("gateway_pool_dial_total").increment(1);
                match dial().await {
                    Ok((api, info)) => Ok(Arc::new(ApiConn { api, info })),
                    Err(err) => Err(SharedError {
                        code: err.code(),
                        message: err.to_string(),
                    }),
                }
            }) => res.clone(),
            _ = ctx.cancelled() => return Err(ctx.err()),
        };

        match result {
            Ok(conn) => {
                counter!("gateway_pool_open_total", "result" => if hit { "hit" } else { "dial" })
                    .increment(1);
                *slot.last_used.lock().expect("last_used lock") = now;
                self.enforce_capacity().await;
                Ok(ConnHandle { conn })
            }
            Err(shared) => {
                // Failed dials are not cached: forget the slot so the next
                // caller dials afresh.
                let mut entries = self.entries.lock().await;
                if let Some(current) = entries.get(key) {
                    if Arc::ptr_eq(current, &slot) {
                        entries.remove(key);
                    }
                }
                counter!("gateway_pool_open_total", "result" => "error").increment(1);
                Err(Error::new(shared.code, shared.message))
            }
        }
    }

    /// Clears all entries. Outstanding handles keep their connections alive
    /// until dropped.
    pub async fn evict_all(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn evict_expired(&self, entries: &mut HashMap<String, Arc<Slot>>, now: DateTime<Utc>) {
        entries.retain(|_, slot| {
            let Some(Ok(conn)) = slot.cell.get() else {
                // In-flight dials and failures are never expired here.
                return true;
            };
            if Arc::strong_count(conn) > 1 {
                // A handle is outstanding; the entry stays whatever its age.
                return true;
            }
            now - slot.created < self.ttl
        });
    }

    async fn enforce_capacity(&self) {
        let mut entries = self.entries.lock().await;
        while entries.len() > self.capacity {
            let victim = entries
                .iter()
                .filter(|(_, slot)| match slot.cell.get() {
                    Some(Ok(conn)) => Arc::strong_count(conn) == 1,
                    _ => false,
                })
                .min_by_key(|(_, slot)| *slot.last_used.lock().expect("last_used lock"))
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    entries.remove(&key);
                }
                // Everything is referenced or still dialing; the cache runs
                // over capacity until handles are released.
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FrozenClock, SystemClock};
    use crate::testing::FakeControllerApi;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dial_info() -> DialInfo {
        DialInfo {
            hosts: vec!["10.0.0.1:17070".to_string()],
            ca_cert: None,
            user: "admin".to_string(),
            password: "pw".to_string(),
            model_uuid: None,
        }
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_dial() {
        let cache = Arc::new(ConnCache::new(
            Duration::from_secs(300),
            16,
            Arc::new(SystemClock),
        ));
        let dials = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let dials = dials.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .open_api(&Context::background(), "ctl-uuid", move || async move {
                        dials.fetch_add(1, Ordering::SeqCst);
                        // Hold every concurrent caller on the same in-flight dial.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                        Ok((api, dial_info()))
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("open");
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failed_dial_is_shared_then_forgotten() {
        let cache = ConnCache::new(Duration::from_secs(300), 16, Arc::new(SystemClock));

        let err = cache
            .open_api(&Context::background(), "ctl-uuid", || async {
                Err(Error::api_connection("cannot connect to API"))
            })
            .await
            .expect_err("dial fails");
        assert_eq!(err.code(), ErrorCode::ApiConnection);
        assert_eq!(cache.len().await, 0);

        // The next caller dials afresh and can succeed.
        cache
            .open_api(&Context::background(), "ctl-uuid", || async {
                let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                Ok((api, dial_info()))
            })
            .await
            .expect("second dial succeeds");
    }

    #[tokio::test]
    async fn ttl_evicts_only_unreferenced_entries() {
        let clock = Arc::new(FrozenClock::new(Utc::now()));
        let cache = ConnCache::new(Duration::from_secs(60), 16, clock.clone());

        let held = cache
            .open_api(&Context::background(), "held", || async {
                let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                Ok((api, dial_info()))
            })
            .await
            .expect("open held");
        cache
            .open_api(&Context::background(), "idle", || async {
                let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                Ok((api, dial_info()))
            })
            .await
            .expect("open idle")
            .close();

        clock.advance(chrono::Duration::seconds(120));
        // Any open sweeps expired entries.
        cache
            .open_api(&Context::background(), "fresh", || async {
                let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                Ok((api, dial_info()))
            })
            .await
            .expect("open fresh")
            .close();

        let entries = cache.entries.lock().await;
        assert!(entries.contains_key("held"), "referenced entry survives TTL");
        assert!(!entries.contains_key("idle"), "idle entry expired");
        drop(entries);
        held.close();
    }

    #[tokio::test]
    async fn evict_all_clears_entries() {
        let cache = ConnCache::new(Duration::from_secs(300), 16, Arc::new(SystemClock));
        cache
            .open_api(&Context::background(), "a", || async {
                let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                Ok((api, dial_info()))
            })
            .await
            .expect("open")
            .close();
        cache.evict_all().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_sees_cancellation() {
        let cache = Arc::new(ConnCache::new(
            Duration::from_secs(300),
            16,
            Arc::new(SystemClock),
        ));
        let (handle, ctx) = crate::ctx::context();

        let cache2 = cache.clone();
        let waiter = tokio::spawn(async move {
            cache2
                .open_api(&ctx, "slow", || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    let api: Arc<dyn ControllerApi> = Arc::new(FakeControllerApi::default());
                    Ok((api, dial_info()))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let err = waiter.await.expect("join").expect_err("cancelled");
        assert!(err.to_string().contains("context canceled"));
    }
}
