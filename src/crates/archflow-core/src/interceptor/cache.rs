//! Result caching for tool invocations
//!
//! Keys on `(tool name, canonicalized input)` where canonicalization sorts
//! object keys recursively, so semantically equal inputs hit the same entry
//! regardless of construction order. Hits short-circuit the chain and skip
//! the tool body; writes happen on success only. Entries expire after a TTL
//! and the store is capped, evicting the oldest insertion when full.

use super::{ToolExecutionContext, ToolInterceptor};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Value,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Caches successful tool results keyed by canonicalized input
#[derive(Clone)]
pub struct CacheInterceptor {
    ttl: ChronoDuration,
    max_entries: usize,
    store: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CacheInterceptor {
    /// Cache with the given TTL and a 1024-entry cap
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(60)),
            max_entries: 1024,
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the entry cap
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    /// Number of live entries (expired entries may still be counted until
    /// their next lookup)
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.store.lock().clear();
    }

    fn key(tool_name: &str, input: &Value) -> String {
        format!("{}:{}", tool_name, canonicalize(input))
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let mut store = self.store.lock();
        match store.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.result.clone()),
            Some(_) => {
                store.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: String, result: Value) {
        let mut store = self.store.lock();
        if store.len() >= self.max_entries && !store.contains_key(&key) {
            // Evict the oldest insertion to stay within the cap
            if let Some(oldest) = store
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone())
            {
                store.remove(&oldest);
            }
        }
        let now = Utc::now();
        store.insert(
            key,
            CacheEntry {
                result,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
    }
}

/// Serialize with object keys sorted recursively
fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by_key(|(k, _)| k.as_str());
                let mut out = Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), sort(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[async_trait]
impl ToolInterceptor for CacheInterceptor {
    fn name(&self) -> &str {
        "cache"
    }

    fn order(&self) -> i32 {
        // Innermost standard interceptor: a hit skips only the tool body
        2000
    }

    async fn before_execute(&self, ctx: &mut ToolExecutionContext) -> Result<()> {
        let key = Self::key(&ctx.tool_name, &ctx.input);
        if let Some(result) = self.lookup(&key) {
            tracing::debug!(tool = %ctx.tool_name, "Cache hit");
            ctx.attributes
                .insert("cache.hit".to_string(), Value::Bool(true));
            ctx.short_circuit = Some(result);
        } else {
            ctx.attributes
                .insert("cache.key".to_string(), Value::String(key));
        }
        Ok(())
    }

    async fn after_execute(&self, ctx: &mut ToolExecutionContext, result: Value) -> Result<Value> {
        let hit = ctx
            .attributes
            .get("cache.hit")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !hit {
            if let Some(Value::String(key)) = ctx.attributes.get("cache.key") {
                self.insert(key.clone(), result.clone());
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::error::FlowError;
    use crate::event::EventBus;
    use crate::interceptor::InterceptorChain;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("f", EventBus::new())
    }

    #[test]
    fn test_canonicalization_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[tokio::test]
    async fn test_hit_skips_body() {
        let cache = CacheInterceptor::new(Duration::from_secs(60));
        let chain = InterceptorChain::new().with(Arc::new(cache.clone()));

        let body_runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = body_runs.clone();
            let result = chain
                .execute("t", json!({"q": 1}), &ctx(), |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("fresh"))
                })
                .await
                .unwrap();
            assert_eq!(result, json!("fresh"));
        }

        assert_eq!(body_runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_key_order_insensitive() {
        let cache = CacheInterceptor::new(Duration::from_secs(60));
        let chain = InterceptorChain::new().with(Arc::new(cache));

        let body_runs = Arc::new(AtomicUsize::new(0));
        for input in [json!({"a": 1, "b": 2}), json!({"b": 2, "a": 1})] {
            let counter = body_runs.clone();
            chain
                .execute("t", input, &ctx(), |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("x"))
                })
                .await
                .unwrap();
        }
        assert_eq!(body_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = CacheInterceptor::new(Duration::from_secs(60));
        let chain = InterceptorChain::new().with(Arc::new(cache.clone()));

        chain
            .execute("t", json!(1), &ctx(), |_| async move {
                Err(FlowError::step("t", "boom"))
            })
            .await
            .unwrap_err();

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let cache = CacheInterceptor::new(Duration::from_millis(0));
        let chain = InterceptorChain::new().with(Arc::new(cache));

        let body_runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = body_runs.clone();
            chain
                .execute("t", json!(1), &ctx(), |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("x"))
                })
                .await
                .unwrap();
        }
        assert_eq!(body_runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest() {
        let cache = CacheInterceptor::new(Duration::from_secs(60)).with_max_entries(2);
        let chain = InterceptorChain::new().with(Arc::new(cache.clone()));

        for i in 0..3 {
            chain
                .execute("t", json!({ "i": i }), &ctx(), |_| async move {
                    Ok(json!("x"))
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
    }
}
