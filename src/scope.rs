use crate::event::Value;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Mutex, RwLock},
    time::Duration,
};

/// The user on whose behalf the process is logging.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Host attributes captured once and refreshed lazily. The full device
/// context capture lives outside this crate; this is the minimal set the
/// pipeline attaches to events on its own.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Context {
    pub values: BTreeMap<String, String>,
    pub captured_at: DateTime<Utc>,
}

impl Context {
    fn capture() -> Context {
        let mut values = BTreeMap::new();
        values.insert("os".to_owned(), std::env::consts::OS.to_owned());
        values.insert("arch".to_owned(), std::env::consts::ARCH.to_owned());
        values.insert("pid".to_owned(), std::process::id().to_string());
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            values.insert("hostname".to_owned(), hostname);
        }
        Context {
            values,
            captured_at: Utc::now(),
        }
    }
}

/// Caches a [`Context`] capture, refreshing it at most once per
/// `refresh_interval`.
pub struct ContextCache {
    refresh_interval: Duration,
    slot: Mutex<Option<Context>>,
}

impl ContextCache {
    pub fn new(refresh_interval: Duration) -> ContextCache {
        ContextCache {
            refresh_interval,
            slot: Mutex::new(None),
        }
    }

    /// The current context, re-captured if the cached one is stale.
    pub fn current(&self) -> Context {
        let mut slot = self.slot.lock().unwrap();
        let stale = match slot.as_ref() {
            Some(context) => {
                let age = Utc::now() - context.captured_at;
                age.to_std().map_or(true, |age| age >= self.refresh_interval)
            }
            None => true,
        };
        if stale {
            *slot = Some(Context::capture());
        }
        slot.as_ref().cloned().unwrap()
    }
}

/// Ambient metadata attached to every event at submission. A process-wide
/// current scope can be mutated with [`Scope::with_current`]; each event
/// receives an immutable snapshot of it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

static CURRENT_SCOPE: Lazy<RwLock<Scope>> = Lazy::new(|| RwLock::new(Scope::default()));

static HOST_CONTEXT: Lazy<ContextCache> =
    Lazy::new(|| ContextCache::new(Duration::from_secs(30)));

impl Scope {
    /// A snapshot of the process-wide scope, with the cached host context
    /// and the calling thread's id filled in.
    pub fn snapshot() -> Scope {
        let mut scope = CURRENT_SCOPE.read().unwrap().clone();
        scope.thread_id = Some(format!("{:?}", std::thread::current().id()));
        scope.context = Some(HOST_CONTEXT.current());
        scope
    }

    /// Mutates the process-wide scope under its lock.
    pub fn with_current<F: FnOnce(&mut Scope)>(mutate: F) {
        let mut scope = CURRENT_SCOPE.write().unwrap();
        mutate(&mut scope);
    }

    /// Replaces the process-wide scope. Mostly useful for tests.
    pub fn replace_current(scope: Scope) {
        *CURRENT_SCOPE.write().unwrap() = scope;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_cache_refreshes_when_stale() {
        let cache = ContextCache::new(Duration::from_secs(0));
        let first = cache.current();
        let second = cache.current();
        // A zero refresh interval re-captures every time.
        assert!(second.captured_at >= first.captured_at);
        assert_eq!(first.values.get("pid"), second.values.get("pid"));
    }

    #[test]
    fn context_cache_reuses_fresh_capture() {
        let cache = ContextCache::new(Duration::from_secs(3600));
        let first = cache.current();
        let second = cache.current();
        assert_eq!(first.captured_at, second.captured_at);
    }

    #[test]
    fn snapshot_fills_thread_id_and_context() {
        let scope = Scope::snapshot();
        assert!(scope.thread_id.is_some());
        let context = scope.context.unwrap();
        assert_eq!(
            context.values.get("os").map(String::as_str),
            Some(std::env::consts::OS)
        );
    }

    #[test]
    fn with_current_mutates_later_snapshots() {
        Scope::with_current(|scope| {
            scope
                .tags
                .insert("deployment".to_owned(), "staging".to_owned());
        });
        let snapshot = Scope::snapshot();
        assert_eq!(
            snapshot.tags.get("deployment").map(String::as_str),
            Some("staging")
        );
        Scope::with_current(|scope| {
            scope.tags.remove("deployment");
        });
    }
}
