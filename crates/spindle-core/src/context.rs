//! Workflow context with heterogeneous, reference-counted value storage.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::outcome::BranchOutcome;

/// Key under which the engine stores child results before running a join step.
pub const FAN_OUT_RESULTS: &str = "spindle.fan_out_results";

/// Type-safe context key wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey(String);

impl ContextKey {
    /// Creates a new ContextKey.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContextKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ContextKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ContextKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Per-workflow key/value store carried from step to step.
///
/// Values are stored behind an [`Arc`], so [`Context::fork`] is cheap: the
/// fork has its own map, but the values themselves are shared with the
/// original until one side replaces them. A value that several tasks must
/// mutate needs its own synchronization (for example `Arc<Mutex<_>>`).
///
/// # Examples
///
/// ```
/// use spindle_core::Context;
///
/// let mut ctx = Context::new();
/// ctx.insert("namespace", "default".to_string());
/// ctx.insert("replicas", 3u32);
///
/// assert_eq!(ctx.get::<u32>("replicas"), Some(&3));
/// assert_eq!(ctx.get::<String>("replicas"), None);
///
/// let mut fork = ctx.fork();
/// fork.insert("replicas", 5u32);
/// assert_eq!(ctx.get::<u32>("replicas"), Some(&3));
/// ```
#[derive(Clone)]
pub struct Context {
    data: HashMap<ContextKey, Value>,
    started_at: Instant,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Inserts a value with the given key, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<ContextKey>, value: T) {
        self.data.insert(key.into(), Arc::new(value));
    }

    /// Inserts an already shared value without re-wrapping it.
    pub fn insert_shared<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<ContextKey>,
        value: Arc<T>,
    ) {
        self.data.insert(key.into(), value);
    }

    /// Returns a reference to the value for the given key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| (**v).downcast_ref::<T>())
    }

    /// Returns a shared handle to the value for the given key.
    pub fn get_shared<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.data
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Returns a mutable reference to the value for the given key.
    ///
    /// Returns `None` if the key doesn't exist, the type doesn't match, or
    /// the value is still shared with a fork.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.data
            .get_mut(key)
            .and_then(Arc::get_mut)
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Removes a value by key and returns it.
    ///
    /// The entry is left in place when the type doesn't match or the value
    /// is still shared with a fork.
    pub fn remove<T: Any + Send + Sync>(&mut self, key: &str) -> Option<T> {
        let (key, value) = self.data.remove_entry(key)?;
        match value.downcast::<T>() {
            Ok(typed) => match Arc::try_unwrap(typed) {
                Ok(owned) => Some(owned),
                Err(typed) => {
                    self.data.insert(key, typed);
                    None
                }
            },
            Err(value) => {
                self.data.insert(key, value);
                None
            }
        }
    }

    /// Returns `true` if the context contains a value for the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns an iterator over all keys in the context.
    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.data.keys()
    }

    /// Returns the number of entries in the context.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the context contains no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Moves every entry of `other` into this context, overwriting on conflict.
    pub fn merge(&mut self, other: Context) {
        self.data.extend(other.data);
    }

    /// Creates an independent map sharing this context's values.
    ///
    /// The fork's clock restarts; entries written to either side afterwards
    /// are not visible to the other.
    pub fn fork(&self) -> Self {
        Self {
            data: self.data.clone(),
            started_at: Instant::now(),
        }
    }

    /// Results of the most recent fan-out, in branch order.
    ///
    /// Only present while a join step (or a later step) runs.
    pub fn fan_out_results(&self) -> Option<&[BranchOutcome]> {
        self.get::<Vec<BranchOutcome>>(FAN_OUT_RESULTS)
            .map(Vec::as_slice)
    }

    /// Returns the time elapsed since the context was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_heterogeneous_storage() {
        let mut ctx = Context::new();

        ctx.insert("int", 42i32);
        ctx.insert("string", "hello".to_string());

        assert_eq!(ctx.get::<i32>("int"), Some(&42));
        assert_eq!(ctx.get::<String>("string"), Some(&"hello".to_string()));
        assert_eq!(ctx.get::<String>("int"), None);
    }

    #[test]
    fn test_fork_is_independent() {
        let mut ctx = Context::new();
        ctx.insert("pod", "web-0".to_string());

        let mut fork = ctx.fork();
        fork.insert("pod", "web-1".to_string());
        fork.insert("extra", true);

        assert_eq!(ctx.get::<String>("pod").map(String::as_str), Some("web-0"));
        assert!(!ctx.contains_key("extra"));
        assert_eq!(fork.len(), 2);
    }

    #[test]
    fn test_shared_values_need_their_own_lock() {
        let mut ctx = Context::new();
        ctx.insert("events", Mutex::new(Vec::<String>::new()));

        let fork = ctx.fork();
        if let Some(events) = fork.get::<Mutex<Vec<String>>>("events") {
            events.lock().unwrap().push("from fork".to_string());
        }

        let seen = ctx.get::<Mutex<Vec<String>>>("events").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_get_mut_refuses_shared_values() {
        let mut ctx = Context::new();
        ctx.insert("count", 0i32);

        if let Some(count) = ctx.get_mut::<i32>("count") {
            *count += 1;
        }
        assert_eq!(ctx.get::<i32>("count"), Some(&1));

        let _fork = ctx.fork();
        assert!(ctx.get_mut::<i32>("count").is_none());
    }

    #[test]
    fn test_remove() {
        let mut ctx = Context::new();
        ctx.insert("key", "value".to_string());

        assert_eq!(ctx.remove::<i32>("key"), None);
        assert!(ctx.contains_key("key"));

        let removed = ctx.remove::<String>("key");
        assert_eq!(removed, Some("value".to_string()));
        assert!(!ctx.contains_key("key"));
    }

    #[test]
    fn test_merge_overwrites() {
        let mut ctx = Context::new();
        ctx.insert("phase", "Pending".to_string());

        let mut update = Context::new();
        update.insert("phase", "Running".to_string());
        update.insert("x", 1i32);
        ctx.merge(update);

        assert_eq!(ctx.get::<String>("phase").map(String::as_str), Some("Running"));
        assert_eq!(ctx.get::<i32>("x"), Some(&1));
    }

    #[test]
    fn test_shared_insert_keeps_the_same_allocation() {
        let mut ctx = Context::new();
        let client = Arc::new("api-server".to_string());
        ctx.insert_shared("client", client.clone());

        let fetched = ctx.get_shared::<String>("client").unwrap();
        assert!(Arc::ptr_eq(&client, &fetched));
        assert!(ctx.get_shared::<i32>("client").is_none());
        assert!(ctx.get_shared::<String>("missing").is_none());
    }

    #[test]
    fn test_elapsed_grows() {
        let ctx = Context::new();
        let first = ctx.elapsed();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(ctx.elapsed() > first);
    }

    #[test]
    fn test_context_key() {
        let key1 = ContextKey::new("test");
        let key2: ContextKey = "test".into();
        assert_eq!(key1, key2);
    }
}
