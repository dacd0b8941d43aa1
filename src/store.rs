use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Full key/value state, ordered so that encoded images are byte-identical across nodes.
pub type KvState = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNotFound {
    pub key: String,
}

impl std::fmt::Display for KeyNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key not found: {}", self.key)
    }
}

impl std::error::Error for KeyNotFound {}

/// Storage boundary used by the state machine and the orchestrator.
///
/// Every method must be callable concurrently from different threads. `snapshot` and
/// `apply_snapshot` never observe or install a partially mutated map.
pub trait KvStore: Send + Sync + std::fmt::Debug + 'static {
    fn get(&self, key: &str) -> Result<String, KeyNotFound>;

    fn set(&self, key: String, value: String);

    /// Deleting an absent key is a no-op.
    fn delete(&self, key: &str);

    /// Deep copy of the whole state.
    fn snapshot(&self) -> KvState;

    /// Replace the whole state in one step.
    fn apply_snapshot(&self, state: KvState);
}

/// In-memory store guarded by a single reader/writer lock.
#[derive(Debug, Default)]
pub struct MemStore {
    data: RwLock<KvState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Result<String, KeyNotFound> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| KeyNotFound {
                key: key.to_string(),
            })
    }

    fn set(&self, key: String, value: String) {
        self.data.write().insert(key, value);
    }

    fn delete(&self, key: &str) {
        self.data.write().remove(key);
    }

    fn snapshot(&self) -> KvState {
        self.data.read().clone()
    }

    fn apply_snapshot(&self, state: KvState) {
        *self.data.write() = state;
    }
}
