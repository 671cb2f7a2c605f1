use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvStore, StoreError};
use crate::clock::Clock;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// Member -> epoch-ms deadline.
    Index(BTreeMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    /// Epoch ms after which the key is treated as absent.
    expires_at: Option<i64>,
}

impl Slot {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store used when no external store is configured.
///
/// Each instance owns its own map; construct one per app (or per test).
/// Expired keys are dropped lazily on access.
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn deadline(&self, ttl: Duration) -> i64 {
        self.clock.now_ms() + ttl.as_millis() as i64
    }

    /// Runs `f` against the live slot for `key`, purging it first if expired.
    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Slot>) -> R) -> R {
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|s| !s.is_live(now)) {
            slots.remove(key);
        }
        f(slots.get_mut(key))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_live(key, |slot| match slot {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|t| self.deadline(t));
        self.slots.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.to_string())
            .and_modify(|s| {
                if !s.is_live(now) {
                    *s = Slot {
                        value: Value::Str("0".to_string()),
                        expires_at: None,
                    };
                }
            })
            .or_insert_with(|| Slot {
                value: Value::Str("0".to_string()),
                expires_at: None,
            });

        let Value::Str(raw) = &slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let next = raw
            .parse::<i64>()
            .map_err(|_| StoreError::NotAnInteger(key.to_string()))?
            + 1;
        slot.value = Value::Str(next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let deadline = self.deadline(ttl);
        Ok(self.with_live(key, |slot| match slot {
            Some(slot) => {
                slot.expires_at = Some(deadline);
                true
            }
            None => false,
        }))
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .slots
            .lock()
            .remove(key)
            .is_some_and(|slot| slot.is_live(now)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| StoreError::Response(format!("invalid key pattern: {e}")))?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| slot.is_live(now));
        let mut keys: Vec<String> = slots
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn index_add(
        &self,
        key: &str,
        member: &str,
        deadline_ms: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|s| !s.is_live(now)) {
            slots.remove(key);
        }
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Index(BTreeMap::new()),
            expires_at: None,
        });
        let Value::Index(members) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };

        members.insert(member.to_string(), deadline_ms);
        members.retain(|_, deadline| *deadline > now_ms);
        let last = members.values().max().copied();
        match last {
            Some(last) => slot.expires_at = Some(last),
            None => {
                slots.remove(key);
            }
        }
        Ok(())
    }

    async fn index_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_live(key, |slot| match slot {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Index(members),
                ..
            }) => Ok(members.keys().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock();
        let emptied = match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => match &mut slot.value {
                Value::Index(members) => {
                    members.remove(member);
                    members.is_empty()
                }
                Value::Str(_) => return Err(StoreError::WrongType(key.to_string())),
            },
            _ => false,
        };
        // Redis drops empty sorted sets.
        if emptied {
            slots.remove(key);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
