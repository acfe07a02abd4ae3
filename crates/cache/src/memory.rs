//! In-process cache for tests and ephemeral use

use crate::cache::{Cache, next_access};
use crate::keys::{FunctionKey, InputKey};
use crate::metadata::Metadata;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default, Clone)]
struct Slot {
    output: Option<Vec<u8>>,
    metadata: Option<Metadata>,
    last_accessed: Option<DateTime<Utc>>,
}

impl Slot {
    fn committed(&self) -> bool {
        self.output.is_some() && self.metadata.is_some()
    }
}

/// A [`Cache`] held entirely in memory
///
/// Entries are grouped per function so `clear` and `adopt` touch a single
/// map. Nothing is persisted and [`Cache::get_output_path`] is always `None`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    functions: RwLock<HashMap<FunctionKey, BTreeMap<String, Slot>>>,
}

impl MemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<FunctionKey, BTreeMap<String, Slot>>> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<FunctionKey, BTreeMap<String, Slot>>> {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_slot<T>(&self, input_key: &InputKey, f: impl FnOnce(&Slot) -> Option<T>) -> Option<T> {
        self.read_guard()
            .get(input_key.function_key())
            .and_then(|inputs| inputs.get(input_key.id()))
            .and_then(f)
    }
}

impl Cache for MemoryCache {
    fn exists(&self, input_key: &InputKey) -> Result<bool> {
        Ok(self
            .with_slot(input_key, |slot| Some(slot.committed()))
            .unwrap_or(false))
    }

    fn list(&self, function_key: &FunctionKey) -> Result<Vec<InputKey>> {
        let guard = self.read_guard();
        let Some(inputs) = guard.get(function_key) else {
            return Ok(Vec::new());
        };
        inputs
            .iter()
            .filter(|(_, slot)| slot.committed())
            .map(|(id, _)| function_key.input(id.clone()))
            .collect()
    }

    fn evict(&self, input_key: &InputKey) -> Result<()> {
        let mut guard = self.write_guard();
        if let Some(inputs) = guard.get_mut(input_key.function_key()) {
            inputs.remove(input_key.id());
            if inputs.is_empty() {
                guard.remove(input_key.function_key());
            }
        }
        Ok(())
    }

    fn clear(&self, function_key: &FunctionKey) -> Result<()> {
        self.write_guard().remove(function_key);
        Ok(())
    }

    fn adopt(&self, from: &FunctionKey, to: &FunctionKey) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let mut guard = self.write_guard();
        let Some(adopted) = guard.remove(from) else {
            return Ok(());
        };
        let target = guard.entry(to.clone()).or_default();
        for (id, slot) in adopted {
            if slot.committed() {
                target.insert(id, slot);
            }
        }
        if target.is_empty() {
            guard.remove(to);
        }
        Ok(())
    }

    fn read_output(&self, input_key: &InputKey) -> Result<Vec<u8>> {
        self.with_slot(input_key, |slot| {
            slot.metadata.as_ref()?;
            slot.output.clone()
        })
        .ok_or_else(|| Error::not_found(input_key.to_string()))
    }

    fn write_output(&self, output: &[u8], input_key: &InputKey) -> Result<()> {
        let mut guard = self.write_guard();
        let slot = guard
            .entry(input_key.function_key().clone())
            .or_default()
            .entry(input_key.id().to_string())
            .or_default();
        if slot.output.is_some() {
            return Err(Error::conflict(input_key.to_string()));
        }
        slot.output = Some(output.to_vec());
        Ok(())
    }

    fn load_metadata(&self, input_key: &InputKey) -> Result<Metadata> {
        self.with_slot(input_key, |slot| slot.metadata.clone())
            .ok_or_else(|| Error::not_found(input_key.to_string()))
    }

    fn dump_metadata(&self, metadata: &Metadata, input_key: &InputKey) -> Result<()> {
        let mut guard = self.write_guard();
        let slot = guard
            .get_mut(input_key.function_key())
            .and_then(|inputs| inputs.get_mut(input_key.id()))
            .filter(|slot| slot.output.is_some())
            .ok_or_else(|| Error::not_found(input_key.to_string()))?;
        slot.metadata = Some(metadata.clone());
        Ok(())
    }

    fn get_output_path(&self, _input_key: &InputKey) -> Option<PathBuf> {
        None
    }

    fn update_last_accessed(&self, input_key: &InputKey) -> Result<()> {
        let mut guard = self.write_guard();
        let slot = guard
            .get_mut(input_key.function_key())
            .and_then(|inputs| inputs.get_mut(input_key.id()))
            .filter(|slot| slot.committed())
            .ok_or_else(|| Error::not_found(input_key.to_string()))?;
        slot.last_accessed = Some(next_access(slot.last_accessed, Utc::now()));
        Ok(())
    }

    fn get_last_accessed(&self, input_key: &InputKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self.with_slot(input_key, |slot| slot.last_accessed))
    }

    /// Store an output, replacing any previous entry for the key
    ///
    /// All steps of the composed default happen under one lock, so a
    /// committed slot always holds the bytes and metadata of the same call.
    fn write(&self, output: &[u8], metadata: &Metadata, input_key: &InputKey) -> Result<()> {
        let mut guard = self.write_guard();
        let inputs = guard.entry(input_key.function_key().clone()).or_default();
        let previous = inputs
            .get(input_key.id())
            .and_then(|slot| slot.last_accessed);
        inputs.insert(
            input_key.id().to_string(),
            Slot {
                output: Some(output.to_vec()),
                metadata: Some(metadata.clone()),
                last_accessed: Some(next_access(previous, Utc::now())),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(function: &str, input: &str) -> InputKey {
        FunctionKey::new(function).unwrap().input(input).unwrap()
    }

    #[test]
    fn test_output_without_metadata_is_invisible() {
        let cache = MemoryCache::new();
        let k = key("f", "1");

        cache.write_output(b"bytes", &k).unwrap();

        assert!(!cache.exists(&k).unwrap());
        assert!(cache.list(k.function_key()).unwrap().is_empty());
        assert!(cache.read_output(&k).unwrap_err().is_not_found());
    }

    #[test]
    fn test_second_output_conflicts() {
        let cache = MemoryCache::new();
        let k = key("f", "1");

        cache.write_output(b"first", &k).unwrap();
        assert!(matches!(
            cache.write_output(b"second", &k),
            Err(Error::Conflict { .. })
        ));
        cache.evict(&k).unwrap();
        cache.write_output(b"second", &k).unwrap();
    }

    #[test]
    fn test_dump_metadata_needs_output() {
        let cache = MemoryCache::new();
        let k = key("f", "1");
        let err = cache.dump_metadata(&Metadata::new(), &k).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_no_output_path() {
        let cache = MemoryCache::new();
        let k = key("f", "1");
        cache.write(b"x", &Metadata::new(), &k).unwrap();
        assert_eq!(cache.get_output_path(&k), None);
    }

    #[test]
    fn test_adopt_drops_uncommitted_slots() {
        let cache = MemoryCache::new();
        let from = FunctionKey::new("old").unwrap();
        let to = FunctionKey::new("new").unwrap();

        cache.write(b"a", &Metadata::new(), &from.input("a").unwrap()).unwrap();
        cache.write_output(b"b", &from.input("b").unwrap()).unwrap();

        cache.adopt(&from, &to).unwrap();

        assert_eq!(cache.list(&to).unwrap(), vec![to.input("a").unwrap()]);
        assert!(!cache.exists(&to.input("b").unwrap()).unwrap());
        assert!(cache.list(&from).unwrap().is_empty());
    }

    #[test]
    fn test_write_replaces_uncommitted_output() {
        let cache = MemoryCache::new();
        let k = key("f", "1");

        cache.write_output(b"orphan", &k).unwrap();
        cache.write(b"fresh", &Metadata::new(), &k).unwrap();

        assert_eq!(cache.read(&k).unwrap(), b"fresh");
        assert!(cache.get_last_accessed(&k).unwrap().is_some());
    }

    #[test]
    fn test_survives_poisoned_lock() {
        let cache = std::sync::Arc::new(MemoryCache::new());
        let k = key("f", "1");
        cache.write(b"x", &Metadata::new(), &k).unwrap();

        let poisoner = std::sync::Arc::clone(&cache);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.functions.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert_eq!(cache.read(&k).unwrap(), b"x");
    }
}
