//! Keyed at-most-once computation shared between threads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Runs one computation per key and hands its result to every caller.
///
/// The first caller for a key computes the value; concurrent callers for
/// the same key block until it is ready and receive a clone. The map lock
/// is held only long enough to find the key's cell, so different keys
/// compute in parallel.
pub struct OnceMap<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceLock<V>>>>,
}

impl<K, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> OnceMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value for `key`, computing it with `init` if no caller
    /// has done so yet.
    pub fn get_or_init<F>(&self, key: &K, init: F) -> V
    where
        F: FnOnce() -> V,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(key.clone()).or_default())
        };
        cell.get_or_init(init).clone()
    }

    /// Forget every computed value.
    pub fn clear(&self) {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn computes_once_per_key_across_threads() {
        let map: OnceMap<&str, usize> = OnceMap::new();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        let results: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        map.get_or_init(&"key", || calls.fetch_add(1, Ordering::SeqCst) + 41)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&value| value == 41));
    }

    #[test]
    fn keys_are_independent_and_clear_forgets() {
        let map: OnceMap<u8, u8> = OnceMap::new();
        assert_eq!(map.get_or_init(&1, || 10), 10);
        assert_eq!(map.get_or_init(&2, || 20), 20);
        assert_eq!(map.get_or_init(&1, || 99), 10);

        map.clear();

        assert_eq!(map.get_or_init(&1, || 11), 11);
    }
}
