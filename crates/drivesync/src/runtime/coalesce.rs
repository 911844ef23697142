//! Request coalescing
//!
//! Concurrent callers asking for the same key share a single execution of the
//! work. The first caller (the leader) runs it; everyone arriving while it is
//! in flight blocks until the leader publishes the result and then receives a
//! clone of it. Once published the key is free again, so a later call starts
//! fresh work. If the leader unwinds without a result, each waiting caller
//! runs its own work instead.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

use super::lock;

enum Slot<V> {
    Pending,
    Ready(V),
    /// The leader unwound before producing a value
    Abandoned,
}

/// One in-flight execution
struct Flight<V> {
    slot: Mutex<Slot<V>>,
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        }
    }

    fn publish(&self, value: V) {
        *lock(&self.slot) = Slot::Ready(value);
        self.done.notify_all();
    }

    fn abandon(&self) {
        let mut slot = lock(&self.slot);
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Abandoned;
            self.done.notify_all();
        }
    }

    /// Block until the leader finishes; `None` if it produced nothing
    fn wait(&self) -> Option<V> {
        let mut guard = lock(&self.slot);
        loop {
            match &*guard {
                Slot::Ready(value) => return Some(value.clone()),
                Slot::Abandoned => return None,
                Slot::Pending => {}
            }
            guard = self
                .done
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Shares in-flight work among concurrent callers with the same key
pub struct Coalescer<K, V> {
    inflight: Mutex<HashMap<K, Arc<Flight<V>>>>,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, or join the execution already in flight
    pub fn run<F>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> V,
    {
        let (flight, leader) = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::new());
                    inflight.insert(key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            return match flight.wait() {
                Some(value) => value,
                None => work(),
            };
        }

        // Followers are released even if `work` unwinds.
        let guard = LeaderGuard {
            coalescer: self,
            flight: &flight,
            key: Some(key),
        };
        let value = work();
        flight.publish(value.clone());
        drop(guard);
        value
    }

    /// Whether work for `key` is currently in flight
    pub fn is_inflight(&self, key: &K) -> bool {
        lock(&self.inflight).contains_key(key)
    }

    /// Number of keys with work in flight
    pub fn inflight_count(&self) -> usize {
        lock(&self.inflight).len()
    }
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's entry when it finishes (or unwinds)
struct LeaderGuard<'a, K: Eq + Hash, V: Clone> {
    coalescer: &'a Coalescer<K, V>,
    flight: &'a Flight<V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V: Clone> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.coalescer.inflight).remove(&key);
        }
        self.flight.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_caller_runs_work() {
        let coalescer: Coalescer<&str, u32> = Coalescer::new();
        assert_eq!(coalescer.run("a", || 7), 7);
        assert!(!coalescer.is_inflight(&"a"));
    }

    #[test]
    fn test_concurrent_callers_share_one_execution() {
        let coalescer: Coalescer<String, String> = Coalescer::new();
        let executions = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        let results: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        coalescer.run("file.png".to_string(), || {
                            executions.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(100));
                            "https://download/file.png".to_string()
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == "https://download/file.png"));
        assert_eq!(coalescer.inflight_count(), 0);
    }

    #[test]
    fn test_different_keys_run_independently() {
        let coalescer: Coalescer<u32, u32> = Coalescer::new();
        let executions = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for key in 0..4 {
                let coalescer = &coalescer;
                let executions = &executions;
                s.spawn(move || {
                    coalescer.run(key, || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        key * 2
                    })
                });
            }
        });

        assert_eq!(executions.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_followers_recover_when_leader_panics() {
        let coalescer: Coalescer<&str, u32> = Coalescer::new();
        let leader_started = Barrier::new(2);

        let (leader, follower) = std::thread::scope(|s| {
            let leader = s.spawn(|| {
                coalescer.run("k", || {
                    leader_started.wait();
                    std::thread::sleep(Duration::from_millis(100));
                    panic!("leader failed");
                })
            });
            let follower = s.spawn(|| {
                leader_started.wait();
                coalescer.run("k", || 42)
            });
            (leader.join(), follower.join())
        });

        assert!(leader.is_err());
        assert_eq!(follower.unwrap(), 42);
        assert_eq!(coalescer.inflight_count(), 0);
    }

    #[test]
    fn test_key_is_free_after_completion() {
        let coalescer: Coalescer<(), u32> = Coalescer::new();
        let mut calls = 0;
        coalescer.run((), || {
            calls += 1;
            1
        });
        coalescer.run((), || {
            calls += 1;
            2
        });
        assert_eq!(calls, 2);
    }
}
