//! Single-flight guard: at most one pipeline run per message id.
//!
//! The lock is only taken for the set operation itself, never across an await.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of message ids currently being handled.
#[derive(Debug, Default)]
pub struct SingleFlightGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl SingleFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `id`. Returns false, without changing anything, if it is already held.
    pub fn try_acquire(&self, id: &str) -> bool {
        let mut set = self.set();
        if set.contains(id) {
            return false;
        }
        set.insert(id.to_string());
        true
    }

    pub fn release(&self, id: &str) {
        self.set().remove(id);
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.set().contains(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.set().len()
    }

    /// Scoped acquisition: the returned ticket releases `id` when dropped, on every exit path.
    pub fn acquire(self: &Arc<Self>, id: &str) -> Option<InFlightTicket> {
        if self.try_acquire(id) {
            Some(InFlightTicket {
                guard: Arc::clone(self),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

/// Holds one message id in the guard until dropped.
#[derive(Debug)]
pub struct InFlightTicket {
    guard: Arc<SingleFlightGuard>,
    id: String,
}

impl InFlightTicket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        self.guard.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let guard = SingleFlightGuard::new();
        assert!(guard.try_acquire("m1"));
        assert!(!guard.try_acquire("m1"));
        assert!(guard.try_acquire("m2"));
        guard.release("m1");
        assert!(guard.try_acquire("m1"));
    }

    #[test]
    fn release_of_unknown_id_is_harmless() {
        let guard = SingleFlightGuard::new();
        guard.release("never");
        assert_eq!(guard.in_flight_count(), 0);
    }

    #[test]
    fn ticket_releases_on_drop() {
        let guard = Arc::new(SingleFlightGuard::new());
        let ticket = guard.acquire("m1").unwrap();
        assert_eq!(ticket.id(), "m1");
        assert!(guard.is_in_flight("m1"));
        assert!(guard.acquire("m1").is_none());
        drop(ticket);
        assert!(!guard.is_in_flight("m1"));
        assert!(guard.acquire("m1").is_some());
    }

    #[test]
    fn ticket_releases_when_work_panics() {
        let guard = Arc::new(SingleFlightGuard::new());
        let g = Arc::clone(&guard);
        let result = std::thread::spawn(move || {
            let _ticket = g.acquire("m1").unwrap();
            panic!("work failed");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_in_flight("m1"));
    }

    #[test]
    fn concurrent_acquires_admit_exactly_one() {
        let guard = Arc::new(SingleFlightGuard::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let g = Arc::clone(&guard);
                std::thread::spawn(move || g.try_acquire("same"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
