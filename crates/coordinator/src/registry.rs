use dashmap::DashMap;
use mailhive_common::{HiveError, HiveResult};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Coordinator's view of one connected worker
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub worker_id: String,
    pub free_capacity: usize,
    pub last_seen: Instant,
}

impl WorkerSlot {
    pub fn is_fresh(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= stale_after
    }
}

/// Row of the `/api/workers` listing
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub free_capacity: usize,
    pub seconds_since_seen: u64,
}

/// Select the worker that should receive a request needing `required` slots
///
/// # Algorithm
/// 1. Drop slots that missed too many announcements (`stale_after`)
/// 2. Keep slots whose announced capacity covers `required`
/// 3. Select the one with the highest announced capacity
///
/// # Returns
/// - `Some(slot)` with the selected worker
/// - `None` if no fresh worker has enough capacity
pub fn select_worker<'a>(
    slots: &'a [WorkerSlot],
    required: usize,
    stale_after: Duration,
    now: Instant,
) -> Option<&'a WorkerSlot> {
    slots
        .iter()
        .filter(|slot| slot.is_fresh(now, stale_after))
        .filter(|slot| slot.free_capacity >= required)
        .max_by_key(|slot| slot.free_capacity)
}

/// In-memory directory of connected workers and their announced capacity
pub struct WorkerRegistry {
    slots: DashMap<String, WorkerSlot>,
    stale_after: Duration,
}

impl WorkerRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            stale_after,
        }
    }

    /// Create or update a slot from an announcement. Returns true for a new worker.
    pub fn upsert(&self, worker_id: &str, free_capacity: usize) -> bool {
        let now = Instant::now();
        let mut created = false;

        self.slots
            .entry(worker_id.to_string())
            .and_modify(|slot| {
                slot.free_capacity = free_capacity;
                slot.last_seen = now;
            })
            .or_insert_with(|| {
                created = true;
                WorkerSlot {
                    worker_id: worker_id.to_string(),
                    free_capacity,
                    last_seen: now,
                }
            });

        if created {
            info!(worker_id = %worker_id, "Worker registered with capacity {}", free_capacity);
        } else {
            debug!(worker_id = %worker_id, "Worker announced capacity {}", free_capacity);
        }
        created
    }

    pub fn remove(&self, worker_id: &str) -> Option<WorkerSlot> {
        let removed = self.slots.remove(worker_id).map(|(_, slot)| slot);
        if removed.is_some() {
            info!(worker_id = %worker_id, "Worker removed from registry");
        }
        removed
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerSlot> {
        self.slots.get(worker_id).map(|slot| slot.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerSlot> {
        self.slots.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        let now = Instant::now();
        let mut rows: Vec<WorkerSummary> = self
            .slots
            .iter()
            .map(|entry| WorkerSummary {
                worker_id: entry.worker_id.clone(),
                free_capacity: entry.free_capacity,
                seconds_since_seen: now.saturating_duration_since(entry.last_seen).as_secs(),
            })
            .collect();
        rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        rows
    }

    /// Highest capacity among workers still taking part in selection
    pub fn max_fresh_capacity(&self) -> usize {
        let now = Instant::now();
        self.slots
            .iter()
            .filter(|entry| entry.is_fresh(now, self.stale_after))
            .map(|entry| entry.free_capacity)
            .max()
            .unwrap_or(0)
    }

    /// Pick a worker for `required` slots and deduct them from its announced
    /// capacity until its next announcement
    pub fn reserve(&self, required: usize) -> HiveResult<String> {
        // Another dispatch can drain the chosen slot between select and deduct
        for _ in 0..=self.slots.len() {
            let now = Instant::now();
            let snapshot = self.snapshot();
            let Some(candidate) = select_worker(&snapshot, required, self.stale_after, now) else {
                break;
            };

            if let Some(mut slot) = self.slots.get_mut(&candidate.worker_id) {
                if slot.is_fresh(now, self.stale_after) && slot.free_capacity >= required {
                    slot.free_capacity -= required;
                    return Ok(slot.worker_id.clone());
                }
            }
        }

        Err(HiveError::Capacity(format!(
            "no worker can take {} job(s) (best fresh worker offers {}, {} registered)",
            required,
            self.max_fresh_capacity(),
            self.len()
        )))
    }

    /// Drop slots not seen for `max_age`; returns their ids
    pub fn prune(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| !entry.is_fresh(now, max_age))
            .map(|entry| entry.key().clone())
            .collect();

        for worker_id in &expired {
            self.slots.remove(worker_id);
            info!(worker_id = %worker_id, "Pruned worker after {:?} of silence", max_age);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE_AFTER: Duration = Duration::from_secs(5);

    /// Helper to create a WorkerSlot seen `age` ago
    fn make_slot(name: &str, free_capacity: usize, age: Duration, now: Instant) -> WorkerSlot {
        WorkerSlot {
            worker_id: name.to_string(),
            free_capacity,
            last_seen: now - age,
        }
    }

    // ==================== select_worker Tests ====================

    #[test]
    fn test_select_worker_empty_list() {
        let slots: Vec<WorkerSlot> = vec![];
        assert!(select_worker(&slots, 0, STALE_AFTER, Instant::now()).is_none());
    }

    #[test]
    fn test_select_worker_selects_highest_capacity() {
        let now = Instant::now();
        let slots = vec![
            make_slot("worker-1", 2, Duration::ZERO, now),
            make_slot("worker-2", 5, Duration::ZERO, now),
            make_slot("worker-3", 3, Duration::ZERO, now),
        ];

        let selected = select_worker(&slots, 1, STALE_AFTER, now).unwrap();
        assert_eq!(selected.worker_id, "worker-2");
    }

    #[test]
    fn test_select_worker_requires_enough_capacity() {
        let now = Instant::now();
        let slots = vec![make_slot("worker-1", 2, Duration::ZERO, now)];

        assert!(select_worker(&slots, 3, STALE_AFTER, now).is_none());
        assert!(select_worker(&slots, 2, STALE_AFTER, now).is_some());
    }

    #[test]
    fn test_select_worker_skips_stale_slots() {
        let now = Instant::now();
        let slots = vec![
            make_slot("crashed", 10, Duration::from_secs(30), now),
            make_slot("alive", 3, Duration::from_secs(1), now),
        ];

        let selected = select_worker(&slots, 1, STALE_AFTER, now).unwrap();
        assert_eq!(selected.worker_id, "alive");
    }

    #[test]
    fn test_select_worker_zero_requirement_accepts_busy_worker() {
        let now = Instant::now();
        let slots = vec![make_slot("busy", 0, Duration::ZERO, now)];

        let selected = select_worker(&slots, 0, STALE_AFTER, now).unwrap();
        assert_eq!(selected.worker_id, "busy");
    }

    // ==================== WorkerRegistry Tests ====================

    #[test]
    fn test_upsert_creates_then_updates_in_place() {
        let registry = WorkerRegistry::new(STALE_AFTER);

        assert!(registry.upsert("worker-1", 5));
        assert!(!registry.upsert("worker-1", 3));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("worker-1").unwrap().free_capacity, 3);
    }

    #[test]
    fn test_remove_deletes_slot() {
        let registry = WorkerRegistry::new(STALE_AFTER);
        registry.upsert("worker-1", 5);

        assert!(registry.remove("worker-1").is_some());
        assert!(registry.remove("worker-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserve_deducts_capacity() {
        let registry = WorkerRegistry::new(STALE_AFTER);
        registry.upsert("worker-1", 5);

        assert_eq!(registry.reserve(3).unwrap(), "worker-1");
        assert_eq!(registry.get("worker-1").unwrap().free_capacity, 2);

        let err = registry.reserve(3).unwrap_err();
        assert!(matches!(err, HiveError::Capacity(_)));
    }

    #[test]
    fn test_reserve_on_empty_registry_fails() {
        let registry = WorkerRegistry::new(STALE_AFTER);
        assert!(matches!(registry.reserve(0), Err(HiveError::Capacity(_))));
    }

    #[test]
    fn test_announcement_restores_reserved_capacity() {
        let registry = WorkerRegistry::new(STALE_AFTER);
        registry.upsert("worker-1", 4);
        registry.reserve(4).unwrap();

        registry.upsert("worker-1", 4);
        assert_eq!(registry.reserve(4).unwrap(), "worker-1");
    }

    #[test]
    fn test_prune_removes_silent_workers() {
        let registry = WorkerRegistry::new(STALE_AFTER);
        registry.upsert("worker-1", 1);

        assert!(registry.prune(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.prune(Duration::from_millis(5)), vec!["worker-1"]);
        assert!(registry.is_empty());
    }
}
