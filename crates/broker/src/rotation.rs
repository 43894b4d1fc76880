//! Static-credential rotation scheduling.
//!
//! An in-memory priority queue of rotation deadlines (at most one entry per
//! role, deadlines strictly increasing across re-insertions), a fixed set
//! of sharded per-role locks bounding contention with administrative
//! updates, and a background driver popping due entries on a fixed tick.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keywell_core::RoleName;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Number of role lock shards. Bounded contention, not one lock per role.
const ROLE_LOCK_SHARDS: usize = 256;

/// A due rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEntry {
    /// The static role to rotate.
    pub role: RoleName,
    /// When it was (or is) due.
    pub due: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    due: DateTime<Utc>,
    role: RoleName,
}

/// Priority queue of rotation deadlines, keyed by role name.
///
/// The heap may carry superseded entries; the index map is authoritative
/// and stale heap entries are discarded lazily on pop.
#[derive(Debug, Default)]
pub struct RotationQueue {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    index: HashMap<RoleName, DateTime<Utc>>,
}

impl RotationQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `role` at `due`. A role already queued keeps its existing
    /// deadline; at most one entry per role exists at any time.
    pub fn push(&mut self, role: RoleName, due: DateTime<Utc>) -> bool {
        if self.index.contains_key(&role) {
            return false;
        }
        self.index.insert(role.clone(), due);
        self.heap.push(Reverse(HeapEntry { due, role }));
        true
    }

    /// Queue `role` at `due`, superseding any existing entry.
    pub fn push_or_replace(&mut self, role: RoleName, due: DateTime<Utc>) {
        self.index.insert(role.clone(), due);
        self.heap.push(Reverse(HeapEntry { due, role }));
    }

    /// Drop `role` from the queue.
    pub fn remove(&mut self, role: &RoleName) {
        self.index.remove(role);
    }

    /// Pop the earliest entry due at or before `now`, if any.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<RotationEntry> {
        while let Some(Reverse(HeapEntry { due, role })) = self.heap.pop() {
            if due > now {
                self.heap.push(Reverse(HeapEntry { due, role }));
                return None;
            }
            // Stale heap entries (removed or superseded roles) are skipped.
            if self.index.get(&role) == Some(&due) {
                self.index.remove(&role);
                return Some(RotationEntry { role, due });
            }
        }
        None
    }

    /// Number of queued roles.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }
}

/// Fixed-size set of locks sharded by role name.
///
/// The driver takes a role's shard lock for the duration of its rotation;
/// administrative updates of the same role take the same lock, so the two
/// never interleave. Unrelated roles rotate concurrently (modulo shard
/// collisions).
pub struct LockShards {
    shards: Vec<Mutex<()>>,
}

impl Default for LockShards {
    fn default() -> Self {
        Self::new()
    }
}

impl LockShards {
    /// The fixed shard set.
    pub fn new() -> Self {
        Self {
            shards: (0..ROLE_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// The shard guarding `name`.
    pub fn for_name(&self, name: &RoleName) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }
}

/// Driver tuning.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// How often the driver scans for due entries.
    pub tick: Duration,
    /// Requeue delay after a failed rotation. A role is never dropped from
    /// rotation because a rotation failed.
    pub failure_backoff: Duration,
    /// Floor enforced on configured rotation periods.
    pub min_rotation_period: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(10),
            min_rotation_period: crate::roles::MIN_ROTATION_PERIOD,
        }
    }
}

/// What a rotation attempt decided.
pub enum RotationOutcome {
    /// Rotated; queue the next deadline.
    Requeue(DateTime<Utc>),
    /// The role no longer exists; drop it from the schedule.
    Unscheduled,
}

/// The rotation scheduler: queue, shard locks, and the driver.
pub struct RotationScheduler {
    queue: Mutex<RotationQueue>,
    locks: LockShards,
    config: RotationConfig,
}

impl RotationScheduler {
    /// A scheduler with the given tuning.
    pub fn new(config: RotationConfig) -> Self {
        Self {
            queue: Mutex::new(RotationQueue::new()),
            locks: LockShards::new(),
            config,
        }
    }

    /// Driver tuning.
    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// The shard lock guarding `role`, shared with administrative updates.
    pub fn role_lock(&self, role: &RoleName) -> &Mutex<()> {
        self.locks.for_name(role)
    }

    /// Queue a role, keeping an existing entry if present.
    pub async fn queue_role(&self, role: RoleName, due: DateTime<Utc>) -> bool {
        self.queue.lock().await.push(role, due)
    }

    /// Queue a role, superseding any existing entry.
    pub async fn requeue_role(&self, role: RoleName, due: DateTime<Utc>) {
        self.queue.lock().await.push_or_replace(role, due);
    }

    /// Drop a role from the schedule.
    pub async fn unqueue_role(&self, role: &RoleName) {
        self.queue.lock().await.remove(role);
    }

    /// Number of scheduled roles.
    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Start the background driver.
    ///
    /// On every tick the driver pops all due entries; each rotation runs in
    /// its own task under the role's shard lock, so unrelated roles rotate
    /// concurrently while a rotation and an administrative update of the
    /// same role exclude each other. Cancellation is checked before every
    /// scheduled action, and tearing the driver down clears the queue so
    /// nothing keeps referencing retired state.
    pub fn spawn_driver<F, Fut>(
        self: &Arc<Self>,
        rotate: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn(RoleName) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<RotationOutcome>> + Send,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(scheduler.config.tick);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }

                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let entry = scheduler.queue.lock().await.pop_due(Utc::now());
                    let Some(entry) = entry else { break };

                    let scheduler = Arc::clone(&scheduler);
                    let rotate = rotate.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let _guard = scheduler.role_lock(&entry.role).lock().await;
                        let next = match rotate(entry.role.clone()).await {
                            Ok(RotationOutcome::Requeue(next)) => {
                                debug!(role = %entry.role, next = %next, "rotation complete");
                                next
                            }
                            Ok(RotationOutcome::Unscheduled) => {
                                info!(role = %entry.role, "role gone; dropping from rotation");
                                return;
                            }
                            Err(err) => {
                                // Requeue with a short backoff: transient
                                // failure must never drop a role out of
                                // rotation.
                                warn!(role = %entry.role, error = %err, "rotation failed; backing off");
                                Utc::now()
                                    + chrono::Duration::from_std(scheduler.config.failure_backoff)
                                        .unwrap_or_else(|_| chrono::Duration::seconds(10))
                            }
                        };
                        if !cancel.is_cancelled() {
                            scheduler.requeue_role(entry.role, next).await;
                        }
                    });
                }

                if cancel.is_cancelled() {
                    break;
                }
            }
            scheduler.queue.lock().await.clear();
            debug!("rotation driver stopped");
        })
    }
}
