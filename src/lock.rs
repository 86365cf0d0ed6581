//! Hierarchical read/write locks keyed by path and transaction id.
//!
//! A write lock on a path conflicts with any lock held by another
//! transaction on that path, an ancestor, or a descendant. Requests that
//! can't be granted immediately queue; the queue is scanned in order
//! (priority requests first, then arrival order) on every release.
//! Granted locks expire after the configured timeout, which poisons the
//! owning transaction id: all its later lock attempts fail. A fresh
//! transaction id is an independent transaction with no history.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::path;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Pending,
    Locked,
    Expired,
}

#[derive(Debug)]
struct LockEntry {
    id: u64,
    path: String,
    tid: u64,
    for_writing: bool,
    state: LockState,
    priority: bool,
    no_timeout: bool,
    comment: String,
    expires: Option<Instant>,
    /// The first conflicting lock observed on the last queue scan
    waiting_for: Option<u64>,
}

#[derive(Default)]
struct LockTable {
    locks: Vec<LockEntry>,
    poisoned: HashSet<u64>,
    next_id: u64,
}

struct Shared {
    table: Mutex<LockTable>,
    cond: Condvar,
    timeout: Duration,
}

/// Extra acquisition knobs. Priority is deliberately not here: queue
/// jumping is reserved for lock path migration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    pub no_timeout: bool,
}

pub struct LockManager {
    shared: Arc<Shared>,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(LockTable::default()),
                cond: Condvar::new(),
                timeout,
            }),
        }
    }

    pub fn lock(&self, path: &str, tid: u64, for_writing: bool, comment: &str) -> Result<NodeLock> {
        self.lock_with(path, tid, for_writing, comment, LockOptions::default())
    }

    pub fn lock_with(
        &self,
        path: &str,
        tid: u64,
        for_writing: bool,
        comment: &str,
        opts: LockOptions,
    ) -> Result<NodeLock> {
        let mut table = self.shared.table.lock().unwrap();
        sweep_expired(&mut table);
        let (table, acquired) = acquire(
            &self.shared,
            table,
            path,
            tid,
            for_writing,
            comment,
            false,
            opts.no_timeout,
        );
        drop(table);
        let id = acquired?;
        Ok(NodeLock {
            shared: self.shared.clone(),
            id,
            path: path.to_string(),
            tid,
            for_writing,
            comment: comment.to_string(),
            no_timeout: opts.no_timeout,
            released: false,
        })
    }

    /// Number of currently granted locks. Test hook.
    #[cfg(test)]
    fn granted_count(&self) -> usize {
        let table = self.shared.table.lock().unwrap();
        table
            .locks
            .iter()
            .filter(|l| l.state == LockState::Locked)
            .count()
    }
}

/// Queue a request and wait for its grant. Takes the held table guard so
/// queueing is atomic with whatever the caller just did, and returns it
/// so the caller decides when to let go.
#[allow(clippy::too_many_arguments)]
fn acquire<'a>(
    shared: &'a Shared,
    mut table: MutexGuard<'a, LockTable>,
    path: &str,
    tid: u64,
    for_writing: bool,
    comment: &str,
    priority: bool,
    no_timeout: bool,
) -> (MutexGuard<'a, LockTable>, Result<u64>) {
    if table.poisoned.contains(&tid) {
        let err = Error::LockExpired {
            tid,
            path: path.to_string(),
        };
        return (table, Err(err));
    }
    let id = table.next_id;
    table.next_id += 1;
    table.locks.push(LockEntry {
        id,
        path: path.to_string(),
        tid,
        for_writing,
        state: LockState::Pending,
        priority,
        no_timeout,
        comment: comment.to_string(),
        expires: None,
        waiting_for: None,
    });
    process_queue(&mut table, shared.timeout);

    let deadline = Instant::now() + shared.timeout;
    loop {
        let granted = table
            .locks
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.state == LockState::Locked)
            .expect("own lock request vanished from the table");
        if granted {
            log::debug!(
                "{} lock {} granted on \"{}\" to tid {} ({})",
                if for_writing { "write" } else { "read" },
                id,
                path,
                tid,
                comment
            );
            shared.cond.notify_all();
            return (table, Ok(id));
        }
        let now = Instant::now();
        if now >= deadline {
            table.locks.retain(|l| l.id != id);
            process_queue(&mut table, shared.timeout);
            shared.cond.notify_all();
            let err = Error::LockTimeout {
                path: path.to_string(),
                for_writing,
                comment: comment.to_string(),
            };
            return (table, Err(err));
        }
        let (t, _) = shared.cond.wait_timeout(table, deadline - now).unwrap();
        table = t;
        sweep_expired(&mut table);
        process_queue(&mut table, shared.timeout);
    }
}

/// Move granted locks past their deadline into the expired state and
/// poison their transaction.
fn sweep_expired(table: &mut LockTable) {
    let now = Instant::now();
    let LockTable {
        locks, poisoned, ..
    } = table;
    for l in locks.iter_mut() {
        if l.state == LockState::Locked {
            if let Some(exp) = l.expires {
                if exp <= now {
                    log::warn!(
                        "lock {} on \"{}\" held by tid {} expired ({})",
                        l.id,
                        l.path,
                        l.tid,
                        l.comment
                    );
                    l.state = LockState::Expired;
                    poisoned.insert(l.tid);
                }
            }
        }
    }
}

/// One in-order scan of the pending queue: priority requests first, then
/// arrival order. Each request whose conflict is gone (considering locks
/// granted earlier in this same scan) is granted.
fn process_queue(table: &mut LockTable, timeout: Duration) {
    let mut order: Vec<usize> = (0..table.locks.len())
        .filter(|&i| table.locks[i].state == LockState::Pending)
        .collect();
    order.sort_by_key(|&i| (!table.locks[i].priority, table.locks[i].id));

    for idx in order {
        let me = &table.locks[idx];
        let (p, t, w) = (me.path.clone(), me.tid, me.for_writing);
        let conflict = table
            .locks
            .iter()
            .find(|l| {
                l.state == LockState::Locked
                    && l.tid != t
                    && (l.for_writing || w)
                    && path::same_trail(&l.path, &p)
            })
            .map(|l| l.id);
        let entry = &mut table.locks[idx];
        match conflict {
            Some(cid) => entry.waiting_for = Some(cid),
            None => {
                entry.state = LockState::Locked;
                entry.waiting_for = None;
                entry.expires = (!entry.no_timeout).then(|| Instant::now() + timeout);
            }
        }
    }
}

fn release_id(shared: &Shared, id: u64) {
    let mut table = shared.table.lock().unwrap();
    if let Some(pos) = table.locks.iter().position(|l| l.id == id) {
        let entry = table.locks.remove(pos);
        log::debug!(
            "released lock {} on \"{}\" held by tid {}",
            entry.id,
            entry.path,
            entry.tid
        );
    }
    sweep_expired(&mut table);
    process_queue(&mut table, shared.timeout);
    drop(table);
    shared.cond.notify_all();
}

/// A held lock. Dropping releases it; `move_to`/`move_to_parent` migrate
/// it along the tree during multi-step operations.
pub struct NodeLock {
    shared: Arc<Shared>,
    id: u64,
    path: String,
    tid: u64,
    for_writing: bool,
    comment: String,
    no_timeout: bool,
    released: bool,
}

impl NodeLock {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn for_writing(&self) -> bool {
        self.for_writing
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            release_id(&self.shared, self.id);
        }
    }

    pub fn move_to_parent(&mut self) -> Result<()> {
        let parent = path::parent_path(&self.path).unwrap_or_default();
        self.move_to(&parent, self.for_writing)
    }

    /// Migrate this lock to another path. When the target is immediately
    /// grantable the lock's path is changed in place; otherwise the lock
    /// is released (without draining the queue — the replacement request
    /// is queued under the same table guard) and re-acquired with
    /// priority, so the migration completes ahead of other waiters.
    pub fn move_to(&mut self, new_path: &str, for_writing: bool) -> Result<()> {
        let mut table = self.shared.table.lock().unwrap();
        sweep_expired(&mut table);

        let pos = table.locks.iter().position(|l| l.id == self.id);
        let Some(pos) = pos else {
            self.released = true;
            return Err(Error::LockExpired {
                tid: self.tid,
                path: self.path.clone(),
            });
        };
        if table.locks[pos].state == LockState::Expired {
            return Err(Error::LockExpired {
                tid: self.tid,
                path: self.path.clone(),
            });
        }

        let conflict = table.locks.iter().any(|l| {
            l.id != self.id
                && l.state == LockState::Locked
                && l.tid != self.tid
                && (l.for_writing || for_writing)
                && path::same_trail(&l.path, new_path)
        });
        if !conflict {
            let timeout = self.shared.timeout;
            let entry = &mut table.locks[pos];
            log::debug!(
                "lock {} migrated \"{}\" -> \"{}\"",
                entry.id,
                entry.path,
                new_path
            );
            entry.path = new_path.to_string();
            entry.for_writing = for_writing;
            entry.expires = (!entry.no_timeout).then(|| Instant::now() + timeout);
            self.path = new_path.to_string();
            self.for_writing = for_writing;
            // The vacated subtree may unblock waiters
            process_queue(&mut table, self.shared.timeout);
            drop(table);
            self.shared.cond.notify_all();
            return Ok(());
        }

        // Give up the current position and re-queue with priority, all
        // under the same guard so nothing can slip in between.
        table.locks.remove(pos);
        let comment = self.comment.clone();
        let shared = self.shared.clone();
        let (table, acquired) = acquire(
            &shared,
            table,
            new_path,
            self.tid,
            for_writing,
            &comment,
            true,
            self.no_timeout,
        );
        drop(table);
        self.shared.cond.notify_all();
        match acquired {
            Ok(id) => {
                self.id = id;
                self.path = new_path.to_string();
                self.for_writing = for_writing;
                Ok(())
            }
            Err(e) => {
                // The old lock is gone and the new one never granted
                self.released = true;
                Err(e)
            }
        }
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLock")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("tid", &self.tid)
            .field("for_writing", &self.for_writing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn same_tid_never_conflicts() {
        let mgr = LockManager::new(Duration::from_millis(100));
        let a = mgr.lock("a", 1, true, "outer").unwrap();
        let b = mgr.lock("a/b", 1, true, "inner").unwrap();
        assert_eq!(mgr.granted_count(), 2);
        b.release();
        a.release();
    }

    #[test]
    fn reads_share_writes_exclude() {
        // Holders are exempt from expiry so the blocked writer's timeout
        // is what decides the outcome
        let held = LockOptions { no_timeout: true };
        let mgr = LockManager::new(Duration::from_millis(50));
        let r1 = mgr.lock_with("a", 1, false, "r1", held).unwrap();
        let _r2 = mgr.lock_with("a", 2, false, "r2", held).unwrap();
        // A writer on the same trail times out while readers hold it
        let err = mgr.lock("a/b", 3, true, "w").unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        drop(r1);
        // Still blocked by r2
        assert!(mgr.lock("a", 3, true, "w").is_err());
    }

    #[test]
    fn descendant_write_blocks_ancestor() {
        let held = LockOptions { no_timeout: true };
        let mgr = LockManager::new(Duration::from_millis(50));
        let _w = mgr.lock_with("a/b/c", 1, true, "deep", held).unwrap();
        assert!(mgr.lock("a", 2, true, "shallow").is_err());
        assert!(mgr.lock("a", 2, false, "read").is_err());
        // Unrelated path is fine
        assert!(mgr.lock("x", 2, true, "other").is_ok());
    }

    #[test]
    fn release_grants_waiters_in_order() {
        let mgr = Arc::new(LockManager::new(Duration::from_secs(5)));
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = mgr.lock("p", 1, true, "holder").unwrap();

        let mut handles = Vec::new();
        for tag in [2u64, 3u64] {
            let mgr = mgr.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                let l = mgr.lock("p", tag, true, "waiter").unwrap();
                order.lock().unwrap().push(tag);
                thread::sleep(Duration::from_millis(20));
                l.release();
            }));
            // Make arrival order deterministic
            thread::sleep(Duration::from_millis(60));
        }
        first.release();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn expiry_poisons_the_tid() {
        let mgr = LockManager::new(Duration::from_millis(20));
        let held = mgr.lock("a", 7, true, "will expire").unwrap();
        thread::sleep(Duration::from_millis(40));
        // The expired lock no longer blocks other transactions
        let other = mgr.lock("a", 8, true, "fresh tid").unwrap();
        other.release();
        // ... but tid 7 is poisoned
        let err = mgr.lock("b", 7, false, "poisoned").unwrap_err();
        assert!(matches!(err, Error::LockExpired { .. }));
        drop(held);
    }

    #[test]
    fn migrate_in_place() {
        let mgr = LockManager::new(Duration::from_millis(100));
        let mut l = mgr.lock("a/b", 1, true, "migrating").unwrap();
        l.move_to_parent().unwrap();
        assert_eq!(l.path(), "a");
        l.move_to("a/c", true).unwrap();
        assert_eq!(l.path(), "a/c");
        assert_eq!(mgr.granted_count(), 1);
    }

    #[test]
    fn migration_jumps_the_queue() {
        let mgr = Arc::new(LockManager::new(Duration::from_secs(5)));
        let blocker = mgr.lock("t", 1, true, "blocker").unwrap();
        let mut migrating = mgr.lock("t/child", 1, true, "mover").unwrap();

        // A plain waiter from another transaction queues up on "t"
        let grant_tick = Arc::new(AtomicU64::new(0));
        let mgr2 = mgr.clone();
        let tick = grant_tick.clone();
        let waiter = thread::spawn(move || {
            let l = mgr2.lock("t", 2, true, "plain waiter").unwrap();
            tick.store(2, Ordering::SeqCst);
            l.release();
        });
        thread::sleep(Duration::from_millis(60));

        // Migrating to "t" conflicts with nothing (tid 1 holds both), so
        // it happens in place, ahead of the queued waiter
        migrating.move_to("t", true).unwrap();
        assert_eq!(grant_tick.load(Ordering::SeqCst), 0);

        blocker.release();
        drop(migrating);
        waiter.join().unwrap();
        assert_eq!(grant_tick.load(Ordering::SeqCst), 2);
    }
}
