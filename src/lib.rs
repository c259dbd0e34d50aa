//! Concurrent chained hash tables mapping `u64` keys to `u64` values.
//!
//! Two variants share one contract: [`StripedTable`] guards each bucket chain with a
//! striped lock array, while [`LockFreeTable`] publishes chain nodes with a CAS on the
//! bucket head pointer. Both grow by a coordinated stop-the-world rehash entered
//! collectively through a worker [`Team`]; the [`driver`] module runs the batch
//! workload that interleaves concurrent operations with those resize points.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Barrier;

use log::debug;
use parking_lot::Mutex;

pub mod cli;
pub mod driver;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Reserved key sentinel; operations on this key are rejected at the API boundary.
pub const INVALID_KEY: u64 = u64::MAX;

/// Returned by lookups for absent keys; values equal to this are not storable.
pub const INVALID_VALUE: u64 = u64::MAX;

/// Chain depth observed during an insert that arms the resize flag.
pub const MAX_CHAIN_SIZE: usize = 8;

/// Default initial bucket count used by the binaries.
pub const DEFAULT_NUM_BUCKETS: usize = 64;

/// Default worker team size used by the binaries.
pub const DEFAULT_NUM_THREADS: usize = 16;

/// Buckets per lock stripe when a striped table is first created.
pub const INIT_NUM_LOCKS_RATIO: usize = 8;

// ================================================================================================
// HASH
// ================================================================================================

/// Bucket assignment for a key: multiply by 37, add 13, reduce modulo the bucket count.
///
/// The collision and saturation behaviour of the whole system depends on this exact
/// function; it is not a tunable.
#[inline(always)]
pub fn bucket_index(key: u64, num_buckets: usize) -> usize {
    (key.wrapping_mul(37).wrapping_add(13) % num_buckets as u64) as usize
}

// ================================================================================================
// CONFIGURATION AND SHARED TABLE STATE
// ================================================================================================

/// Per-table behaviour switches, fixed at construction so independent tables in one
/// process cannot interfere through shared globals.
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    /// Arm the resize flag when an insert observes a long chain.
    pub resize_enabled: bool,
    /// Maintain the `num_items` counter on new-node inserts.
    pub track_items: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            resize_enabled: true,
            track_items: true,
        }
    }
}

/// Counter and flag state common to both variants.
struct TableState {
    num_items: AtomicU64,
    resize_needed: AtomicBool,
    config: TableConfig,
}

impl TableState {
    fn new(config: TableConfig) -> Self {
        Self {
            num_items: AtomicU64::new(0),
            resize_needed: AtomicBool::new(false),
            config,
        }
    }

    /// Bookkeeping after a successful new-node insert: count it and, at sufficient scan
    /// depth, arm the resize flag. The flag is read before it is written so a saturated
    /// chain does not generate one store per insert.
    #[inline(always)]
    fn note_new_node(&self, depth: usize) {
        if self.config.track_items {
            self.num_items.fetch_add(1, Ordering::Relaxed);
        }
        if self.config.resize_enabled
            && depth >= MAX_CHAIN_SIZE
            && !self.resize_needed.load(Ordering::Relaxed)
        {
            self.resize_needed.store(true, Ordering::Relaxed);
        }
    }
}

// ================================================================================================
// WORKER TEAM
// ================================================================================================

/// A fixed-size team of cooperating worker threads.
///
/// The team's barrier is the only synchronisation the collective resize needs: every
/// wait is a quiescent point, and the barrier's leader election picks the one member
/// that performs the serial steps.
pub struct Team {
    barrier: Barrier,
    size: usize,
}

impl Team {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            barrier: Barrier::new(size),
            size,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Block until every member arrives. Exactly one member per wait sees `true`.
    #[inline(always)]
    pub fn wait(&self) -> bool {
        self.barrier.wait().is_leader()
    }
}

/// Contiguous static share of `len` buckets for `worker` out of `workers`.
#[inline(always)]
fn partition(len: usize, workers: usize, worker: usize) -> (usize, usize) {
    let per = len.div_ceil(workers);
    let start = (worker * per).min(len);
    (start, (start + per).min(len))
}

// ================================================================================================
// SHARED TABLE CONTRACT
// ================================================================================================

/// The external contract shared by both table variants.
///
/// `lookup` and `insert` are callable from any worker thread. `resize` is collective:
/// every member of the team must enter it together, with no other operation in flight.
/// Dropping the table frees all nodes, buckets, and locks.
pub trait ChainedTable: Send + Sync + Sized {
    /// Short variant name for reports and logs.
    const VARIANT: &'static str;

    /// Allocate a table with `num_buckets` chains. The striped variant also allocates
    /// `num_locks` lock stripes; the lock-free variant ignores the argument. Both
    /// counts are clamped to at least 1.
    fn with_config(num_buckets: usize, num_locks: usize, config: TableConfig) -> Self;

    /// Value stored under `key`, or [`INVALID_VALUE`] if the key is absent or is the
    /// reserved sentinel.
    fn lookup(&self, key: u64) -> u64;

    /// Insert a pair, overwriting in place when the key is already chained. Sentinel
    /// keys and values are silently dropped.
    fn insert(&self, key: u64, value: u64);

    /// Collective stop-the-world rehash into a table with twice the buckets.
    ///
    /// Must be entered by every member of `team` simultaneously; `worker` is the
    /// caller's index in `0..team.size()`.
    fn resize(&self, team: &Team, worker: usize);

    /// Whether some insert has observed a chain of [`MAX_CHAIN_SIZE`] or more.
    fn resize_needed(&self) -> bool;

    fn num_buckets(&self) -> usize;

    /// New-node inserts acknowledged so far. Stays 0 when item tracking is off.
    fn num_items(&self) -> u64;
}

// ================================================================================================
// STRIPED-LOCK VARIANT
// ================================================================================================

/// Chain node. Allocated by the inserting thread, owned by its bucket, freed only when
/// the owning core is dropped.
struct Node {
    key: u64,
    value: u64,
    next: *mut Node,
}

/// One lock stripe, padded to a cache line so neighbouring stripes do not false-share.
#[repr(align(64))]
struct PaddedLock(Mutex<()>);

/// Bucket array plus lock stripes; replaced wholesale by a resize.
///
/// Head slots are plain pointers behind `UnsafeCell`: every read or write of a head
/// happens either under the bucket's lock stripe or at a team quiescent point.
struct StripedCore {
    buckets: Box<[UnsafeCell<*mut Node>]>,
    locks: Box<[PaddedLock]>,
}

impl StripedCore {
    fn new(num_buckets: usize, num_locks: usize) -> Self {
        let buckets = (0..num_buckets.max(1))
            .map(|_| UnsafeCell::new(ptr::null_mut()))
            .collect();
        let locks = (0..num_locks.max(1))
            .map(|_| PaddedLock(Mutex::new(())))
            .collect();
        Self { buckets, locks }
    }

    #[inline(always)]
    fn lock_for(&self, bucket: usize) -> &Mutex<()> {
        &self.locks[bucket % self.locks.len()].0
    }

    #[inline(always)]
    fn head(&self, bucket: usize) -> *mut Node {
        unsafe { *self.buckets[bucket].get() }
    }

    #[inline(always)]
    fn set_head(&self, bucket: usize, node: *mut Node) {
        unsafe { *self.buckets[bucket].get() = node }
    }

    /// Prepend a copied payload without a uniqueness scan, holding only the target
    /// bucket's stripe. Rehash-only: the source table held each key at most once.
    fn rehash_insert(&self, key: u64, value: u64) {
        let bucket = bucket_index(key, self.buckets.len());
        let _guard = self.lock_for(bucket).lock();
        let node = Box::into_raw(Box::new(Node {
            key,
            value,
            next: self.head(bucket),
        }));
        self.set_head(bucket, node);
    }
}

impl Drop for StripedCore {
    fn drop(&mut self) {
        for slot in self.buckets.iter() {
            let mut curr = unsafe { *slot.get() };
            while !curr.is_null() {
                let node = unsafe { Box::from_raw(curr) };
                curr = node.next;
            }
        }
    }
}

/// Striped-lock chained hash table.
///
/// Each operation takes exactly one lock: the stripe covering the key's bucket. The
/// rehash takes one stripe of the staging core at a time. No thread ever holds two
/// locks, so the scheme is deadlock-free by structure.
pub struct StripedTable {
    core: UnsafeCell<StripedCore>,
    staging: UnsafeCell<Option<StripedCore>>,
    state: TableState,
}

// SAFETY: chain heads are only touched under their bucket's lock stripe, and `core` /
// `staging` are only replaced inside the collective resize while every other worker is
// parked between team barriers. Nodes are freed only when a core is dropped at one of
// those quiescent points, so no thread can still hold a pointer into a freed chain.
unsafe impl Send for StripedTable {}
unsafe impl Sync for StripedTable {}

impl StripedTable {
    #[inline(always)]
    fn core(&self) -> &StripedCore {
        unsafe { &*self.core.get() }
    }
}

impl ChainedTable for StripedTable {
    const VARIANT: &'static str = "striped";

    fn with_config(num_buckets: usize, num_locks: usize, config: TableConfig) -> Self {
        Self {
            core: UnsafeCell::new(StripedCore::new(num_buckets, num_locks)),
            staging: UnsafeCell::new(None),
            state: TableState::new(config),
        }
    }

    fn lookup(&self, key: u64) -> u64 {
        if key == INVALID_KEY {
            return INVALID_VALUE;
        }
        let core = self.core();
        let bucket = bucket_index(key, core.buckets.len());
        let _guard = core.lock_for(bucket).lock();
        let mut curr = core.head(bucket);
        while !curr.is_null() {
            let node = unsafe { &*curr };
            if node.key == key {
                return node.value;
            }
            curr = node.next;
        }
        INVALID_VALUE
    }

    fn insert(&self, key: u64, value: u64) {
        if key == INVALID_KEY || value == INVALID_VALUE {
            return;
        }
        let core = self.core();
        let bucket = bucket_index(key, core.buckets.len());
        let mut depth = 0;
        {
            let _guard = core.lock_for(bucket).lock();
            let head = core.head(bucket);
            let mut curr = head;
            while !curr.is_null() {
                let node = unsafe { &mut *curr };
                if node.key == key {
                    node.value = value;
                    return;
                }
                depth += 1;
                curr = node.next;
            }
            let node = Box::into_raw(Box::new(Node {
                key,
                value,
                next: head,
            }));
            core.set_head(bucket, node);
        }
        self.state.note_new_node(depth);
    }

    fn resize(&self, team: &Team, worker: usize) {
        if team.wait() {
            let core = self.core();
            let staging = StripedCore::new(core.buckets.len() * 2, core.locks.len() * 2);
            debug!(
                "striped resize: {} -> {} buckets",
                core.buckets.len(),
                staging.buckets.len()
            );
            // SAFETY: one writer; every other worker is parked at the barrier below.
            unsafe { *self.staging.get() = Some(staging) };
        }
        team.wait();

        let core = self.core();
        // SAFETY: published by the leader before the barrier above; the slot is not
        // written again until after the next barrier.
        let staging = unsafe { (*self.staging.get()).as_ref().unwrap() };
        let (start, end) = partition(core.buckets.len(), team.size(), worker);
        for bucket in start..end {
            let mut curr = core.head(bucket);
            while !curr.is_null() {
                let node = unsafe { &*curr };
                staging.rehash_insert(node.key, node.value);
                curr = node.next;
            }
        }

        if team.wait() {
            // SAFETY: rehash traffic stopped at the barrier above; dropping the old
            // core frees its nodes at a quiescent point.
            unsafe {
                let staging = (*self.staging.get()).take().unwrap();
                drop(std::mem::replace(&mut *self.core.get(), staging));
            }
            self.state.resize_needed.store(false, Ordering::Relaxed);
        }
        team.wait();
    }

    #[inline(always)]
    fn resize_needed(&self) -> bool {
        self.state.resize_needed.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn num_buckets(&self) -> usize {
        self.core().buckets.len()
    }

    #[inline(always)]
    fn num_items(&self) -> u64 {
        self.state.num_items.load(Ordering::Relaxed)
    }
}

// ================================================================================================
// LOCK-FREE VARIANT
// ================================================================================================

/// Chain node for the lock-free variant. `next` is written once, before the node is
/// published by the head CAS, and never changes afterwards; `value` may be overwritten
/// in place by a later insert and so lives in an atomic.
struct AtomicNode {
    key: u64,
    value: AtomicU64,
    next: *mut AtomicNode,
}

/// Bucket array of atomic head pointers; replaced wholesale by a resize.
struct LockFreeCore {
    buckets: Box<[AtomicPtr<AtomicNode>]>,
}

impl LockFreeCore {
    fn new(num_buckets: usize) -> Self {
        let buckets = (0..num_buckets.max(1))
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self { buckets }
    }

    /// CAS-prepend a copied payload without a uniqueness scan. Rehash-only: the source
    /// table held each key at most once, so no duplicate can be introduced.
    fn rehash_insert(&self, key: u64, value: u64) {
        let bucket = bucket_index(key, self.buckets.len());
        let head = &self.buckets[bucket];
        let node = Box::into_raw(Box::new(AtomicNode {
            key,
            value: AtomicU64::new(value),
            next: ptr::null_mut(),
        }));
        let mut expected = head.load(Ordering::Acquire);
        loop {
            // SAFETY: `node` is unpublished until the CAS succeeds.
            unsafe { (*node).next = expected };
            match head.compare_exchange_weak(expected, node, Ordering::Release, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => expected = actual,
            }
        }
    }
}

impl Drop for LockFreeCore {
    fn drop(&mut self) {
        for head in self.buckets.iter() {
            let mut curr = head.load(Ordering::Relaxed);
            while !curr.is_null() {
                let node = unsafe { Box::from_raw(curr) };
                curr = node.next;
            }
        }
    }
}

/// Lock-free chained hash table.
///
/// Readers are wait-free: one acquire load of the bucket head, then a walk over
/// immutable `next` pointers. Writers retry a head CAS; a failed CAS rescans the chain
/// so a racing insert of the same key is found as an update rather than duplicated.
pub struct LockFreeTable {
    core: UnsafeCell<LockFreeCore>,
    staging: UnsafeCell<Option<LockFreeCore>>,
    state: TableState,
}

// SAFETY: bucket heads are atomics, `next` fields are immutable after publication, and
// `value` fields are atomics. `core` / `staging` are only replaced inside the
// collective resize while every other worker is parked between team barriers, which is
// also the only point where nodes are freed, so readers never traverse freed memory.
unsafe impl Send for LockFreeTable {}
unsafe impl Sync for LockFreeTable {}

impl LockFreeTable {
    #[inline(always)]
    fn core(&self) -> &LockFreeCore {
        unsafe { &*self.core.get() }
    }
}

impl ChainedTable for LockFreeTable {
    const VARIANT: &'static str = "lock-free";

    fn with_config(num_buckets: usize, _num_locks: usize, config: TableConfig) -> Self {
        Self {
            core: UnsafeCell::new(LockFreeCore::new(num_buckets)),
            staging: UnsafeCell::new(None),
            state: TableState::new(config),
        }
    }

    fn lookup(&self, key: u64) -> u64 {
        if key == INVALID_KEY {
            return INVALID_VALUE;
        }
        let core = self.core();
        let bucket = bucket_index(key, core.buckets.len());
        let mut curr = core.buckets[bucket].load(Ordering::Acquire);
        while !curr.is_null() {
            let node = unsafe { &*curr };
            if node.key == key {
                return node.value.load(Ordering::Relaxed);
            }
            curr = node.next;
        }
        INVALID_VALUE
    }

    fn insert(&self, key: u64, value: u64) {
        if key == INVALID_KEY || value == INVALID_VALUE {
            return;
        }
        let core = self.core();
        let head = &core.buckets[bucket_index(key, core.buckets.len())];
        let node = Box::into_raw(Box::new(AtomicNode {
            key,
            value: AtomicU64::new(value),
            next: ptr::null_mut(),
        }));
        let mut depth;
        loop {
            depth = 0;
            let expected = head.load(Ordering::Acquire);
            let mut curr = expected;
            while !curr.is_null() {
                let existing = unsafe { &*curr };
                if existing.key == key {
                    existing.value.store(value, Ordering::Relaxed);
                    // The pre-allocated node was never published.
                    drop(unsafe { Box::from_raw(node) });
                    return;
                }
                depth += 1;
                curr = existing.next;
            }
            // SAFETY: `node` is unpublished until the CAS succeeds.
            unsafe { (*node).next = expected };
            if head
                .compare_exchange(expected, node, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.state.note_new_node(depth);
    }

    fn resize(&self, team: &Team, worker: usize) {
        if team.wait() {
            let core = self.core();
            let staging = LockFreeCore::new(core.buckets.len() * 2);
            debug!(
                "lock-free resize: {} -> {} buckets",
                core.buckets.len(),
                staging.buckets.len()
            );
            // SAFETY: one writer; every other worker is parked at the barrier below.
            unsafe { *self.staging.get() = Some(staging) };
        }
        team.wait();

        let core = self.core();
        // SAFETY: published by the leader before the barrier above; the slot is not
        // written again until after the next barrier.
        let staging = unsafe { (*self.staging.get()).as_ref().unwrap() };
        let (start, end) = partition(core.buckets.len(), team.size(), worker);
        for bucket in start..end {
            let mut curr = core.buckets[bucket].load(Ordering::Relaxed);
            while !curr.is_null() {
                let node = unsafe { &*curr };
                staging.rehash_insert(node.key, node.value.load(Ordering::Relaxed));
                curr = node.next;
            }
        }

        if team.wait() {
            // SAFETY: rehash traffic stopped at the barrier above; dropping the old
            // core frees its nodes at a quiescent point.
            unsafe {
                let staging = (*self.staging.get()).take().unwrap();
                drop(std::mem::replace(&mut *self.core.get(), staging));
            }
            self.state.resize_needed.store(false, Ordering::Relaxed);
        }
        team.wait();
    }

    #[inline(always)]
    fn resize_needed(&self) -> bool {
        self.state.resize_needed.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn num_buckets(&self) -> usize {
        self.core().buckets.len()
    }

    #[inline(always)]
    fn num_items(&self) -> u64 {
        self.state.num_items.load(Ordering::Relaxed)
    }
}

// ================================================================================================
// UNIT TESTS
// ================================================================================================
