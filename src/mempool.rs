use crate::dma::{AlignedAllocator, Allocator};
use crate::error::Error;
use crate::sync::SpinLock;
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use log::{debug, error};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const MP_THREADS: u16 = 64;
pub const MP_MAX_ENT: u32 = 65536 + 2;
pub const MP_MAX_ENT_SZ: u32 = 1024 * 1024;

/// Pool slots are carved at cache-line granularity.
const SLOT_ALIGN: usize = 64;

/// A lock-free getter keeps this many slots between itself and the producer
/// end of the list. Below the slack it sleeps instead of popping.
const STARVED_SLACK: u32 = 2;
const STARVED_SLEEP: Duration = Duration::from_millis(1);

/// The closed set of pool types. One bucket exists per `(type, tid)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolType {
    /// Media command descriptors, one bucket per thread context.
    Mcmd = 0,
    /// Provisioning reservation contexts for the write caller.
    ProCtx = 1,
    /// Client staging buffers.
    ClientBuffer = 2,
    /// Latency samples flowing to the telemetry flusher.
    LatencySample = 3,
    /// Node management entries.
    NodeMgmt = 4,
}

pub const MP_TYPES: u16 = 5;

/// Concurrency discipline of a bucket, fixed at create time.
///
/// `Spsc` buckets run without a lock: at most one thread calls `get` and at
/// most one different thread calls `put` concurrently. `Locked` buckets take
/// the bucket spin lock around every list operation and accept any number of
/// producers and consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMode {
    Spsc,
    Locked,
}

/// One preallocated pool slot.
///
/// `opaque` points at `ent_sz` bytes of 64-byte-aligned storage owned by the
/// bucket. Slots are chained through the intrusive `next` link while pooled
/// and unlinked while checked out.
#[repr(align(64))]
pub struct MpEntry {
    opaque: *mut u8,
    ent_sz: u32,
    tid: u16,
    entry_id: u32,
    next: AtomicPtr<MpEntry>,
}

impl MpEntry {
    pub fn opaque(&self) -> *mut u8 {
        self.opaque
    }

    pub fn len(&self) -> usize {
        self.ent_sz as usize
    }

    pub fn is_empty(&self) -> bool {
        self.ent_sz == 0
    }

    pub fn tid(&self) -> u16 {
        self.tid
    }

    pub fn entry_id(&self) -> u32 {
        self.entry_id
    }
}

struct Bucket {
    mode: PoolMode,
    entries: u32,
    ent_sz: u32,
    head: AtomicPtr<MpEntry>,
    tail: AtomicPtr<MpEntry>,
    /// Returns since the getter last reconciled; bumped by `put`.
    in_count: AtomicU32,
    /// Getter-side running take count; only the getter mutates it in `Spsc`
    /// mode.
    out_count: AtomicU32,
    list_spin: SpinLock<()>,
    allocator: Arc<dyn Allocator>,
}

impl Bucket {
    fn opaque_layout(&self) -> Layout {
        // Validated at create time.
        Layout::from_size_align(self.ent_sz as usize, SLOT_ALIGN).unwrap()
    }

    /// SPSC producer-side append. The tail node is never popped (the getter
    /// keeps `STARVED_SLACK` slots of distance), so writing its link here
    /// cannot race the getter.
    unsafe fn push_spsc(&self, ent: NonNull<MpEntry>) {
        ent.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert!(!tail.is_null());
        self.tail.store(ent.as_ptr(), Ordering::Relaxed);
        (*tail).next.store(ent.as_ptr(), Ordering::Release);
    }

    /// SPSC consumer-side pop. Callers guarantee at least
    /// `STARVED_SLACK + 1` pooled slots, so `head` has a successor.
    unsafe fn pop_spsc(&self) -> NonNull<MpEntry> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (*head).next.load(Ordering::Acquire);
        debug_assert!(!next.is_null());
        self.head.store(next, Ordering::Relaxed);
        (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
        NonNull::new_unchecked(head)
    }

    /// Append under the bucket spin lock.
    unsafe fn push_locked(&self, ent: NonNull<MpEntry>) {
        ent.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.is_null() {
            self.head.store(ent.as_ptr(), Ordering::Relaxed);
        } else {
            (*tail).next.store(ent.as_ptr(), Ordering::Relaxed);
        }
        self.tail.store(ent.as_ptr(), Ordering::Relaxed);
    }

    /// Pop under the bucket spin lock.
    unsafe fn pop_locked(&self) -> Option<NonNull<MpEntry>> {
        let head = self.head.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        let next = (*head).next.load(Ordering::Relaxed);
        self.head.store(next, Ordering::Relaxed);
        if next.is_null() {
            self.tail.store(ptr::null_mut(), Ordering::Relaxed);
        }
        (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
        Some(NonNull::new_unchecked(head))
    }

    /// Release every slot still on the list. Checked-out slots are the
    /// caller's loss, matching the destroy contract.
    fn free_pooled(&self) {
        let node_layout = Layout::new::<MpEntry>();
        let opaque_layout = self.opaque_layout();
        let mut freed = 0u32;
        while let Some(ent) = unsafe { self.pop_locked() } {
            unsafe {
                self.allocator.deallocate(ent.as_ref().opaque, opaque_layout);
                ptr::drop_in_place(ent.as_ptr());
                self.allocator.deallocate(ent.as_ptr() as *mut u8, node_layout);
            }
            freed += 1;
        }
        if freed != self.entries {
            error!(
                "mempool: bucket destroyed with {} of {} slots checked out",
                self.entries - freed,
                self.entries
            );
        }
    }
}

struct BucketCell {
    active: AtomicBool,
    bucket: UnsafeCell<Option<Bucket>>,
}

unsafe impl Send for BucketCell {}
unsafe impl Sync for BucketCell {}

impl BucketCell {
    fn new() -> Self {
        BucketCell {
            active: AtomicBool::new(false),
            bucket: UnsafeCell::new(None),
        }
    }
}

/// The typed, thread-partitioned free-list registry.
///
/// Buckets are keyed by `(PoolType, tid)`. Creation and destruction are
/// serialized by the admin lock; `get`/`put` touch only the bucket and obey
/// the bucket's [`PoolMode`] discipline. The buckets the translation layer
/// creates and their disciplines are listed in `DESIGN.md`.
pub struct Mempool {
    cells: Vec<BucketCell>,
    admin: SpinLock<()>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        let total = usize::from(MP_TYPES) * usize::from(MP_THREADS);
        let mut cells = Vec::with_capacity(total);
        for _ in 0..total {
            cells.push(BucketCell::new());
        }
        Mempool {
            cells,
            admin: SpinLock::new(()),
        }
    }

    fn cell(&self, ty: PoolType, tid: u16) -> Result<&BucketCell, Error> {
        if tid >= MP_THREADS {
            return Err(Error::MempoolOutOfBounds(ty as u16, tid));
        }
        Ok(&self.cells[ty as usize * usize::from(MP_THREADS) + usize::from(tid)])
    }

    /// Preallocate a bucket of `entries` slots of `ent_sz` bytes each.
    ///
    /// Fails if the bucket is already active, the shape is out of bounds, or
    /// allocation fails; a partial build is rolled back before returning.
    pub fn create(
        &self,
        ty: PoolType,
        tid: u16,
        entries: u32,
        ent_sz: u32,
        mode: PoolMode,
        allocator: Option<Arc<dyn Allocator>>,
    ) -> Result<(), Error> {
        let cell = self.cell(ty, tid)?;
        if entries == 0 || entries > MP_MAX_ENT || ent_sz == 0 || ent_sz > MP_MAX_ENT_SZ {
            return Err(Error::MempoolInvalid(entries, ent_sz));
        }
        // A lock-free getter never drains past the slack, so a bucket that
        // small could not serve a single get.
        if mode == PoolMode::Spsc && entries <= STARVED_SLACK {
            return Err(Error::MempoolInvalid(entries, ent_sz));
        }
        let opaque_layout = Layout::from_size_align(ent_sz as usize, SLOT_ALIGN)
            .map_err(|_| Error::MempoolInvalid(entries, ent_sz))?;
        let node_layout = Layout::new::<MpEntry>();

        let _admin = self.admin.lock();
        if cell.active.load(Ordering::Acquire) {
            return Err(Error::MempoolActive(ty as u16, tid));
        }

        let allocator = allocator.unwrap_or_else(|| Arc::new(AlignedAllocator));
        let mut head: *mut MpEntry = ptr::null_mut();
        let mut tail: *mut MpEntry = ptr::null_mut();

        let rollback = |head: *mut MpEntry, allocator: &Arc<dyn Allocator>| {
            let mut node = head;
            while !node.is_null() {
                unsafe {
                    let next = (*node).next.load(Ordering::Relaxed);
                    allocator.deallocate((*node).opaque, opaque_layout);
                    ptr::drop_in_place(node);
                    allocator.deallocate(node as *mut u8, node_layout);
                    node = next;
                }
            }
        };

        for entry_id in 0..entries {
            let node = match allocator.allocate(node_layout) {
                Ok(raw) => raw as *mut MpEntry,
                Err(_) => {
                    rollback(head, &allocator);
                    return Err(Error::MempoolMemError);
                }
            };
            let opaque = match allocator.allocate(opaque_layout) {
                Ok(raw) => raw,
                Err(_) => {
                    allocator.deallocate(node as *mut u8, node_layout);
                    rollback(head, &allocator);
                    return Err(Error::MempoolMemError);
                }
            };
            unsafe {
                ptr::write(
                    node,
                    MpEntry {
                        opaque,
                        ent_sz,
                        tid,
                        entry_id,
                        next: AtomicPtr::new(ptr::null_mut()),
                    },
                );
                if tail.is_null() {
                    head = node;
                } else {
                    (*tail).next.store(node, Ordering::Relaxed);
                }
                tail = node;
            }
        }

        let bucket = Bucket {
            mode,
            entries,
            ent_sz,
            head: AtomicPtr::new(head),
            tail: AtomicPtr::new(tail),
            in_count: AtomicU32::new(0),
            out_count: AtomicU32::new(0),
            list_spin: SpinLock::new(()),
            allocator,
        };
        unsafe { *cell.bucket.get() = Some(bucket) };
        cell.active.store(true, Ordering::Release);
        debug!(
            "mempool: bucket (type {:?}, tid {}) created with {} slots of {} B",
            ty, tid, entries, ent_sz
        );
        Ok(())
    }

    /// Tear down a bucket, releasing only the slots currently pooled.
    ///
    /// Callers must have stopped all `get`/`put` traffic on the bucket.
    /// Destroying an inactive bucket is a no-op.
    pub fn destroy(&self, ty: PoolType, tid: u16) -> Result<(), Error> {
        let cell = self.cell(ty, tid)?;
        let _admin = self.admin.lock();
        if !cell.active.load(Ordering::Acquire) {
            return Ok(());
        }
        cell.active.store(false, Ordering::Release);
        let bucket = unsafe { (*cell.bucket.get()).take() };
        if let Some(bucket) = bucket {
            bucket.free_pooled();
        }
        Ok(())
    }

    /// Take a slot, sleeping until one is available.
    ///
    /// In `Spsc` mode only one thread may be in `get` for a given bucket at
    /// any time.
    pub fn get(&self, ty: PoolType, tid: u16) -> Result<NonNull<MpEntry>, Error> {
        let cell = self.cell(ty, tid)?;
        if !cell.active.load(Ordering::Acquire) {
            return Err(Error::MempoolInvalid(0, 0));
        }
        let bucket = unsafe { (*cell.bucket.get()).as_ref().unwrap() };
        match bucket.mode {
            PoolMode::Spsc => {
                loop {
                    let out = bucket.out_count.load(Ordering::Relaxed);
                    if bucket.entries - out > STARVED_SLACK {
                        break;
                    }
                    thread::sleep(STARVED_SLEEP);
                    // Fold returned slots into the running take count.
                    let moved = bucket.in_count.load(Ordering::Acquire);
                    bucket.out_count.store(out - moved, Ordering::Relaxed);
                    bucket.in_count.fetch_sub(moved, Ordering::AcqRel);
                }
                let ent = unsafe { bucket.pop_spsc() };
                let out = bucket.out_count.load(Ordering::Relaxed);
                bucket.out_count.store(out + 1, Ordering::Relaxed);
                Ok(ent)
            }
            PoolMode::Locked => loop {
                {
                    let _guard = bucket.list_spin.lock();
                    if let Some(ent) = unsafe { bucket.pop_locked() } {
                        bucket.out_count.fetch_add(1, Ordering::Relaxed);
                        return Ok(ent);
                    }
                }
                thread::sleep(STARVED_SLEEP);
            },
        }
    }

    /// Return a slot to its bucket.
    ///
    /// In `Spsc` mode only one thread may be in `put` for a given bucket at
    /// any time, and it must not be the getter thread.
    pub fn put(&self, ent: NonNull<MpEntry>, ty: PoolType, tid: u16) {
        let cell = match self.cell(ty, tid) {
            Ok(cell) => cell,
            Err(_) => {
                error!("mempool: put with key (type {:?}, tid {}) out of bounds", ty, tid);
                return;
            }
        };
        if !cell.active.load(Ordering::Acquire) {
            error!("mempool: put into inactive bucket (type {:?}, tid {})", ty, tid);
            return;
        }
        debug_assert_eq!(unsafe { ent.as_ref().tid }, tid);
        let bucket = unsafe { (*cell.bucket.get()).as_ref().unwrap() };
        match bucket.mode {
            PoolMode::Spsc => {
                unsafe { bucket.push_spsc(ent) };
                bucket.in_count.fetch_add(1, Ordering::AcqRel);
            }
            PoolMode::Locked => {
                let _guard = bucket.list_spin.lock();
                unsafe { bucket.push_locked(ent) };
                bucket.out_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Approximate count of free slots in a bucket; 0 if inactive.
    pub fn left(&self, ty: PoolType, tid: u16) -> u32 {
        let cell = match self.cell(ty, tid) {
            Ok(cell) => cell,
            Err(_) => return 0,
        };
        if !cell.active.load(Ordering::Acquire) {
            return 0;
        }
        let bucket = unsafe { (*cell.bucket.get()).as_ref().unwrap() };
        let out = bucket.out_count.load(Ordering::Relaxed);
        match bucket.mode {
            PoolMode::Spsc => {
                let moved = bucket.in_count.load(Ordering::Relaxed);
                bucket.entries - out + moved
            }
            PoolMode::Locked => bucket.entries - out,
        }
    }

    pub fn is_active(&self, ty: PoolType, tid: u16) -> bool {
        self.cell(ty, tid)
            .map(|cell| cell.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Destroy every active bucket.
    pub fn exit(&self) {
        for ty in [
            PoolType::Mcmd,
            PoolType::ProCtx,
            PoolType::ClientBuffer,
            PoolType::LatencySample,
            PoolType::NodeMgmt,
        ] {
            for tid in 0..MP_THREADS {
                let _ = self.destroy(ty, tid);
            }
        }
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        self.exit();
    }
}
