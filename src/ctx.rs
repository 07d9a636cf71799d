use crate::error::Error;
use crate::media::{CompleteFn, Media, MediaCommand, QueueId};
use crate::mempool::{Mempool, MpEntry, PoolMode, PoolType};
use crate::sync::SpinLock;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use log::warn;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A per-thread asynchronous submission context.
///
/// Pairs one media queue with one completion thread (spawned and joined
/// inside the media layer) and the `(Mcmd, tid)` pool bucket its command
/// descriptors live in. Submission is serialized by the qpair spin lock so a
/// context can be shared when callers take turns; completions are counted so
/// teardown can drain.
pub struct ThreadCtx {
    tid: u16,
    queue: QueueId,
    comp_active: Arc<AtomicBool>,
    qpair_spin: SpinLock<()>,
    inflight: Arc<AtomicU32>,
}

impl ThreadCtx {
    /// Create the context: the mcmd bucket holds `depth + 2` descriptors so
    /// the submitter can stage ahead of the queue.
    pub fn init(
        media: &Arc<dyn Media>,
        mempool: &Mempool,
        tid: u16,
        depth: u32,
        complete: CompleteFn,
    ) -> Result<ThreadCtx, Error> {
        mempool.create(
            PoolType::Mcmd,
            tid,
            depth + 2,
            size_of::<MediaCommand>() as u32,
            PoolMode::Spsc,
            None,
        )?;
        let comp_active = Arc::new(AtomicBool::new(true));
        let inflight = Arc::new(AtomicU32::new(0));
        let counted = inflight.clone();
        // The in-flight count drops only after the handler has released the
        // command, so a drained context has nothing left in the pool's
        // checked-out state either.
        let wrapped: CompleteFn = Arc::new(move |cmd| {
            (complete.as_ref())(cmd);
            counted.fetch_sub(1, Ordering::AcqRel);
        });
        let queue = match media.asynch_init(depth, comp_active.clone(), wrapped) {
            Ok(queue) => queue,
            Err(err) => {
                warn!("ctx: asynchronous queue init failed for tid {}: {}", tid, err);
                let _ = mempool.destroy(PoolType::Mcmd, tid);
                return Err(Error::MempoolAsynchError);
            }
        };
        Ok(ThreadCtx {
            tid,
            queue,
            comp_active,
            qpair_spin: SpinLock::new(()),
            inflight,
        })
    }

    pub fn tid(&self) -> u16 {
        self.tid
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Fetch a descriptor slot and construct `cmd` in it.
    pub fn get_mcmd(&self, mempool: &Mempool, cmd: MediaCommand) -> Result<*mut MediaCommand, Error> {
        let ent = mempool.get(PoolType::Mcmd, self.tid)?;
        Ok(unsafe { mcmd_init(ent, cmd) })
    }

    /// Queue one command on the media. The command completes on the
    /// context's completion thread.
    pub fn submit(&self, media: &dyn Media, cmd: *mut MediaCommand) -> Result<(), Error> {
        let _guard = self.qpair_spin.lock();
        self.inflight.fetch_add(1, Ordering::AcqRel);
        match media.submit_io(self.queue, cmd) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inflight.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Wait until every submitted command has completed.
    pub fn drain(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        while self.inflight.load(Ordering::Acquire) != 0 {
            if Instant::now() >= deadline {
                return Err(Error::DrainTimeout(
                    self.tid,
                    self.inflight.load(Ordering::Acquire),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Drain, stop the completion thread and release the descriptor bucket.
    pub fn exit(self, media: &dyn Media, mempool: &Mempool, timeout: Duration) -> Result<(), Error> {
        self.drain(timeout)?;
        self.comp_active.store(false, Ordering::Release);
        media
            .asynch_term(self.queue)
            .map_err(|_| Error::MempoolAsynchError)?;
        mempool.destroy(PoolType::Mcmd, self.tid)?;
        Ok(())
    }
}

/// Construct a media command inside pool slot `ent`.
///
/// # Safety
/// `ent` must be a checked-out slot of an `Mcmd` bucket, sized for a
/// `MediaCommand`. The returned pointer stays valid until
/// [`mcmd_release`].
pub(crate) unsafe fn mcmd_init(ent: NonNull<MpEntry>, cmd: MediaCommand) -> *mut MediaCommand {
    debug_assert!(ent.as_ref().len() >= size_of::<MediaCommand>());
    let slot = ent.as_ref().opaque() as *mut MediaCommand;
    ptr::write(
        slot,
        MediaCommand {
            mp_entry: ent.as_ptr(),
            ..cmd
        },
    );
    slot
}

/// Destroy a pooled media command and return its slot.
///
/// # Safety
/// `cmd` must have been produced by [`mcmd_init`] on a bucket keyed
/// `(Mcmd, tid)` and must not be touched afterwards.
pub(crate) unsafe fn mcmd_release(mempool: &Mempool, cmd: *mut MediaCommand, tid: u16) {
    let ent = (*cmd).mp_entry;
    ptr::drop_in_place(cmd);
    mempool.put(NonNull::new_unchecked(ent), PoolType::Mcmd, tid);
}
