use crate::ctx::{mcmd_release, ThreadCtx};
use crate::error::Error;
use crate::groups::Group;
use crate::map::Map;
use crate::media::{CompleteFn, Geometry, IoOpcode, Media, MediaAddr, MediaCommand};
use crate::mempool::{Mempool, PoolMode, PoolType};
use crate::pro::{ProReservation, PRO_MP_SZ};
use crate::stats::{StatType, Stats};
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use crossbeam::queue::SegQueue;
use log::{error, warn};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest append fragment, in sectors.
pub const WCA_SEC_PER_MCMD: u32 = 64;
/// Largest read fragment, in sectors.
pub const READ_SEC_PER_MCMD: u32 = 128;
/// The write caller owns thread id 0 and its pool buckets.
pub const WCA_TID: u16 = 0;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Per-fragment bookkeeping of one user command, fixed once the reservation
/// is fragmented and before the first submission.
struct Pieces {
    /// Device-assigned byte offset of each fragment, indexed by sequence.
    moffset: Vec<AtomicU64>,
    nsec: Vec<u32>,
}

pub type UcmdCallback = Box<dyn Fn(&UserCommand) + Send + Sync>;

/// An in-flight user write or read.
///
/// Shared between the submitting caller, the write caller thread and the
/// completion thread, so all mutable state is atomic. Media commands refer
/// back to it weakly; once the final completion has signalled `done`, late
/// references degrade to nothing.
pub struct UserCommand {
    pub opcode: IoOpcode,
    pub id: u64,
    pub level: u8,
    /// The application keeps the mapping (offset-list write) rather than the
    /// translation layer (object write).
    pub app_owned: bool,
    buf: *mut u8,
    size: u64,
    /// Starting byte offset on the media; read commands only.
    offset: u64,
    pieces: OnceCell<Pieces>,
    completed: AtomicU32,
    status: AtomicI32,
    callback: Option<UcmdCallback>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

unsafe impl Send for UserCommand {}
unsafe impl Sync for UserCommand {}

impl UserCommand {
    pub fn write(
        id: u64,
        buf: *mut u8,
        size: u64,
        level: u8,
        app_owned: bool,
        callback: Option<UcmdCallback>,
    ) -> Arc<UserCommand> {
        Arc::new(UserCommand {
            opcode: IoOpcode::Append,
            id,
            level,
            app_owned,
            buf,
            size,
            offset: 0,
            pieces: OnceCell::new(),
            completed: AtomicU32::new(0),
            status: AtomicI32::new(0),
            callback,
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        })
    }

    pub fn read(offset: u64, buf: *mut u8, size: u64) -> Arc<UserCommand> {
        Arc::new(UserCommand {
            opcode: IoOpcode::Read,
            id: 0,
            level: 0,
            app_owned: true,
            buf,
            size,
            offset,
            pieces: OnceCell::new(),
            completed: AtomicU32::new(0),
            status: AtomicI32::new(0),
            callback: None,
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        })
    }

    pub fn buf(&self) -> *mut u8 {
        self.buf
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Fragment count; 0 until the command has been fragmented.
    pub fn nmcmd(&self) -> u32 {
        self.pieces.get().map(|p| p.nsec.len() as u32).unwrap_or(0)
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    /// Byte offsets assigned by the device, in sequence order.
    pub fn offsets(&self) -> Vec<u64> {
        match self.pieces.get() {
            Some(pieces) => pieces
                .moffset
                .iter()
                .map(|off| off.load(Ordering::Acquire))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Publish the fragment shape. Must happen before the first submission.
    pub(crate) fn set_pieces(&self, nsec: Vec<u32>) {
        let moffset = nsec.iter().map(|_| AtomicU64::new(0)).collect();
        if self.pieces.set(Pieces { moffset, nsec }).is_err() {
            error!("wca: command fragmented twice");
        }
    }

    pub(crate) fn record_offset(&self, sequence: u16, byte_offset: u64) {
        if let Some(pieces) = self.pieces.get() {
            pieces.moffset[usize::from(sequence)].store(byte_offset, Ordering::Release);
        }
    }

    /// Record the first failure; later ones keep the original status.
    pub(crate) fn fail(&self, status: i32) {
        let _ = self
            .status
            .compare_exchange(0, status, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Count one finished fragment; true for the final one.
    pub(crate) fn finish_one(&self) -> bool {
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        done == self.nmcmd()
    }

    /// True when every fragment landed exactly after its predecessor.
    pub(crate) fn offsets_contiguous(&self, nbytes: u32) -> bool {
        let pieces = match self.pieces.get() {
            Some(pieces) => pieces,
            None => return true,
        };
        for i in 1..pieces.nsec.len() {
            let prev = pieces.moffset[i - 1].load(Ordering::Acquire);
            let here = pieces.moffset[i].load(Ordering::Acquire);
            if prev + u64::from(pieces.nsec[i - 1]) * u64::from(nbytes) != here {
                return false;
            }
        }
        true
    }

    /// Run the user callback and wake synchronous waiters.
    pub(crate) fn finalize(&self) {
        if let Some(callback) = &self.callback {
            (callback.as_ref())(self);
        }
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.done_cv.notify_all();
    }

    /// Fail a command that never made it to submission.
    pub(crate) fn abort(&self, status: i32) {
        self.fail(status);
        self.finalize();
    }

    /// Block until the final completion; returns the status code.
    pub fn wait(&self) -> i32 {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.done_cv.wait(done).unwrap();
        }
        self.status()
    }
}

/// The completion handler of the write path.
///
/// Runs on the media's completion thread. Successful fragments record their
/// device-assigned offset and commit the zone's write pointer; failed ones
/// rewind the reservation. The final fragment verifies offset contiguity for
/// translation-owned objects, upserts the mapping and wakes the caller. The
/// command descriptor goes back to its pool either way.
pub(crate) fn write_complete_fn(
    groups: Arc<Vec<Arc<Group>>>,
    map: Arc<Map>,
    stats: Arc<Stats>,
    mempool: Arc<Mempool>,
    media: Arc<dyn Media>,
    geo: Geometry,
) -> CompleteFn {
    Arc::new(move |raw: *mut MediaCommand| {
        let (parent, sequence, status, paddr, nsec, addr, level) = unsafe {
            let cmd = &*raw;
            (
                cmd.parent.upgrade(),
                cmd.sequence,
                cmd.status,
                cmd.paddr,
                cmd.nsec,
                cmd.addr,
                cmd.level,
            )
        };
        stats.record_io(
            IoOpcode::Append,
            u64::from(nsec) * u64::from(geo.nbytes),
            status,
        );
        if let Some(ucmd) = parent {
            let grp = &groups[usize::from(addr.grp())];
            if status != 0 {
                warn!(
                    "wca: append fragment {} failed with status 0x{:X}",
                    sequence, status
                );
                ucmd.fail(status);
                grp.release_run(addr.zone(), nsec, level);
                stats.inc(StatType::WriteCallbackFail, 1);
            } else {
                ucmd.record_offset(sequence, paddr * u64::from(geo.nbytes));
                grp.commit(media.as_ref(), addr.zone(), nsec);
            }
            if ucmd.finish_one() {
                finalize_write(&ucmd, &map, geo.nbytes);
            }
        }
        unsafe { mcmd_release(&mempool, raw, WCA_TID) };
    })
}

fn finalize_write(ucmd: &UserCommand, map: &Map, nbytes: u32) {
    if ucmd.status() == 0 && !ucmd.app_owned {
        if !ucmd.offsets_contiguous(nbytes) {
            ucmd.fail(Error::AppendOutOfSequence.status_code());
        } else if let Err(err) = map.upsert(ucmd.id, ucmd.offsets()[0], true) {
            ucmd.fail(err.status_code());
        }
    }
    ucmd.finalize();
}

/// The single writer thread of one translation-layer instance.
///
/// Callers enqueue user commands and return immediately; the writer thread
/// provisions, fragments and submits them through its own thread context.
pub struct WriteCaller {
    inbox: Arc<SegQueue<Arc<UserCommand>>>,
    running: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
    tctx: Arc<ThreadCtx>,
}

struct WriterShared {
    media: Arc<dyn Media>,
    mempool: Arc<Mempool>,
    groups: Arc<Vec<Arc<Group>>>,
    map: Arc<Map>,
    stats: Arc<Stats>,
    geo: Geometry,
    /// Round-robin cursor spreading user commands over groups.
    next_grp: AtomicU32,
}

impl WriteCaller {
    pub fn init(
        media: Arc<dyn Media>,
        mempool: Arc<Mempool>,
        groups: Arc<Vec<Arc<Group>>>,
        map: Arc<Map>,
        stats: Arc<Stats>,
        depth: u32,
    ) -> Result<WriteCaller, Error> {
        mempool.create(
            PoolType::ProCtx,
            WCA_TID,
            PRO_MP_SZ,
            size_of::<ProReservation>() as u32,
            PoolMode::Spsc,
            None,
        )?;
        let geo = media.geometry();
        let complete = write_complete_fn(
            groups.clone(),
            map.clone(),
            stats.clone(),
            mempool.clone(),
            media.clone(),
            geo,
        );
        let tctx = match ThreadCtx::init(&media, &mempool, WCA_TID, depth, complete) {
            Ok(tctx) => Arc::new(tctx),
            Err(err) => {
                let _ = mempool.destroy(PoolType::ProCtx, WCA_TID);
                return Err(err);
            }
        };

        let shared = Arc::new(WriterShared {
            media,
            mempool,
            groups,
            map,
            stats,
            geo,
            next_grp: AtomicU32::new(0),
        });
        let inbox: Arc<SegQueue<Arc<UserCommand>>> = Arc::new(SegQueue::new());
        let running = Arc::new(AtomicBool::new(true));

        let thread_inbox = inbox.clone();
        let thread_running = running.clone();
        let thread_tctx = tctx.clone();
        let writer = thread::Builder::new()
            .name("ztl-wca".into())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) || !thread_inbox.is_empty() {
                    match thread_inbox.pop() {
                        Some(ucmd) => process_ucmd(&shared, &thread_tctx, ucmd),
                        None => thread::sleep(IDLE_SLEEP),
                    }
                }
            })
            .map_err(|_| Error::MempoolAsynchError)?;

        Ok(WriteCaller {
            inbox,
            running,
            writer: Some(writer),
            tctx,
        })
    }

    /// Enqueue and return; completion is delivered through the command.
    pub fn submit(&self, ucmd: Arc<UserCommand>) {
        self.inbox.push(ucmd);
    }

    pub fn inflight(&self) -> u32 {
        self.tctx.inflight()
    }

    /// Stop the writer (after draining the inbox), drain the device queue
    /// and release the buckets.
    pub fn exit(
        mut self,
        media: &dyn Media,
        mempool: &Mempool,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.running.store(false, Ordering::Release);
        if let Some(writer) = self.writer.take() {
            writer.join().map_err(|_| Error::MempoolAsynchError)?;
        }
        let tctx = Arc::try_unwrap(self.tctx).map_err(|_| Error::MempoolAsynchError)?;
        tctx.exit(media, mempool, timeout)?;
        mempool.destroy(PoolType::ProCtx, WCA_TID)?;
        Ok(())
    }
}

/// Provision, fragment and submit one user write.
fn process_ucmd(shared: &WriterShared, tctx: &ThreadCtx, ucmd: Arc<UserCommand>) {
    let nbytes = u64::from(shared.geo.nbytes);
    let nsec_total = (ucmd.size() / nbytes) as u32;
    shared.stats.inc(StatType::AppendUcmd, 1);
    shared.stats.record_user_write(ucmd.size());

    let grp_idx =
        shared.next_grp.fetch_add(1, Ordering::Relaxed) as usize % shared.groups.len();
    let grp = &shared.groups[grp_idx];

    // Reservation contexts are pooled; the writer thread is both getter and
    // putter of this bucket.
    let ent = match shared.mempool.get(PoolType::ProCtx, WCA_TID) {
        Ok(ent) => ent,
        Err(err) => {
            ucmd.abort(err.status_code());
            return;
        }
    };
    let ctx = unsafe {
        let slot = ent.as_ref().opaque() as *mut ProReservation;
        ptr::write(slot, ProReservation::new());
        &mut *slot
    };

    // Translation-owned objects map as a single piece, so their sectors must
    // come from one zone; application-owned writes may stripe.
    let multi = ucmd.app_owned;
    if let Err(err) = grp.provision(
        shared.media.as_ref(),
        ctx,
        nsec_total,
        ucmd.level,
        multi,
    ) {
        shared.mempool.put(ent, PoolType::ProCtx, WCA_TID);
        shared.stats.inc(StatType::WriteSubmitFail, 1);
        ucmd.abort(err.status_code());
        return;
    }

    let mut pieces: Vec<(MediaAddr, u32)> = Vec::new();
    for (addr, run_nsec) in ctx.runs() {
        let mut done = 0u32;
        while done < run_nsec {
            let take = (run_nsec - done).min(WCA_SEC_PER_MCMD);
            pieces.push((addr.with_sect(addr.sect() + u64::from(done)), take));
            done += take;
        }
    }
    shared.mempool.put(ent, PoolType::ProCtx, WCA_TID);

    ucmd.set_pieces(pieces.iter().map(|&(_, nsec)| nsec).collect());

    let mut consumed = 0u64;
    for (i, &(addr, nsec)) in pieces.iter().enumerate() {
        let data = unsafe { ucmd.buf().add(consumed as usize) };
        consumed += u64::from(nsec) * nbytes;
        let cmd = MediaCommand::append(
            addr,
            nsec,
            data,
            i as u16,
            ucmd.level,
            Arc::downgrade(&ucmd),
        );
        let raw = match tctx.get_mcmd(&shared.mempool, cmd) {
            Ok(raw) => raw,
            Err(err) => {
                abort_tail(shared, grp, &ucmd, &pieces[i..], err);
                return;
            }
        };
        if let Err(err) = tctx.submit(shared.media.as_ref(), raw) {
            unsafe { mcmd_release(&shared.mempool, raw, WCA_TID) };
            abort_tail(shared, grp, &ucmd, &pieces[i..], err);
            return;
        }
    }
}

/// A submission failed: rewind every unsubmitted piece and account it as
/// completed so the in-flight tail can still finalize the command.
fn abort_tail(
    shared: &WriterShared,
    grp: &Group,
    ucmd: &Arc<UserCommand>,
    rest: &[(MediaAddr, u32)],
    err: Error,
) {
    error!("wca: submission failed mid-command: {}", err);
    shared.stats.inc(StatType::WriteSubmitFail, 1);
    ucmd.fail(err.status_code());
    for &(addr, nsec) in rest {
        grp.release_run(addr.zone(), nsec, ucmd.level);
        if ucmd.finish_one() {
            finalize_write(ucmd, &shared.map, shared.geo.nbytes);
        }
    }
}
