use crate::dma::{AlignedAllocator, Allocator};
use crate::error::{code, Error};
use crate::media::{
    encode_zone_report, CompleteFn, Geometry, IoOpcode, Media, MediaCommand, QueueId, ZoneCommand,
    ZoneCond, ZoneMgmtOp, ZoneReportEntry, ZNS_ALIGNMENT,
};
use crate::sync::SpinLock;
use ahash::RandomState;
use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crossbeam::channel::{unbounded, Sender};
use hashbrown::HashMap;
use log::debug;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

struct MemZone {
    cond: ZoneCond,
    /// Sectors written so far; also bounds what reads may touch.
    wp_rel: u64,
    data: Vec<u8>,
}

struct SubmitPtr(*mut MediaCommand);
unsafe impl Send for SubmitPtr {}

struct QueuePair {
    tx: Sender<SubmitPtr>,
    completion: JoinHandle<()>,
}

/// RAM-backed media with append-only zone semantics.
///
/// The reference implementation of [`Media`]: zones enforce their state
/// machine and write pointer, appends return the device-assigned sector,
/// zone management supports open/close/finish/reset/report, and every
/// asynchronous queue owns a completion thread that executes commands in
/// submission order and invokes the registered handler. Storage is sparse;
/// a zone only holds the bytes appended to it, so large geometries stay
/// testable in memory.
pub struct MemMedia {
    geo: Geometry,
    zones: Arc<Mutex<Vec<MemZone>>>,
    queues: SpinLock<HashMap<u32, QueuePair, RandomState>>,
    next_queue: AtomicU32,
    allocations: SpinLock<HashMap<usize, Layout, RandomState>>,
    allocator: AlignedAllocator,
}

impl MemMedia {
    pub fn new(geo: Geometry) -> Result<MemMedia, Error> {
        geo.validate()?;
        let total_zones = geo.zn_grp() as usize * usize::from(geo.ngrps);
        let mut zones = Vec::with_capacity(total_zones);
        for _ in 0..total_zones {
            zones.push(MemZone {
                cond: ZoneCond::Empty,
                wp_rel: 0,
                data: Vec::new(),
            });
        }
        debug!(
            "mem-media: {} zones of {} sectors across {} groups",
            total_zones,
            geo.sec_zn,
            geo.ngrps
        );
        Ok(MemMedia {
            geo,
            zones: Arc::new(Mutex::new(zones)),
            queues: SpinLock::new(HashMap::with_hasher(RandomState::new())),
            next_queue: AtomicU32::new(0),
            allocations: SpinLock::new(HashMap::with_hasher(RandomState::new())),
            allocator: AlignedAllocator,
        })
    }

    fn global_zone(&self, grp: u16, zone: u32) -> Result<usize, Error> {
        if grp >= self.geo.ngrps || zone >= self.geo.zn_grp() {
            return Err(Error::ZoneStateViolation(
                self.geo.sec_grp() * u64::from(grp) + self.geo.sec_zn * u64::from(zone),
            ));
        }
        Ok(u64::from(grp) as usize * self.geo.zn_grp() as usize + zone as usize)
    }

    /// Condition and written sectors of one zone; test support.
    pub fn zone_state(&self, grp: u16, zone: u32) -> (ZoneCond, u64) {
        let idx = self.global_zone(grp, zone).expect("zone inside geometry");
        let zones = self.zones.lock().unwrap();
        (zones[idx].cond, zones[idx].wp_rel)
    }
}

/// Execute one asynchronous command against the zone store. Runs on the
/// completion thread, which serializes all commands of a queue.
fn exec_io(zones: &Mutex<Vec<MemZone>>, geo: &Geometry, cmd: &mut MediaCommand) {
    let nbytes = u64::from(geo.nbytes);
    match cmd.opcode {
        IoOpcode::Append => {
            let global =
                u64::from(cmd.addr.grp()) * u64::from(geo.zn_grp()) + u64::from(cmd.addr.zone());
            let mut zones = zones.lock().unwrap();
            let zone = match zones.get_mut(global as usize) {
                Some(zone) => zone,
                None => {
                    cmd.status = code::ZONE_STATE;
                    return;
                }
            };
            if zone.cond == ZoneCond::Full || zone.wp_rel + u64::from(cmd.nsec) > geo.sec_zn {
                cmd.status = code::ZONE_STATE;
                return;
            }
            // An append to an empty zone opens it implicitly.
            if zone.cond == ZoneCond::Empty {
                zone.cond = ZoneCond::Open;
            }
            let len = u64::from(cmd.nsec) * nbytes;
            let src = unsafe { core::slice::from_raw_parts(cmd.data, len as usize) };
            zone.data.extend_from_slice(src);
            cmd.paddr = geo.sec_zn * global + zone.wp_rel;
            zone.wp_rel += u64::from(cmd.nsec);
            if zone.wp_rel == geo.sec_zn {
                zone.cond = ZoneCond::Full;
            }
            cmd.status = 0;
        }
        IoOpcode::Read => {
            let sect = cmd.addr.sect();
            let global = sect / geo.sec_zn;
            let offset = sect % geo.sec_zn;
            let mut zones = zones.lock().unwrap();
            let zone = match zones.get_mut(global as usize) {
                Some(zone) => zone,
                None => {
                    cmd.status = code::ZONE_STATE;
                    return;
                }
            };
            if offset + u64::from(cmd.nsec) > zone.wp_rel {
                cmd.status = code::ZONE_STATE;
                return;
            }
            let start = (offset * nbytes) as usize;
            let len = (u64::from(cmd.nsec) * nbytes) as usize;
            unsafe {
                core::ptr::copy_nonoverlapping(zone.data[start..].as_ptr(), cmd.data, len);
            }
            cmd.status = 0;
        }
    }
}

impl Media for MemMedia {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn asynch_init(
        &self,
        depth: u32,
        _active: Arc<AtomicBool>,
        complete: CompleteFn,
    ) -> Result<QueueId, Error> {
        let (tx, rx) = unbounded::<SubmitPtr>();
        let zones = self.zones.clone();
        let geo = self.geo;
        let id = self.next_queue.fetch_add(1, Ordering::AcqRel);
        let completion = thread::Builder::new()
            .name(format!("mem-media-cq-{id}"))
            .spawn(move || {
                // Runs until the submission side is dropped at asynch_term.
                while let Ok(SubmitPtr(raw)) = rx.recv() {
                    unsafe { exec_io(&zones, &geo, &mut *raw) };
                    (complete.as_ref())(raw);
                }
            })
            .map_err(|_| Error::MempoolAsynchError)?;
        self.queues.lock().insert(id, QueuePair { tx, completion });
        debug!("mem-media: queue {} created with depth {}", id, depth);
        Ok(QueueId(id))
    }

    fn asynch_term(&self, queue: QueueId) -> Result<(), Error> {
        let pair = self
            .queues
            .lock()
            .remove(&queue.0)
            .ok_or(Error::QueueDoesNotExist(queue.0))?;
        drop(pair.tx);
        pair.completion
            .join()
            .map_err(|_| Error::MempoolAsynchError)?;
        Ok(())
    }

    fn submit_io(&self, queue: QueueId, cmd: *mut MediaCommand) -> Result<(), Error> {
        let tx = {
            let queues = self.queues.lock();
            queues
                .get(&queue.0)
                .ok_or(Error::QueueDoesNotExist(queue.0))?
                .tx
                .clone()
        };
        tx.send(SubmitPtr(cmd)).map_err(|_| Error::Media(code::QUEUE))
    }

    fn submit_zn(&self, cmd: &mut ZoneCommand) -> Result<(), Error> {
        let grp = cmd.addr.grp();
        match cmd.op {
            ZoneMgmtOp::Open => {
                let idx = self.global_zone(grp, cmd.addr.zone())?;
                let mut zones = self.zones.lock().unwrap();
                let zone = &mut zones[idx];
                if zone.cond == ZoneCond::Full {
                    cmd.status = code::ZONE_STATE;
                    return Err(Error::ZoneStateViolation(cmd.addr.sect()));
                }
                zone.cond = ZoneCond::Open;
            }
            // Closing keeps the zone's data and pointer; the distinction
            // between closed and open is not modelled here.
            ZoneMgmtOp::Close => {}
            ZoneMgmtOp::Finish => {
                let idx = self.global_zone(grp, cmd.addr.zone())?;
                let mut zones = self.zones.lock().unwrap();
                zones[idx].cond = ZoneCond::Full;
            }
            ZoneMgmtOp::Reset => {
                let idx = self.global_zone(grp, cmd.addr.zone())?;
                let mut zones = self.zones.lock().unwrap();
                let zone = &mut zones[idx];
                zone.cond = ZoneCond::Empty;
                zone.wp_rel = 0;
                zone.data = Vec::new();
            }
            ZoneMgmtOp::Report => {
                let first = self.global_zone(grp, cmd.addr.zone())?;
                let count = cmd.nzones.min(self.geo.zn_grp() - cmd.addr.zone()) as usize;
                let zones = self.zones.lock().unwrap();
                let entries: Vec<ZoneReportEntry> = zones[first..first + count]
                    .iter()
                    .enumerate()
                    .map(|(i, zone)| ZoneReportEntry {
                        wptr: self.geo.sec_zn * (first + i) as u64 + zone.wp_rel,
                        capacity: self.geo.sec_zn,
                        cond: zone.cond,
                    })
                    .collect();
                cmd.report = Some(encode_zone_report(&entries));
            }
        }
        cmd.status = 0;
        Ok(())
    }

    fn dma_alloc(&self, size: usize) -> Result<*mut u8, Error> {
        let layout = Layout::from_size_align(size, ZNS_ALIGNMENT)
            .map_err(|_| Error::AllocationFailed(size))?;
        let ptr = self.allocator.allocate(layout)?;
        self.allocations.lock().insert(ptr as usize, layout);
        Ok(ptr)
    }

    fn dma_free(&self, ptr: *mut u8) {
        if let Some(layout) = self.allocations.lock().remove(&(ptr as usize)) {
            self.allocator.deallocate(ptr, layout);
        }
    }
}

impl Drop for MemMedia {
    fn drop(&mut self) {
        let queues: Vec<u32> = self.queues.lock().keys().copied().collect();
        for id in queues {
            let _ = self.asynch_term(QueueId(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaAddr;
    use std::sync::Weak;

    fn geo() -> Geometry {
        Geometry {
            ngrps: 2,
            pu_grp: 1,
            zn_pu: 2,
            sec_zn: 16,
            nbytes: 512,
            nbytes_oob: 0,
        }
    }

    fn run_one(media: &MemMedia, mut cmd: MediaCommand) -> MediaCommand {
        let (done_tx, done_rx) = unbounded::<usize>();
        let complete: CompleteFn = Arc::new(move |raw| {
            done_tx.send(raw as usize).unwrap();
        });
        let queue = media
            .asynch_init(4, Arc::new(AtomicBool::new(true)), complete)
            .unwrap();
        cmd.parent = Weak::new();
        let raw = Box::into_raw(Box::new(cmd));
        media.submit_io(queue, raw).unwrap();
        let back = done_rx.recv().unwrap() as *mut MediaCommand;
        let cmd = *unsafe { Box::from_raw(back) };
        media.asynch_term(queue).unwrap();
        cmd
    }

    #[test]
    fn appends_assign_sequential_sectors_and_fill_the_zone() {
        let media = MemMedia::new(geo()).unwrap();
        let mut buf = vec![7u8; 16 * 512];
        let addr = MediaAddr::new(0, 0, 1, 16);

        let cmd = run_one(
            &media,
            MediaCommand::append(addr, 10, buf.as_mut_ptr(), 0, 0, Weak::new()),
        );
        assert_eq!(cmd.status, 0);
        assert_eq!(cmd.paddr, 16);
        assert_eq!(media.zone_state(0, 1), (ZoneCond::Open, 10));

        let cmd = run_one(
            &media,
            MediaCommand::append(addr, 6, buf.as_mut_ptr(), 1, 0, Weak::new()),
        );
        assert_eq!(cmd.status, 0);
        assert_eq!(cmd.paddr, 26);
        assert_eq!(media.zone_state(0, 1), (ZoneCond::Full, 16));

        // The zone is full now.
        let cmd = run_one(
            &media,
            MediaCommand::append(addr, 1, buf.as_mut_ptr(), 2, 0, Weak::new()),
        );
        assert_ne!(cmd.status, 0);
    }

    #[test]
    fn reads_return_appended_bytes_and_reject_unwritten_sectors() {
        let media = MemMedia::new(geo()).unwrap();
        let mut wbuf: Vec<u8> = (0..8 * 512).map(|i| (i % 251) as u8).collect();
        let zone = MediaAddr::new(0, 0, 0, 0);
        let cmd = run_one(
            &media,
            MediaCommand::append(zone, 8, wbuf.as_mut_ptr(), 0, 0, Weak::new()),
        );
        assert_eq!(cmd.status, 0);

        let mut rbuf = vec![0u8; 4 * 512];
        let cmd = run_one(
            &media,
            MediaCommand::read(zone.with_sect(2), 4, rbuf.as_mut_ptr(), 0, Weak::new()),
        );
        assert_eq!(cmd.status, 0);
        assert_eq!(&rbuf[..], &wbuf[2 * 512..6 * 512]);

        let cmd = run_one(
            &media,
            MediaCommand::read(zone.with_sect(6), 4, rbuf.as_mut_ptr(), 0, Weak::new()),
        );
        assert_ne!(cmd.status, 0);
    }

    #[test]
    fn zone_management_walks_the_state_machine() {
        let media = MemMedia::new(geo()).unwrap();
        let addr = MediaAddr::new(1, 0, 0, 32);

        let mut open = ZoneCommand::new(ZoneMgmtOp::Open, addr, 1);
        media.submit_zn(&mut open).unwrap();
        assert_eq!(media.zone_state(1, 0), (ZoneCond::Open, 0));

        let mut finish = ZoneCommand::new(ZoneMgmtOp::Finish, addr, 1);
        media.submit_zn(&mut finish).unwrap();
        assert_eq!(media.zone_state(1, 0).0, ZoneCond::Full);

        // A full zone cannot be reopened without a reset.
        let mut reopen = ZoneCommand::new(ZoneMgmtOp::Open, addr, 1);
        assert!(media.submit_zn(&mut reopen).is_err());

        let mut reset = ZoneCommand::new(ZoneMgmtOp::Reset, addr, 1);
        media.submit_zn(&mut reset).unwrap();
        assert_eq!(media.zone_state(1, 0), (ZoneCond::Empty, 0));
    }

    #[test]
    fn report_covers_the_group_in_order() {
        let media = MemMedia::new(geo()).unwrap();
        let mut buf = vec![1u8; 3 * 512];
        let cmd = run_one(
            &media,
            MediaCommand::append(MediaAddr::new(1, 0, 1, 0), 3, buf.as_mut_ptr(), 0, 0, Weak::new()),
        );
        assert_eq!(cmd.status, 0);

        let mut report = ZoneCommand::new(
            ZoneMgmtOp::Report,
            MediaAddr::new(1, 0, 0, media.geometry().sec_grp()),
            2,
        );
        media.submit_zn(&mut report).unwrap();
        let entries = crate::media::decode_zone_report(&report.report.unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        // Group 1 zone 0 is untouched, zone 1 carries 3 sectors.
        assert_eq!(entries[0].cond, ZoneCond::Empty);
        assert_eq!(entries[0].wptr, media.geometry().sec_grp());
        assert_eq!(entries[1].cond, ZoneCond::Open);
        assert_eq!(entries[1].wptr, media.geometry().sec_grp() + 16 + 3);
    }

    #[test]
    fn dma_allocations_are_aligned_and_tracked() {
        let media = MemMedia::new(geo()).unwrap();
        let ptr = media.dma_alloc(2 * ZNS_ALIGNMENT).unwrap();
        assert_eq!(ptr as usize % ZNS_ALIGNMENT, 0);
        media.dma_free(ptr);
        assert!(media.allocations.lock().is_empty());
    }
}
