use crate::ctx::{mcmd_release, ThreadCtx};
use crate::error::Error;
use crate::map::Map;
use crate::media::{
    CompleteFn, Geometry, IoOpcode, Media, MediaAddr, MediaCommand, ZoneCommand, ZoneMgmtOp,
    ZNS_ALIGNMENT,
};
use crate::mempool::Mempool;
use crate::pro::{GroupCounts, ProGrp, ProReservation, PRO_TYPES};
use crate::stats::{StatType, Stats, Telemetry};
use crate::sync::SpinLock;
use crate::wca::{UserCommand, WriteCaller, READ_SEC_PER_MCMD};
use crate::zmd::{ZoneRecord, ZoneTable};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread id of the shared read context.
pub const READ_TID: u16 = 1;

/// Instance configuration. The geometry itself always comes from the media.
pub struct ZtlOpts {
    /// Depth of each asynchronous queue pair.
    pub ctx_depth: u32,
    /// Slots in the logical-to-physical table.
    pub map_entries: u64,
    /// Directory the telemetry gauges are written to.
    pub stats_dir: PathBuf,
    /// How long teardown waits for in-flight commands.
    pub drain_timeout: Duration,
}

impl Default for ZtlOpts {
    fn default() -> Self {
        ZtlOpts {
            ctx_depth: 512,
            map_entries: 1 << 20,
            stats_dir: PathBuf::from("/tmp"),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// One zone group: the provisioning state behind its spin lock.
///
/// List and pointer manipulation happens under the lock; zone management
/// commands go to the media outside it, so a completion handler taking the
/// lock can never deadlock against a holder waiting on the device.
pub struct Group {
    id: u16,
    inner: SpinLock<ProGrp>,
}

impl Group {
    pub fn new(pro: ProGrp) -> Group {
        Group {
            id: pro.grp_id(),
            inner: SpinLock::new(pro),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Reserve sectors and open any zones the reservation pulled from the
    /// free list. A failed device open rewinds the whole reservation.
    pub fn provision(
        &self,
        media: &dyn Media,
        ctx: &mut ProReservation,
        nsec: u32,
        level: u8,
        multi: bool,
    ) -> Result<(), Error> {
        let to_open: Vec<MediaAddr> = {
            let mut inner = self.inner.lock();
            let mut opened = Vec::new();
            inner.reserve(ctx, nsec, level, multi, &mut opened)?;
            opened
                .iter()
                .map(|&zone_i| inner.table().get(zone_i).unwrap().addr)
                .collect()
        };
        for addr in to_open {
            let mut cmd = ZoneCommand::new(ZoneMgmtOp::Open, addr, 1);
            if let Err(err) = media.submit_zn(&mut cmd) {
                warn!("group {}: zone open at sector {} failed", self.id, addr.sect());
                self.release(ctx);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Rewind a whole reservation.
    pub fn release(&self, ctx: &ProReservation) {
        let mut inner = self.inner.lock();
        for (addr, nsec) in ctx.runs() {
            inner.release(addr.zone(), nsec, ctx.level());
        }
    }

    /// Rewind one run of a reservation.
    pub fn release_run(&self, zone_i: u32, nsec: u32, level: u8) {
        self.inner.lock().release(zone_i, nsec, level);
    }

    /// Acknowledge completed sectors; finishes the zone on the device once
    /// the acknowledged pointer reaches capacity.
    pub fn commit(&self, media: &dyn Media, zone_i: u32, nsec: u32) {
        let (filled, addr) = {
            let mut inner = self.inner.lock();
            let filled = inner.commit(zone_i, nsec);
            (filled, inner.table().get(zone_i).unwrap().addr)
        };
        if filled {
            let mut cmd = ZoneCommand::new(ZoneMgmtOp::Finish, addr, 1);
            if media.submit_zn(&mut cmd).is_err() {
                warn!("group {}: zone finish at sector {} failed", self.id, addr.sect());
            }
        }
    }

    /// Reset a used zone and hand it back to the free list.
    pub fn put_zone(&self, media: &dyn Media, stats: &Stats, zone_i: u32) -> Result<(), Error> {
        let (addr, recycled) = {
            let inner = self.inner.lock();
            inner.validate_reset(zone_i)?;
            let zone = inner.table().get(zone_i).unwrap();
            (zone.addr, zone.wptr - zone.base())
        };
        let mut cmd = ZoneCommand::new(ZoneMgmtOp::Reset, addr, 1);
        media.submit_zn(&mut cmd)?;
        self.inner.lock().complete_reset(zone_i);
        stats.inc(StatType::ResetMcmd, 1);
        stats.inc(StatType::RecycledZones, 1);
        stats.inc(StatType::RecycledBytes, recycled);
        Ok(())
    }

    /// Finish an open zone before it fills.
    pub fn finish_zone(&self, media: &dyn Media, zone_i: u32, level: u8) -> Result<(), Error> {
        let addr = {
            let inner = self.inner.lock();
            inner
                .table()
                .get(zone_i)
                .ok_or(Error::Provision)?
                .addr
        };
        let mut cmd = ZoneCommand::new(ZoneMgmtOp::Finish, addr, 1);
        media.submit_zn(&mut cmd)?;
        self.inner.lock().complete_finish(zone_i, level)
    }

    pub fn snapshot(&self, zone_i: u32) -> Option<ZoneRecord> {
        self.inner.lock().table().get(zone_i).cloned()
    }

    pub fn counts(&self) -> GroupCounts {
        self.inner.lock().counts()
    }

    pub fn open_zones(&self, level: u8) -> Vec<u32> {
        self.inner.lock().open_zones(level)
    }

    pub fn check_consistency(&self) -> bool {
        self.inner.lock().check_consistency()
    }
}

fn read_complete_fn(stats: Arc<Stats>, mempool: Arc<Mempool>, nbytes: u32) -> CompleteFn {
    Arc::new(move |raw: *mut MediaCommand| {
        let (parent, status, nsec) = unsafe {
            let cmd = &*raw;
            (cmd.parent.upgrade(), cmd.status, cmd.nsec)
        };
        stats.record_io(IoOpcode::Read, u64::from(nsec) * u64::from(nbytes), status);
        if let Some(ucmd) = parent {
            if status != 0 {
                ucmd.fail(status);
                stats.inc(StatType::ReadCallbackFail, 1);
            }
            if ucmd.finish_one() {
                ucmd.finalize();
            }
        }
        unsafe { mcmd_release(&mempool, raw, READ_TID) };
    })
}

/// The assembled translation layer.
///
/// An explicit context owning every module: the mempool registry, one
/// [`Group`] per media group, the mapping table, statistics and telemetry,
/// the write caller and the shared read context. Constructed by
/// [`ZtlCore::init`] and unwound in reverse by [`ZtlCore::shutdown`]; there
/// are no process-global registries.
pub struct ZtlCore {
    media: Arc<dyn Media>,
    geo: Geometry,
    opts: ZtlOpts,
    mempool: Arc<Mempool>,
    groups: Arc<Vec<Arc<Group>>>,
    map: Arc<Map>,
    stats: Arc<Stats>,
    telemetry: Option<Telemetry>,
    wca: Option<WriteCaller>,
    read_ctx: Option<ThreadCtx>,
    read_spin: SpinLock<()>,
}

impl ZtlCore {
    pub fn init(media: Arc<dyn Media>, opts: ZtlOpts) -> Result<ZtlCore, Error> {
        let geo = media.geometry();
        geo.validate()?;

        let mempool = Arc::new(Mempool::new());
        let stats = Arc::new(Stats::new());
        let telemetry = Telemetry::init(stats.clone(), mempool.clone(), opts.stats_dir.clone())?;

        let mut groups = Vec::with_capacity(usize::from(geo.ngrps));
        for grp_id in 0..geo.ngrps {
            let report = match ZoneTable::load(media.as_ref(), &geo, grp_id) {
                Ok(report) => report,
                Err(err) => {
                    error!("ztl: group {} cannot start: {}", grp_id, err);
                    telemetry.exit(&mempool);
                    return Err(err);
                }
            };
            let mut table = ZoneTable::create(&geo, grp_id);
            if let Err(err) = table.apply_report(&report) {
                telemetry.exit(&mempool);
                return Err(err);
            }
            groups.push(Arc::new(Group::new(ProGrp::init(table))));
        }
        let groups = Arc::new(groups);

        let map = Arc::new(Map::new(opts.map_entries));

        let wca = match WriteCaller::init(
            media.clone(),
            mempool.clone(),
            groups.clone(),
            map.clone(),
            stats.clone(),
            opts.ctx_depth,
        ) {
            Ok(wca) => wca,
            Err(err) => {
                telemetry.exit(&mempool);
                return Err(err);
            }
        };

        let read_complete = read_complete_fn(stats.clone(), mempool.clone(), geo.nbytes);
        let read_ctx = match ThreadCtx::init(&media, &mempool, READ_TID, opts.ctx_depth, read_complete)
        {
            Ok(read_ctx) => read_ctx,
            Err(err) => {
                if let Err(wca_err) = wca.exit(media.as_ref(), &mempool, opts.drain_timeout) {
                    error!("ztl: write caller teardown during failed init: {}", wca_err);
                }
                telemetry.exit(&mempool);
                return Err(err);
            }
        };

        info!(
            "ztl: initialized, {} groups x {} zones, sector {} B",
            geo.ngrps,
            geo.zn_grp(),
            geo.nbytes
        );
        Ok(ZtlCore {
            media,
            geo,
            opts,
            mempool,
            groups,
            map,
            stats,
            telemetry: Some(telemetry),
            wca: Some(wca),
            read_ctx: Some(read_ctx),
            read_spin: SpinLock::new(()),
        })
    }

    /// Unwind in reverse init order, joining every thread. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        let mut result = Ok(());
        if let Some(wca) = self.wca.take() {
            if let Err(err) = wca.exit(self.media.as_ref(), &self.mempool, self.opts.drain_timeout)
            {
                error!("ztl: write caller teardown failed: {}", err);
                result = Err(err);
            }
        }
        if let Some(read_ctx) = self.read_ctx.take() {
            if let Err(err) =
                read_ctx.exit(self.media.as_ref(), &self.mempool, self.opts.drain_timeout)
            {
                error!("ztl: read context teardown failed: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if let Some(telemetry) = self.telemetry.take() {
            telemetry.exit(&self.mempool);
            let _ = self.map.flush();
            self.mempool.exit();
            info!("ztl: shut down");
        }
        result
    }

    pub fn media(&self) -> &Arc<dyn Media> {
        &self.media
    }

    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn ngroups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, grp: usize) -> &Arc<Group> {
        &self.groups[grp]
    }

    fn check_buffer(&self, buf: *const u8, size: u64) -> Result<(), Error> {
        if buf as usize % ZNS_ALIGNMENT != 0 {
            return Err(Error::BufferNotAligned(buf as usize));
        }
        if size == 0 || size % ZNS_ALIGNMENT as u64 != 0 {
            return Err(Error::LengthNotAligned(size as usize));
        }
        Ok(())
    }

    fn submit_write(
        &self,
        id: u64,
        buf: *mut u8,
        size: u64,
        level: u8,
        app_owned: bool,
    ) -> Result<Arc<UserCommand>, Error> {
        self.check_buffer(buf, size)?;
        if usize::from(level) >= PRO_TYPES {
            return Err(Error::InvalidLevel(level));
        }
        let wca = self.wca.as_ref().ok_or(Error::NoInit)?;
        let ucmd = UserCommand::write(id, buf, size, level, app_owned, None);
        wca.submit(ucmd.clone());
        Ok(ucmd)
    }

    /// Write an object owned by the translation layer's mapping.
    pub fn write_obj(&self, id: u64, buf: *mut u8, size: u64, level: u8) -> Result<(), Error> {
        if id >= self.map.entries() {
            return Err(Error::MapOutOfRange(id, self.map.entries()));
        }
        let ucmd = self.submit_write(id, buf, size, level, false)?;
        match Error::from_status(ucmd.wait()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Write raw data; the caller keeps the returned byte offsets.
    pub fn write(&self, buf: *mut u8, size: u64, level: u8) -> Result<Vec<u64>, Error> {
        let ucmd = self.submit_write(0, buf, size, level, true)?;
        match Error::from_status(ucmd.wait()) {
            None => Ok(ucmd.offsets()),
            Some(err) => Err(err),
        }
    }

    /// Read `size` bytes starting at the physical byte `offset`.
    pub fn read(&self, offset: u64, buf: *mut u8, size: u64) -> Result<(), Error> {
        self.check_buffer(buf, size)?;
        if offset % ZNS_ALIGNMENT as u64 != 0 {
            return Err(Error::LengthNotAligned(offset as usize));
        }
        let read_ctx = self.read_ctx.as_ref().ok_or(Error::NoInit)?;
        let nbytes = u64::from(self.geo.nbytes);
        let mut sect = offset / nbytes;
        let mut remaining = (size / nbytes) as u32;

        // Fragments stay within read-transfer and zone bounds.
        let mut pieces: Vec<(u64, u32)> = Vec::new();
        while remaining > 0 {
            let zone_end = (sect / self.geo.sec_zn + 1) * self.geo.sec_zn;
            let take = u64::from(remaining.min(READ_SEC_PER_MCMD)).min(zone_end - sect) as u32;
            pieces.push((sect, take));
            sect += u64::from(take);
            remaining -= take;
        }

        let ucmd = UserCommand::read(offset, buf, size);
        ucmd.set_pieces(pieces.iter().map(|&(_, nsec)| nsec).collect());

        let started = Instant::now();
        {
            // One reader at a time submits, keeping the mcmd bucket on the
            // single-getter discipline; waiting happens outside the lock.
            let _guard = self.read_spin.lock();
            let mut consumed = 0u64;
            for (i, &(piece_sect, nsec)) in pieces.iter().enumerate() {
                let grp = (piece_sect / self.geo.sec_grp()) as u16;
                let zone = ((piece_sect % self.geo.sec_grp()) / self.geo.sec_zn) as u32;
                let punit = (zone / self.geo.zn_pu) as u16;
                let addr = MediaAddr::new(grp, punit, zone, piece_sect);
                let data = unsafe { buf.add(consumed as usize) };
                consumed += u64::from(nsec) * nbytes;
                let cmd = MediaCommand::read(addr, nsec, data, i as u16, Arc::downgrade(&ucmd));
                let submitted = read_ctx
                    .get_mcmd(&self.mempool, cmd)
                    .and_then(|raw| {
                        read_ctx.submit(self.media.as_ref(), raw).inspect_err(|_| unsafe {
                            mcmd_release(&self.mempool, raw, READ_TID);
                        })
                    });
                if let Err(err) = submitted {
                    self.stats.inc(StatType::ReadSubmitFail, 1);
                    ucmd.fail(err.status_code());
                    // Account the unsubmitted tail so the wait terminates.
                    for _ in i..pieces.len() {
                        if ucmd.finish_one() {
                            ucmd.finalize();
                        }
                    }
                    break;
                }
            }
        }
        let status = ucmd.wait();
        self.stats.record_user_read(size);
        self.stats
            .record_read_latency(&self.mempool, started.elapsed().as_micros() as u64);
        match Error::from_status(status) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Read within an object through the mapping. The entry's flag bit is
    /// the existence marker; the address alone cannot be, since a valid
    /// object may start at byte offset 0.
    pub fn read_obj(&self, id: u64, offset: u64, buf: *mut u8, size: u64) -> Result<(), Error> {
        let entry = self.map.read_entry(id)?;
        if !entry.flag() {
            return Err(Error::ObjectDoesNotExist(id));
        }
        self.read(entry.addr() + offset, buf, size)
    }

    /// Drop an object's mapping entry.
    pub fn delete_obj(&self, id: u64) -> Result<(), Error> {
        let entry = self.map.read_entry(id)?;
        if !entry.flag() {
            return Err(Error::ObjectDoesNotExist(id));
        }
        self.map.upsert(id, 0, false)?;
        Ok(())
    }
}

impl Drop for ZtlCore {
    fn drop(&mut self) {
        if self.wca.is_some() || self.read_ctx.is_some() || self.telemetry.is_some() {
            warn!("ztl: core dropped without shutdown, unwinding now");
            let _ = self.shutdown();
        }
    }
}
