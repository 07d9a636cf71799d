use crate::error::Error;
use crate::media::{
    decode_zone_report, Geometry, Media, MediaAddr, ZoneCommand, ZoneCond, ZoneMgmtOp,
    ZoneReportEntry,
};
use log::debug;

/// Zone is usable for provisioning.
pub const ZMD_AVLB: u8 = 1 << 0;
/// Zone is currently open for writing.
pub const ZMD_OPEN: u8 = 1 << 1;
/// Zone is written (or finished) to capacity.
pub const ZMD_FULL: u8 = 1 << 2;
/// Zone is excluded from provisioning.
pub const ZMD_INVALID: u8 = 1 << 3;

/// In-memory state of one physical zone.
#[derive(Clone, Debug)]
pub struct ZoneRecord {
    pub addr: MediaAddr,
    /// Next acknowledged append position, in absolute sectors.
    pub wptr: u64,
    /// Reserved-but-unacknowledged append position. Always at or past
    /// `wptr`, never past the zone end.
    pub wptr_inflight: u64,
    /// Writable sectors in the zone.
    pub capacity: u64,
    /// Workload class currently writing to the zone.
    pub level: u8,
    pub flags: u8,
}

impl ZoneRecord {
    pub fn base(&self) -> u64 {
        self.addr.sect()
    }

    pub fn end(&self) -> u64 {
        self.addr.sect() + self.capacity
    }

    /// Sectors still reservable.
    pub fn remaining(&self) -> u64 {
        self.end() - self.wptr_inflight
    }

    pub fn is_available(&self) -> bool {
        self.flags & ZMD_AVLB != 0 && self.flags & ZMD_INVALID == 0
    }

    pub fn is_full(&self) -> bool {
        self.flags & ZMD_FULL != 0
    }
}

/// The per-group zone table.
///
/// Volatile by design: rebuilt at every init from geometry plus the device's
/// zone report. `invalidate`/`mark`/`flush` of the on-device variant are
/// intentionally absent.
pub struct ZoneTable {
    grp_id: u16,
    pub(crate) zones: Vec<ZoneRecord>,
}

impl ZoneTable {
    /// Seed every record from geometry: zone `i` of group `g` starts at
    /// sector `sec_grp * g + sec_zn * i`, empty and available.
    pub fn create(geo: &Geometry, grp_id: u16) -> ZoneTable {
        let zn_grp = geo.zn_grp();
        let mut zones = Vec::with_capacity(zn_grp as usize);
        for zone_i in 0..zn_grp {
            let punit = (zone_i / geo.zn_pu) as u16;
            let sect = geo.sec_grp() * u64::from(grp_id) + geo.sec_zn * u64::from(zone_i);
            let addr = MediaAddr::new(grp_id, punit, zone_i, sect);
            zones.push(ZoneRecord {
                addr,
                wptr: sect,
                wptr_inflight: sect,
                capacity: geo.sec_zn,
                level: 0,
                flags: ZMD_AVLB,
            });
        }
        ZoneTable { grp_id, zones }
    }

    /// Fetch the device's view of the group through a `Report` zone
    /// management command.
    pub fn load(
        media: &dyn Media,
        geo: &Geometry,
        grp_id: u16,
    ) -> Result<Vec<ZoneReportEntry>, Error> {
        let base = MediaAddr::new(grp_id, 0, 0, geo.sec_grp() * u64::from(grp_id));
        let mut cmd = ZoneCommand::new(ZoneMgmtOp::Report, base, geo.zn_grp());
        media
            .submit_zn(&mut cmd)
            .map_err(|_| Error::ZoneReportFailed(grp_id))?;
        let blob = cmd.report.ok_or(Error::ZoneReportFailed(grp_id))?;
        let entries = decode_zone_report(&blob).map_err(|_| Error::ZoneReportFailed(grp_id))?;
        if entries.len() != geo.zn_grp() as usize {
            return Err(Error::ZoneReportFailed(grp_id));
        }
        debug!(
            "zmd: group {} report loaded, {} zones",
            grp_id,
            entries.len()
        );
        Ok(entries)
    }

    /// Adopt the reported write pointers and conditions.
    pub fn apply_report(&mut self, entries: &[ZoneReportEntry]) -> Result<(), Error> {
        if entries.len() != self.zones.len() {
            return Err(Error::ZoneReportFailed(self.grp_id));
        }
        for (zone, entry) in self.zones.iter_mut().zip(entries) {
            zone.capacity = entry.capacity;
            if entry.wptr < zone.base() || entry.wptr > zone.end() {
                return Err(Error::ZoneReportFailed(self.grp_id));
            }
            zone.wptr = entry.wptr;
            zone.wptr_inflight = entry.wptr;
            zone.flags = ZMD_AVLB
                | match entry.cond {
                    ZoneCond::Empty => 0,
                    ZoneCond::Open => ZMD_OPEN,
                    ZoneCond::Full => ZMD_FULL,
                };
        }
        Ok(())
    }

    pub fn grp_id(&self) -> u16 {
        self.grp_id
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// O(1) record lookup by zone index within the group.
    pub fn get(&self, zone: u32) -> Option<&ZoneRecord> {
        self.zones.get(zone as usize)
    }

    /// Persistence hooks. The table is volatile; marking, invalidation and
    /// write-back become meaningful only with an on-device metadata
    /// extension.
    pub fn mark(&mut self, _zone: u32) {}

    pub fn invalidate(&mut self, _addr: &MediaAddr, _full: bool) {}

    pub fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Lookup by absolute sector address.
    pub fn get_by_offset(&self, sect: u64, geo: &Geometry) -> Option<&ZoneRecord> {
        let grp_base = geo.sec_grp() * u64::from(self.grp_id);
        if sect < grp_base {
            return None;
        }
        let zone = (sect - grp_base) / geo.sec_zn;
        self.zones.get(zone as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            ngrps: 4,
            pu_grp: 2,
            zn_pu: 4,
            sec_zn: 1000,
            nbytes: 512,
            nbytes_oob: 0,
        }
    }

    #[test]
    fn create_places_zones_by_formula() {
        let geo = geo();
        for grp in 0..geo.ngrps {
            let table = ZoneTable::create(&geo, grp);
            assert_eq!(table.len(), geo.zn_grp() as usize);
            for (i, zone) in table.zones.iter().enumerate() {
                let expected = geo.sec_grp() * u64::from(grp) + geo.sec_zn * i as u64;
                assert_eq!(zone.base(), expected);
                assert_eq!(zone.wptr, expected);
                assert_eq!(zone.wptr_inflight, expected);
                assert_eq!(zone.addr.grp(), grp);
                assert_eq!(zone.addr.zone(), i as u32);
                assert_eq!(zone.addr.punit(), (i as u32 / geo.zn_pu) as u16);
                assert_eq!(zone.capacity, geo.sec_zn);
                assert!(zone.is_available());
                assert_eq!(zone.level, 0);
            }
        }
    }

    #[test]
    fn apply_report_adopts_device_state() {
        let geo = geo();
        let mut table = ZoneTable::create(&geo, 1);
        let mut entries: Vec<ZoneReportEntry> = table
            .zones
            .iter()
            .map(|zone| ZoneReportEntry {
                wptr: zone.base(),
                capacity: zone.capacity,
                cond: ZoneCond::Empty,
            })
            .collect();
        entries[2].wptr += 300;
        entries[2].cond = ZoneCond::Open;
        entries[5].wptr += geo.sec_zn;
        entries[5].cond = ZoneCond::Full;

        table.apply_report(&entries).unwrap();
        assert_eq!(table.get(2).unwrap().wptr, table.get(2).unwrap().base() + 300);
        assert_eq!(table.get(2).unwrap().flags, ZMD_AVLB | ZMD_OPEN);
        assert!(table.get(5).unwrap().is_full());
        assert_eq!(table.get(0).unwrap().flags, ZMD_AVLB);
    }

    #[test]
    fn apply_report_rejects_pointer_outside_zone() {
        let geo = geo();
        let mut table = ZoneTable::create(&geo, 0);
        let mut entries: Vec<ZoneReportEntry> = table
            .zones
            .iter()
            .map(|zone| ZoneReportEntry {
                wptr: zone.base(),
                capacity: zone.capacity,
                cond: ZoneCond::Empty,
            })
            .collect();
        entries[0].wptr = geo.sec_zn * 2;
        assert!(table.apply_report(&entries).is_err());
    }

    #[test]
    fn lookup_by_offset_divides_into_zones() {
        let geo = geo();
        let table = ZoneTable::create(&geo, 1);
        let grp_base = geo.sec_grp();
        let zone = table.get_by_offset(grp_base + 2 * geo.sec_zn + 17, &geo).unwrap();
        assert_eq!(zone.addr.zone(), 2);
        assert!(table.get_by_offset(0, &geo).is_none());
    }
}
