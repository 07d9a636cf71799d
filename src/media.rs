use crate::error::Error;
use crate::mempool::MpEntry;
use crate::wca::UserCommand;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use core::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

/// All user buffers, sizes and offsets crossing the public surface are
/// multiples of this.
pub const ZNS_ALIGNMENT: usize = 4096;

const SECT_BITS: u32 = 40;
const ZONE_BITS: u32 = 16;
const PUNIT_BITS: u32 = 4;
const GRP_BITS: u32 = 4;

const ZONE_SHIFT: u32 = SECT_BITS;
const PUNIT_SHIFT: u32 = ZONE_SHIFT + ZONE_BITS;
const GRP_SHIFT: u32 = PUNIT_SHIFT + PUNIT_BITS;

const SECT_MASK: u64 = (1 << SECT_BITS) - 1;
const ZONE_MASK: u64 = (1 << ZONE_BITS) - 1;
const PUNIT_MASK: u64 = (1 << PUNIT_BITS) - 1;
const GRP_MASK: u64 = (1 << GRP_BITS) - 1;

/// A packed media address.
///
/// One `u64` carrying `{grp[63:60], punit[59:56], zone[55:40], sect[39:0]}`.
/// The sector field is the absolute logical block address of the device; the
/// group/punit/zone fields name the parallelism domain and the zone the
/// sector belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MediaAddr(u64);

impl MediaAddr {
    pub fn new(grp: u16, punit: u16, zone: u32, sect: u64) -> Self {
        debug_assert!(u64::from(grp) <= GRP_MASK);
        debug_assert!(u64::from(zone) <= ZONE_MASK);
        debug_assert!(sect <= SECT_MASK);
        MediaAddr(
            ((u64::from(grp) & GRP_MASK) << GRP_SHIFT)
                | ((u64::from(punit) & PUNIT_MASK) << PUNIT_SHIFT)
                | ((u64::from(zone) & ZONE_MASK) << ZONE_SHIFT)
                | (sect & SECT_MASK),
        )
    }

    pub fn from_raw(raw: u64) -> Self {
        MediaAddr(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn grp(&self) -> u16 {
        (self.0 >> GRP_SHIFT) as u16
    }

    pub fn punit(&self) -> u16 {
        ((self.0 >> PUNIT_SHIFT) & PUNIT_MASK) as u16
    }

    pub fn zone(&self) -> u32 {
        ((self.0 >> ZONE_SHIFT) & ZONE_MASK) as u32
    }

    pub fn sect(&self) -> u64 {
        self.0 & SECT_MASK
    }

    /// The same address with a replaced sector field.
    pub fn with_sect(&self, sect: u64) -> Self {
        debug_assert!(sect <= SECT_MASK);
        MediaAddr((self.0 & !SECT_MASK) | (sect & SECT_MASK))
    }
}

impl fmt::Debug for MediaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaAddr")
            .field("grp", &self.grp())
            .field("punit", &self.punit())
            .field("zone", &self.zone())
            .field("sect", &self.sect())
            .finish()
    }
}

/// Immutable per-device constants, supplied by the media layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Number of groups (parallelism domains).
    pub ngrps: u16,
    /// Parallel units per group.
    pub pu_grp: u16,
    /// Zones per parallel unit.
    pub zn_pu: u32,
    /// Sectors per zone.
    pub sec_zn: u64,
    /// Sector size in bytes.
    pub nbytes: u32,
    /// Out-of-band bytes per sector.
    pub nbytes_oob: u32,
}

impl Geometry {
    /// Zones per group.
    pub fn zn_grp(&self) -> u32 {
        self.zn_pu * u32::from(self.pu_grp)
    }

    /// Sectors per group.
    pub fn sec_grp(&self) -> u64 {
        self.sec_zn * u64::from(self.zn_grp())
    }

    /// Total sectors on the device.
    pub fn sec_total(&self) -> u64 {
        self.sec_grp() * u64::from(self.ngrps)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.ngrps == 0
            || self.pu_grp == 0
            || self.zn_pu == 0
            || self.sec_zn == 0
            || self.nbytes == 0
        {
            return Err(Error::NoMedia);
        }
        // Group and parallel-unit ids must fit their address bitfields, or
        // distinct groups would alias onto the same packed address.
        if u64::from(self.ngrps) > GRP_MASK + 1 || u64::from(self.pu_grp) > PUNIT_MASK + 1 {
            return Err(Error::NoMedia);
        }
        if u64::from(self.zn_grp()) > ZONE_MASK || self.sec_total() > SECT_MASK {
            return Err(Error::NoMedia);
        }
        if ZNS_ALIGNMENT % self.nbytes as usize != 0 {
            return Err(Error::NoMedia);
        }
        Ok(())
    }
}

/// Opcode of an asynchronous media command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOpcode {
    /// Sequential write into a zone; the device assigns and returns the
    /// sector the data landed on.
    Append,
    Read,
}

/// One device operation, carved out of a user command.
///
/// Lives in a memory-pool slot from submission until the completion handler
/// returns it. The owning user command is referenced weakly; a completion
/// arriving after the user command was finalized and dropped must degrade to
/// a plain slot release, never to a dangling access.
pub struct MediaCommand {
    pub opcode: IoOpcode,
    /// Target zone for appends (any sector inside the zone); exact start
    /// sector for reads.
    pub addr: MediaAddr,
    pub nsec: u32,
    pub data: *mut u8,
    /// Position of this fragment within the parent command.
    pub sequence: u16,
    /// Provisioning level the sectors were reserved at; reused to rewind the
    /// reservation when the command fails.
    pub level: u8,
    /// Sector assigned by the device on append completion.
    pub paddr: u64,
    pub status: i32,
    pub parent: Weak<UserCommand>,
    pub(crate) mp_entry: *mut MpEntry,
}

unsafe impl Send for MediaCommand {}

impl MediaCommand {
    pub fn append(
        addr: MediaAddr,
        nsec: u32,
        data: *mut u8,
        sequence: u16,
        level: u8,
        parent: Weak<UserCommand>,
    ) -> Self {
        MediaCommand {
            opcode: IoOpcode::Append,
            addr,
            nsec,
            data,
            sequence,
            level,
            paddr: 0,
            status: 0,
            parent,
            mp_entry: core::ptr::null_mut(),
        }
    }

    pub fn read(
        addr: MediaAddr,
        nsec: u32,
        data: *mut u8,
        sequence: u16,
        parent: Weak<UserCommand>,
    ) -> Self {
        MediaCommand {
            opcode: IoOpcode::Read,
            addr,
            nsec,
            data,
            sequence,
            level: 0,
            paddr: 0,
            status: 0,
            parent,
            mp_entry: core::ptr::null_mut(),
        }
    }
}

/// Zone management opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneMgmtOp {
    Open,
    Close,
    Finish,
    Reset,
    Report,
}

/// A synchronous zone management command.
#[derive(Debug)]
pub struct ZoneCommand {
    pub op: ZoneMgmtOp,
    pub addr: MediaAddr,
    pub nzones: u32,
    pub status: i32,
    /// Filled by the media for `Report`.
    pub report: Option<Vec<u8>>,
}

impl ZoneCommand {
    pub fn new(op: ZoneMgmtOp, addr: MediaAddr, nzones: u32) -> Self {
        ZoneCommand {
            op,
            addr,
            nzones,
            status: 0,
            report: None,
        }
    }
}

/// Condition of a zone as reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneCond {
    Empty,
    Open,
    Full,
}

impl ZoneCond {
    fn to_wire(self) -> u8 {
        match self {
            ZoneCond::Empty => 0,
            ZoneCond::Open => 1,
            ZoneCond::Full => 2,
        }
    }

    fn from_wire(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(ZoneCond::Empty),
            1 => Ok(ZoneCond::Open),
            2 => Ok(ZoneCond::Full),
            _ => Err(Error::ZoneReportFailed(0)),
        }
    }
}

/// One descriptor of a zone report blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneReportEntry {
    /// Absolute write pointer in sectors.
    pub wptr: u64,
    /// Writable sectors in the zone.
    pub capacity: u64,
    pub cond: ZoneCond,
}

const REPORT_ENTRY_BYTES: usize = 8 + 8 + 1;

/// Serialize a zone report the way `Media::submit_zn(Report)` returns it.
pub fn encode_zone_report(entries: &[ZoneReportEntry]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(entries.len() * REPORT_ENTRY_BYTES);
    for entry in entries {
        blob.write_u64::<LittleEndian>(entry.wptr).unwrap();
        blob.write_u64::<LittleEndian>(entry.capacity).unwrap();
        blob.write_u8(entry.cond.to_wire()).unwrap();
    }
    blob
}

pub fn decode_zone_report(blob: &[u8]) -> Result<Vec<ZoneReportEntry>, Error> {
    if blob.len() % REPORT_ENTRY_BYTES != 0 {
        return Err(Error::ZoneReportFailed(0));
    }
    let mut cursor = std::io::Cursor::new(blob);
    let mut entries = Vec::with_capacity(blob.len() / REPORT_ENTRY_BYTES);
    while (cursor.position() as usize) < blob.len() {
        let wptr = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::ZoneReportFailed(0))?;
        let capacity = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::ZoneReportFailed(0))?;
        let cond = cursor.read_u8().map_err(|_| Error::ZoneReportFailed(0))?;
        entries.push(ZoneReportEntry {
            wptr,
            capacity,
            cond: ZoneCond::from_wire(cond)?,
        });
    }
    Ok(entries)
}

/// Handle to one asynchronous submission/completion queue pair inside the
/// media layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

/// Invoked by the media's completion thread for every finished command.
///
/// The pointer stays valid for the duration of the call; the handler owns
/// releasing the command's pool slot. Handlers may run concurrently for
/// commands of distinct parents but are never re-entered for the same
/// command.
pub type CompleteFn = Arc<dyn Fn(*mut MediaCommand) + Send + Sync>;

/// The vendor-facing device contract the translation layer is built on.
///
/// Implementations provide geometry, asynchronous I/O through per-thread
/// queue pairs (the completion thread is spawned inside [`Media::asynch_init`]
/// and joined inside [`Media::asynch_term`]), synchronous zone management,
/// and pinned buffer allocation.
pub trait Media: Send + Sync {
    fn geometry(&self) -> Geometry;

    /// Create a queue pair of the given depth and spawn its completion
    /// thread. The thread invokes `complete` for every finished command and
    /// winds down when the queue is terminated; `active` mirrors the owner's
    /// liveness flag.
    fn asynch_init(
        &self,
        depth: u32,
        active: Arc<AtomicBool>,
        complete: CompleteFn,
    ) -> Result<QueueId, Error>;

    /// Tear down a queue pair, joining its completion thread.
    fn asynch_term(&self, queue: QueueId) -> Result<(), Error>;

    /// Queue one asynchronous command. Completion is delivered through the
    /// queue's [`CompleteFn`]; the pointee must stay in place until then.
    fn submit_io(&self, queue: QueueId, cmd: *mut MediaCommand) -> Result<(), Error>;

    /// Execute one zone management command synchronously.
    fn submit_zn(&self, cmd: &mut ZoneCommand) -> Result<(), Error>;

    /// Allocate a pinned buffer suitable for device transfers.
    fn dma_alloc(&self, size: usize) -> Result<*mut u8, Error>;

    fn dma_free(&self, ptr: *mut u8);
}
