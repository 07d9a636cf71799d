use core::fmt;

/// Small-integer status codes recorded on in-flight commands.
///
/// Completion handlers run on the media's completion thread and store the
/// outcome into an atomic on the user command; the codes below are the wire
/// form of [`Error`] for that path. `0` means success. Media-level failures
/// occupy the `0x100` range with the device status in the low bits.
pub(crate) mod code {
    pub const OK: i32 = 0x0;
    pub const NOMEDIA: i32 = 0x2;
    pub const NOINIT: i32 = 0x3;
    pub const MP_OUTBOUNDS: i32 = 0x11;
    pub const MP_INVALID: i32 = 0x12;
    pub const MP_ACTIVE: i32 = 0x13;
    pub const MP_MEMERROR: i32 = 0x14;
    pub const MP_ASYNCH_ERR: i32 = 0x15;
    pub const PROV_ERR: i32 = 0x20;
    pub const ZMD_REP: i32 = 0x21;
    pub const APPEND_ERR: i32 = 0x22;
    pub const MAP_RANGE: i32 = 0x23;
    pub const OBJ_NOT_FOUND: i32 = 0x24;
    pub const BUF_ALIGN: i32 = 0x25;
    pub const LEN_ALIGN: i32 = 0x26;
    pub const DRAIN_TIMEOUT: i32 = 0x27;
    pub const ZONE_STATE: i32 = 0x28;
    pub const LEVEL: i32 = 0x29;
    pub const QUEUE: i32 = 0x2a;
    pub const ALLOC: i32 = 0x2b;
    pub const MEDIA_ERROR: i32 = 0x100;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NoMedia,
    NoInit,
    Media(i32),
    Provision,
    MempoolOutOfBounds(u16, u16),
    MempoolInvalid(u32, u32),
    MempoolActive(u16, u16),
    MempoolMemError,
    MempoolAsynchError,
    ZoneReportFailed(u16),
    AppendOutOfSequence,
    BufferNotAligned(usize),
    LengthNotAligned(usize),
    MapOutOfRange(u64, u64),
    ObjectDoesNotExist(u64),
    DrainTimeout(u16, u32),
    ZoneStateViolation(u64),
    InvalidLevel(u8),
    QueueDoesNotExist(u32),
    AllocationFailed(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMedia => write!(f, "No media layer has been registered."),
            Error::NoInit => write!(f, "The translation layer has not been initialized."),
            Error::Media(status) => {
                write!(f, "The media layer failed a command with status 0x{status:X}.")
            }
            Error::Provision => write!(
                f,
                "No zone could satisfy the provisioning request at the requested level."
            ),
            Error::MempoolOutOfBounds(ty, tid) => write!(
                f,
                "The memory pool key (type {ty}, tid {tid}) is outside the pool key space."
            ),
            Error::MempoolInvalid(entries, ent_sz) => write!(
                f,
                "The memory pool shape ({entries} entries of {ent_sz} B) is outside the \
                 supported bounds."
            ),
            Error::MempoolActive(ty, tid) => write!(
                f,
                "The memory pool bucket (type {ty}, tid {tid}) is already active."
            ),
            Error::MempoolMemError => {
                write!(f, "Memory allocation failed while creating a memory pool.")
            }
            Error::MempoolAsynchError => write!(
                f,
                "The asynchronous submission context could not be created or torn down."
            ),
            Error::ZoneReportFailed(grp) => {
                write!(f, "The zone report for group {grp} could not be loaded.")
            }
            Error::AppendOutOfSequence => write!(
                f,
                "The physical offsets of a completed write are not contiguous in \
                 submission order."
            ),
            Error::BufferNotAligned(address) => write!(
                f,
                "The buffer address {address:X} is not aligned to the zone namespace \
                 alignment."
            ),
            Error::LengthNotAligned(length) => write!(
                f,
                "The buffer length 0x{length:X} is not a multiple of the zone namespace \
                 alignment."
            ),
            Error::MapOutOfRange(id, entries) => write!(
                f,
                "The logical id {id} does not fit the mapping table of {entries} entries."
            ),
            Error::ObjectDoesNotExist(id) => {
                write!(f, "The object with id {id} has no mapping entry.")
            }
            Error::DrainTimeout(tid, inflight) => write!(
                f,
                "Thread context {tid} still had {inflight} commands in flight when the \
                 drain timeout expired."
            ),
            Error::ZoneStateViolation(sector) => write!(
                f,
                "The operation at sector 0x{sector:X} violates the state machine of its \
                 zone."
            ),
            Error::InvalidLevel(level) => {
                write!(f, "The provisioning level {level} is not a known workload class.")
            }
            Error::QueueDoesNotExist(id) => {
                write!(f, "The submission queue with id {id} does not exist.")
            }
            Error::AllocationFailed(size) => {
                write!(f, "An aligned allocation of 0x{size:X} B failed.")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// The status-code form stored on user commands by completion handlers.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::NoMedia => code::NOMEDIA,
            Error::NoInit => code::NOINIT,
            Error::Media(status) => code::MEDIA_ERROR | (status & 0xff),
            Error::Provision => code::PROV_ERR,
            Error::MempoolOutOfBounds(..) => code::MP_OUTBOUNDS,
            Error::MempoolInvalid(..) => code::MP_INVALID,
            Error::MempoolActive(..) => code::MP_ACTIVE,
            Error::MempoolMemError => code::MP_MEMERROR,
            Error::MempoolAsynchError => code::MP_ASYNCH_ERR,
            Error::ZoneReportFailed(_) => code::ZMD_REP,
            Error::AppendOutOfSequence => code::APPEND_ERR,
            Error::BufferNotAligned(_) => code::BUF_ALIGN,
            Error::LengthNotAligned(_) => code::LEN_ALIGN,
            Error::MapOutOfRange(..) => code::MAP_RANGE,
            Error::ObjectDoesNotExist(_) => code::OBJ_NOT_FOUND,
            Error::DrainTimeout(..) => code::DRAIN_TIMEOUT,
            Error::ZoneStateViolation(_) => code::ZONE_STATE,
            Error::InvalidLevel(_) => code::LEVEL,
            Error::QueueDoesNotExist(_) => code::QUEUE,
            Error::AllocationFailed(_) => code::ALLOC,
        }
    }

    /// Rebuild an error from a status code recorded on a user command.
    ///
    /// Codes produced by [`Error::status_code`] round-trip to a variant of the
    /// same kind; payload detail that only existed at the failure site is not
    /// reconstructed.
    pub fn from_status(status: i32) -> Option<Error> {
        if status == code::OK {
            return None;
        }
        if status & code::MEDIA_ERROR != 0 {
            return Some(Error::Media(status & 0xff));
        }
        Some(match status {
            code::NOMEDIA => Error::NoMedia,
            code::NOINIT => Error::NoInit,
            code::MP_OUTBOUNDS => Error::MempoolOutOfBounds(0, 0),
            code::MP_INVALID => Error::MempoolInvalid(0, 0),
            code::MP_ACTIVE => Error::MempoolActive(0, 0),
            code::MP_MEMERROR => Error::MempoolMemError,
            code::MP_ASYNCH_ERR => Error::MempoolAsynchError,
            code::PROV_ERR => Error::Provision,
            code::ZMD_REP => Error::ZoneReportFailed(0),
            code::APPEND_ERR => Error::AppendOutOfSequence,
            code::MAP_RANGE => Error::MapOutOfRange(0, 0),
            code::OBJ_NOT_FOUND => Error::ObjectDoesNotExist(0),
            code::BUF_ALIGN => Error::BufferNotAligned(0),
            code::LEN_ALIGN => Error::LengthNotAligned(0),
            code::DRAIN_TIMEOUT => Error::DrainTimeout(0, 0),
            code::ZONE_STATE => Error::ZoneStateViolation(0),
            code::LEVEL => Error::InvalidLevel(0),
            code::QUEUE => Error::QueueDoesNotExist(0),
            code::ALLOC => Error::AllocationFailed(0),
            _ => Error::Media(status & 0xff),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_by_kind() {
        let errors = [
            Error::NoMedia,
            Error::Provision,
            Error::AppendOutOfSequence,
            Error::MempoolAsynchError,
            Error::Media(0x42),
        ];
        for err in errors {
            let back = Error::from_status(err.status_code()).unwrap();
            assert_eq!(
                core::mem::discriminant(&back),
                core::mem::discriminant(&err)
            );
        }
        assert!(Error::from_status(code::OK).is_none());
    }
}
