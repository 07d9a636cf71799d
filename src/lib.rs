//! A user-space zone translation layer for append-only zoned block devices.
//!
//! The crate presents random-access object writes over strictly sequential
//! zone semantics: zones are provisioned per workload level across parallel
//! groups, variable-sized user writes are fragmented into device appends and
//! reassembled from their completions, and a flat logical-to-physical table
//! resolves object reads. The device itself sits behind the [`media::Media`]
//! trait; [`mem_media::MemMedia`] is the crate's RAM-backed reference
//! implementation.

pub mod ctx;
pub mod dma;
pub mod error;
pub mod groups;
pub mod map;
pub mod media;
pub mod mem_media;
pub mod mempool;
pub mod pro;
pub mod stats;
pub mod sync;
pub mod wca;
pub mod zmd;
pub mod zrocks;

pub use dma::{AlignedAllocator, Allocator};
pub use error::Error;
pub use groups::{Group, ZtlCore, ZtlOpts};
pub use media::{Geometry, Media, MediaAddr, ZNS_ALIGNMENT};
pub use mem_media::MemMedia;
pub use zrocks::{Zrocks, ZrocksBuffer};
