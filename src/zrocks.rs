use crate::error::Error;
use crate::groups::{ZtlCore, ZtlOpts};
use crate::media::Media;
use log::info;
use std::sync::Arc;

/// A pinned buffer from the media layer, released on drop.
pub struct ZrocksBuffer {
    media: Arc<dyn Media>,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for ZrocksBuffer {}

impl ZrocksBuffer {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl Drop for ZrocksBuffer {
    fn drop(&mut self) {
        self.media.dma_free(self.ptr);
    }
}

/// The object-store façade over the translation layer.
///
/// Two usage styles coexist: object calls (`new_obj`/`read_obj`/`delete`)
/// where the layer owns the logical-to-physical mapping, and raw calls
/// (`write`/`read`) where the application records the returned byte offsets
/// itself. All buffers, sizes and offsets are multiples of
/// [`crate::media::ZNS_ALIGNMENT`].
pub struct Zrocks {
    core: ZtlCore,
}

impl Zrocks {
    pub fn init(media: Arc<dyn Media>, opts: ZtlOpts) -> Result<Zrocks, Error> {
        let _ = env_logger::try_init();
        let core = ZtlCore::init(media, opts)?;
        info!("zrocks: ready");
        Ok(Zrocks { core })
    }

    /// Shut the instance down, joining every worker thread.
    pub fn exit(mut self) -> Result<(), Error> {
        self.core.shutdown()
    }

    /// The underlying core, for callers that need module-level access.
    pub fn core(&self) -> &ZtlCore {
        &self.core
    }

    /// Allocate a buffer suitable for zero-copy I/O.
    pub fn alloc(&self, size: usize) -> Result<ZrocksBuffer, Error> {
        if size == 0 {
            return Err(Error::AllocationFailed(0));
        }
        let media = self.core.media().clone();
        let ptr = media.dma_alloc(size)?;
        Ok(ZrocksBuffer { media, ptr, size })
    }

    /// Create a variable-sized object at a workload level; the mapping entry
    /// is owned by the translation layer.
    pub fn new_obj(&self, id: u64, buf: &[u8], level: u8) -> Result<(), Error> {
        self.core
            .write_obj(id, buf.as_ptr() as *mut u8, buf.len() as u64, level)
    }

    /// Drop an object's mapping.
    pub fn delete(&self, id: u64) -> Result<(), Error> {
        self.core.delete_obj(id)
    }

    /// Read `buf.len()` bytes at `offset` within an object.
    pub fn read_obj(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.core
            .read_obj(id, offset, buf.as_mut_ptr(), buf.len() as u64)
    }

    /// Write raw data and return the physical byte offset of every fragment;
    /// the application is responsible for recovery.
    pub fn write(&self, buf: &[u8], level: u8) -> Result<Vec<u64>, Error> {
        self.core
            .write(buf.as_ptr() as *mut u8, buf.len() as u64, level)
    }

    /// Read raw data from a physical byte offset.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.core.read(offset, buf.as_mut_ptr(), buf.len() as u64)
    }
}
