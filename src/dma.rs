use crate::error::Error;
use core::alloc::Layout;
use core::ptr;

/// Provider of buffers the media layer can transfer from.
///
/// The translation layer never assumes it can hand arbitrary heap memory to
/// a device; every pooled slot and every staging buffer comes through an
/// allocator so a backend with pinning or registration requirements can
/// substitute its own.
pub trait Allocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<*mut u8, Error>;
    fn deallocate(&self, ptr: *mut u8, layout: Layout);
}

/// `posix_memalign`-backed allocator.
///
/// The standard allocator of the crate: alignment-correct host memory,
/// sufficient for any media implementation that does its own staging.
pub struct AlignedAllocator;

impl Allocator for AlignedAllocator {
    fn allocate(&self, layout: Layout) -> Result<*mut u8, Error> {
        // posix_memalign requires the alignment to be a multiple of the
        // pointer size.
        let align = layout.align().max(core::mem::size_of::<usize>());
        let mut out: *mut libc::c_void = ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
        if ret != 0 || out.is_null() {
            return Err(Error::AllocationFailed(layout.size()));
        }
        unsafe { ptr::write_bytes(out as *mut u8, 0, layout.size()) };
        Ok(out as *mut u8)
    }

    fn deallocate(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { libc::free(ptr as *mut libc::c_void) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ZNS_ALIGNMENT;

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let allocator = AlignedAllocator;
        let layout = Layout::from_size_align(ZNS_ALIGNMENT * 3, ZNS_ALIGNMENT).unwrap();
        let ptr = allocator.allocate(layout).unwrap();
        assert_eq!(ptr as usize % ZNS_ALIGNMENT, 0);
        let slice = unsafe { core::slice::from_raw_parts(ptr, layout.size()) };
        assert!(slice.iter().all(|&b| b == 0));
        allocator.deallocate(ptr, layout);
    }

    #[test]
    fn small_alignments_are_promoted() {
        let allocator = AlignedAllocator;
        let layout = Layout::from_size_align(64, 1).unwrap();
        let ptr = allocator.allocate(layout).unwrap();
        assert_eq!(ptr as usize % core::mem::size_of::<usize>(), 0);
        allocator.deallocate(ptr, layout);
    }
}
