//! Windows page source using VirtualAlloc/VirtualFree.

use crate::config::PAGE_SIZE;
use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

// VirtualAlloc returns regions aligned to the 64 KiB allocation granularity.
const ALLOC_GRANULARITY: usize = 65536;

const _: () = assert!(
    PAGE_SIZE <= ALLOC_GRANULARITY,
    "page_size above 64 KiB is not supported on Windows"
);

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "GetStdHandle"]
    fn get_std_handle(n_std_handle: u32) -> *mut c_void;

    #[link_name = "WriteFile"]
    fn write_file(
        h_file: *mut c_void,
        lp_buffer: *const u8,
        n_bytes: u32,
        lp_written: *mut u32,
        lp_overlapped: *mut c_void,
    ) -> i32;
}

const STD_ERROR_HANDLE: u32 = -12i32 as u32;

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        virtual_alloc(
            core::ptr::null_mut(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    ptr.cast()
}

pub unsafe fn page_dealloc(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE requires dwSize = 0 and frees the whole reservation.
    unsafe { virtual_free(ptr.cast(), 0, MEM_RELEASE) };
}

pub fn write_stderr(buf: &[u8]) -> isize {
    let len = buf.len().min(u32::MAX as usize) as u32;
    let mut written = 0u32;
    let ok = unsafe {
        write_file(
            get_std_handle(STD_ERROR_HANDLE),
            buf.as_ptr(),
            len,
            &mut written,
            core::ptr::null_mut(),
        )
    };
    if ok == 0 { -1 } else { written as isize }
}
