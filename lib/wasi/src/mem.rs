//! Guest linear-memory accessors.
//!
//! All helpers return a WASI errno on failure (`EFAULT` for
//! out-of-bounds, `EINVAL` for malformed data) so syscalls can hand the
//! error straight back to the guest instead of trapping.

use wasmer::MemoryView;

use crate::abi::{ERRNO_FAULT, ERRNO_INVAL};

pub fn read_bytes(view: &MemoryView, ptr: u32, len: u32) -> Result<Vec<u8>, u16> {
    let mut buf = vec![0u8; len as usize];
    view.read(ptr as u64, &mut buf).map_err(|_| ERRNO_FAULT)?;
    Ok(buf)
}

pub fn write_bytes(view: &MemoryView, ptr: u32, data: &[u8]) -> Result<(), u16> {
    view.write(ptr as u64, data).map_err(|_| ERRNO_FAULT)
}

pub fn read_u32(view: &MemoryView, ptr: u32) -> Result<u32, u16> {
    let mut buf = [0u8; 4];
    view.read(ptr as u64, &mut buf).map_err(|_| ERRNO_FAULT)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64(view: &MemoryView, ptr: u32) -> Result<u64, u16> {
    let mut buf = [0u8; 8];
    view.read(ptr as u64, &mut buf).map_err(|_| ERRNO_FAULT)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u32(view: &MemoryView, ptr: u32, value: u32) -> Result<(), u16> {
    write_bytes(view, ptr, &value.to_le_bytes())
}

pub fn write_u64(view: &MemoryView, ptr: u32, value: u64) -> Result<(), u16> {
    write_bytes(view, ptr, &value.to_le_bytes())
}

pub fn read_string(view: &MemoryView, ptr: u32, len: u32) -> Result<String, u16> {
    let bytes = read_bytes(view, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| ERRNO_INVAL)
}

/// Gather the `(ptr, len)` pairs of a ciovec/iovec array.
pub fn read_iovecs(view: &MemoryView, ptr: u32, count: u32) -> Result<Vec<(u32, u32)>, u16> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let base = ptr + i * 8;
        out.push((read_u32(view, base)?, read_u32(view, base + 4)?));
    }
    Ok(out)
}
