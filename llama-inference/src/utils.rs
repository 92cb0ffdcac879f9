#[cfg(test)]
#[path = "../tests/unit/utils_test.rs"]
mod utils_test;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use memmap2::{Mmap, MmapMut};
use std::borrow::Cow;
use std::fs::File;
use std::slice;
use std::time::Instant;

/// Sequential little-endian reader over a read-only memory mapping.
///
/// The mapping is handed over to the caller with [`MemoryMapper::into_mmap`] once parsing is done,
/// so tensor views can borrow from it for as long as the owner lives.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file).context("Failed to create memory mapping")? };
        Ok(Self { mmap, offset: 0 })
    }

    /// Copies bytes into an anonymous mapping, used for in-memory model images.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            anyhow::bail!("Cannot map an empty model image");
        }

        let mut anon = MmapMut::map_anon(bytes.len()).context("Failed to create anonymous mapping")?;
        anon.copy_from_slice(bytes);
        let mmap = anon.make_read_only().context("Failed to seal anonymous mapping")?;

        Ok(Self { mmap, offset: 0 })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        let remaining = self.mmap.len() - self.offset;
        if count > remaining {
            anyhow::bail!("Insufficient data: need {} bytes, have {} remaining", count, remaining);
        }

        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    pub fn skip(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.mmap.len() - self.offset {
            anyhow::bail!("Cannot skip {} bytes: insufficient data", bytes);
        }
        self.offset += bytes;
        Ok(())
    }

    /// Advances to the next multiple of `alignment` (a power of two), staying put when already aligned.
    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        debug_assert!(alignment.is_power_of_two());
        let padding = self.offset.wrapping_neg() & (alignment - 1);
        self.skip(padding).with_context(|| format!("Failed to skip {padding} bytes of alignment padding"))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.get_bytes(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.get_bytes(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.get_bytes(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.get_bytes(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.get_bytes(8)?))
    }

    /// Reads a u64 length and converts it into `usize`.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u64()?;
        usize::try_from(len).with_context(|| format!("Length {len} does not fit into usize"))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.get_bytes(len)?;
        String::from_utf8(bytes.to_vec()).context("String is not valid UTF-8")
    }

    pub fn into_mmap(self) -> Mmap {
        self.mmap
    }
}

/// Reinterprets little-endian bytes as `f32` values.
///
/// Borrows directly from the mapping when the host is little-endian and the bytes are suitably
/// aligned, otherwise decodes into an owned buffer.
pub(crate) fn f32_slice(bytes: &[u8]) -> Cow<'_, [f32]> {
    debug_assert_eq!(bytes.len() % std::mem::size_of::<f32>(), 0);
    let count = bytes.len() / std::mem::size_of::<f32>();

    if cfg!(target_endian = "little") && bytes.as_ptr().align_offset(std::mem::align_of::<f32>()) == 0 {
        // SAFETY: the pointer is aligned for f32, the length covers exactly `count` values,
        // every bit pattern is a valid f32 and the byte order matches the host.
        Cow::Borrowed(unsafe { slice::from_raw_parts(bytes.as_ptr() as *const f32, count) })
    } else {
        let mut values = vec![0.0; count];
        LittleEndian::read_f32_into(bytes, &mut values);
        Cow::Owned(values)
    }
}

/// Logs the elapsed wall time of a scope when dropped.
pub(crate) struct LogTimer {
    label: &'static str,
    start: Instant,
}

impl LogTimer {
    pub fn new(label: &'static str) -> Self {
        Self { label, start: Instant::now() }
    }
}

impl Drop for LogTimer {
    fn drop(&mut self) {
        info!("{}: {} ms", self.label, self.start.elapsed().as_millis());
    }
}
