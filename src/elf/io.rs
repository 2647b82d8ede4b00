//! Random access byte sources. Everything that decodes ELF or DWARF reads
//! through the [`ByteReader`] trait so the same code can run over a memory
//! mapped file, an in-memory buffer (decompressed sections, tests), a
//! sub-view of another reader (note payloads), or the composite core reader
//! that stitches a task's address space together.
use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A uniform random-access byte source.
pub trait ByteReader {
    /// Copy bytes starting at `offset` into `dst`, returning how many were
    /// written. The count is less than `dst.len()` only when the source has
    /// no further bytes at that offset.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>;

    /// Total number of bytes, or `u64::MAX` for unbounded sources.
    fn size(&self) -> u64;

    /// Human readable identification, used in diagnostics and output headers.
    fn describe(&self) -> String;

    /// Read exactly `dst.len()` bytes or fail.
    fn read_exact_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let count = self.read_at(offset, dst)?;
        if count == dst.len() {
            Ok(())
        } else {
            Err(Error::OutOfBounds { offset: offset + count as u64, source_name: self.describe() })
        }
    }

    /// Read a null-terminated string. The kernel documents most of these as
    /// ASCII; anything non-UTF-8 is replaced rather than failing.
    fn read_string_at(&self, offset: u64) -> Result<String> {
        let mut bytes = Vec::new();
        let mut at = offset;
        loop {
            let mut chunk = [0u8; 64];
            let count = self.read_at(at, &mut chunk)?;
            if count == 0 {
                return Err(Error::OutOfBounds { offset: at, source_name: self.describe() });
            }
            match chunk[..count].iter().position(|&b| b == 0) {
                Some(n) => {
                    bytes.extend_from_slice(&chunk[..n]);
                    return Ok(String::from_utf8_lossy(&bytes).into_owned());
                }
                None => {
                    bytes.extend_from_slice(&chunk[..count]);
                    at += count as u64;
                }
            }
        }
    }
}

/// Shared handle to a byte source.
pub type ReaderRef = Arc<dyn ByteReader>;

/// Create a sub-view covering `[offset, offset + len)` of `parent`.
pub fn view(parent: ReaderRef, label: &str, offset: u64, len: u64) -> ReaderRef {
    Arc::new(ViewReader { parent, label: label.to_string(), offset, len })
}

pub struct FileReader {
    path: PathBuf,
    bytes: Mmap,
}

impl FileReader {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Unsafe because behavior is undefined if the underlying file is
        // modified while the map is in use.
        let bytes = unsafe { Mmap::map(&file) }?;
        Ok(FileReader { path: path.to_path_buf(), bytes })
    }
}

impl ByteReader for FileReader {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        Ok(copy_from_slice(&self.bytes, offset, dst))
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// An in-memory buffer: decompressed section payloads and synthetic images.
pub struct MemReader {
    label: String,
    bytes: Vec<u8>,
}

impl MemReader {
    pub fn new(label: &str, bytes: Vec<u8>) -> Self {
        MemReader { label: label.to_string(), bytes }
    }
}

impl ByteReader for MemReader {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        Ok(copy_from_slice(&self.bytes, offset, dst))
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// A window into another reader. Reads are clamped to the window.
struct ViewReader {
    parent: ReaderRef,
    label: String,
    offset: u64,
    len: u64,
}

impl ByteReader for ViewReader {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let avail = (self.len - offset).min(dst.len() as u64) as usize;
        self.parent.read_at(self.offset + offset, &mut dst[..avail])
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn describe(&self) -> String {
        format!("{} in {}", self.label, self.parent.describe())
    }
}

fn copy_from_slice(src: &[u8], offset: u64, dst: &mut [u8]) -> usize {
    if offset >= src.len() as u64 {
        return 0;
    }
    let start = offset as usize;
    let count = dst.len().min(src.len() - start);
    dst[..count].copy_from_slice(&src[start..start + count]);
    count
}

/// Byte order and word size of an image. Every multi-byte decode goes
/// through this so the same code path serves 32-bit and big-endian images.
#[derive(Copy, Clone, Debug)]
pub struct Layout {
    pub little_endian: bool,
    pub sixty_four_bit: bool,
}

impl Layout {
    pub fn addr_size(&self) -> u8 {
        if self.sixty_four_bit { 8 } else { 4 }
    }
}

/// A cursor over a [`ByteReader`].
pub struct Stream<'a> {
    pub reader: &'a dyn ByteReader,
    pub layout: Layout,
    pub offset: u64,
}

impl<'a> Stream<'a> {
    pub fn new(reader: &'a dyn ByteReader, layout: Layout, offset: u64) -> Self {
        Stream { reader, layout, offset }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.reader.read_exact_at(self.offset, &mut buf)?;
        self.offset += 1;
        Ok(buf[0])
    }

    pub fn read_half(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.reader.read_exact_at(self.offset, &mut buf)?;
        self.offset += 2;
        if self.layout.little_endian {
            Ok(u16::from_le_bytes(buf))
        } else {
            Ok(u16::from_be_bytes(buf))
        }
    }

    pub fn read_word(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.reader.read_exact_at(self.offset, &mut buf)?;
        self.offset += 4;
        if self.layout.little_endian {
            Ok(u32::from_le_bytes(buf))
        } else {
            Ok(u32::from_be_bytes(buf))
        }
    }

    pub fn read_xword(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.reader.read_exact_at(self.offset, &mut buf)?;
        self.offset += 8;
        if self.layout.little_endian {
            Ok(u64::from_le_bytes(buf))
        } else {
            Ok(u64::from_be_bytes(buf))
        }
    }

    pub fn read_int(&mut self) -> Result<i32> {
        Ok(self.read_word()? as i32)
    }

    /// An unsigned integer of `width` bytes, widened to 64 bits.
    pub fn read_uint(&mut self, width: u8) -> Result<u64> {
        match width {
            1 => Ok(self.read_byte()? as u64),
            2 => Ok(self.read_half()? as u64),
            4 => Ok(self.read_word()? as u64),
            8 => self.read_xword(),
            n => Err(Error::BadDwarf(format!("unsupported integer width: {n}"))),
        }
    }

    /// Corresponds to the kernel's user_long_t: 64 or 32 bits depending on
    /// the image. For sanity the result is always widened to 64 bits.
    pub fn read_ulong(&mut self) -> Result<u64> {
        if self.layout.sixty_four_bit {
            self.read_xword()
        } else {
            Ok(self.read_word()? as u64)
        }
    }

    pub fn read_addr(&mut self) -> Result<u64> {
        self.read_ulong()
    }

    pub fn read_offset(&mut self) -> Result<u64> {
        self.read_ulong()
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.reader.read_exact_at(self.offset, &mut buf)?;
        self.offset += count as u64;
        Ok(buf)
    }

    /// Read a null-terminated string and leave the cursor past the null.
    /// Advancement is by bytes consumed, not characters, so a non-UTF-8
    /// name can't skew the cursor.
    pub fn read_string(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_byte()?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn skip(&mut self, count: u64) {
        self.offset += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LE64: Layout = Layout { little_endian: true, sixty_four_bit: true };

    #[test]
    fn mem_reader_bounds() {
        let r = MemReader::new("buf", vec![1, 2, 3, 4]);
        let mut dst = [0u8; 8];
        assert_eq!(r.read_at(0, &mut dst).unwrap(), 4);
        assert_eq!(r.read_at(3, &mut dst).unwrap(), 1);
        assert_eq!(r.read_at(4, &mut dst).unwrap(), 0);
        assert!(r.read_exact_at(2, &mut dst[..4]).is_err());
    }

    #[test]
    fn view_clamps_to_window() {
        let base: ReaderRef = Arc::new(MemReader::new("buf", (0..16).collect()));
        let v = view(base, "window", 4, 8);
        let mut dst = [0u8; 16];
        assert_eq!(v.read_at(0, &mut dst).unwrap(), 8);
        assert_eq!(&dst[..8], &[4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(v.read_at(8, &mut dst).unwrap(), 0);
        assert_eq!(v.size(), 8);
    }

    #[test]
    fn stream_integers() {
        let r = MemReader::new("buf", vec![0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0, 0]);
        let mut s = Stream::new(&r, LE64, 0);
        assert_eq!(s.read_half().unwrap(), 0x1234);
        assert_eq!(s.offset, 2);
        let mut s = Stream::new(&r, LE64, 0);
        assert_eq!(s.read_xword().unwrap(), 0x0000123456781234);
    }

    #[test]
    fn stream_strings() {
        let r = MemReader::new("buf", b"first\0second\0".to_vec());
        let mut s = Stream::new(&r, LE64, 0);
        assert_eq!(s.read_string().unwrap(), "first");
        assert_eq!(s.read_string().unwrap(), "second");
        assert!(s.read_string().is_err());
    }
}
