//! Program headers: how the kernel (or the run-time loader) placed an image
//! in memory. Core files use PT_LOAD segments for the memory that was
//! captured and PT_NOTE segments for process metadata. Also see sections.
use super::{ElfHeader, Layout, ReaderRef, Stream};
use crate::error::Result;
use log::warn;

const EXECUTE_FLAG: u32 = 0x1;
const WRITE_FLAG: u32 = 0x2;
const READ_FLAG: u32 = 0x4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    /// Not to be used: either a segment that is intended to be unused or one
    /// that is not recognized.
    Null,

    /// A loadable segment, described by p_filesz and p_memsz.
    Load,

    /// Dynamic linking information.
    Dynamic,

    /// Path of the run-time interpreter.
    Interpreter,

    /// Arbitrary metadata; in a core this carries the process state.
    Note,

    /// The program header table itself.
    Phdr,

    /// The thread-local storage template.
    Tls,
}

impl SegmentKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => SegmentKind::Null,
            1 => SegmentKind::Load,
            2 => SegmentKind::Dynamic,
            3 => SegmentKind::Interpreter,
            4 => SegmentKind::Note,
            6 => SegmentKind::Phdr,
            7 => SegmentKind::Tls,
            0x60000000.. => SegmentKind::Null, // OS, processor, and future reserved ranges
            _ => {
                warn!("unknown segment type: {value}");
                SegmentKind::Null
            }
        }
    }
}

/// One program header. For a loadable segment the invariant is
/// `file_size <= mem_size`; the tail `[vaddr + file_size, vaddr + mem_size)`
/// exists in memory but not in the file and reads as zero.
#[derive(Copy, Clone)]
pub struct Segment {
    pub kind: SegmentKind,

    /// Offset of the segment's first byte within the ELF file.
    pub offset: u64,

    /// Virtual address of the segment's first byte.
    pub vaddr: u64,

    /// Number of bytes the segment occupies in the file.
    pub file_size: u64,

    /// Number of bytes the segment occupies in memory.
    pub mem_size: u64,

    /// Read/write/execute flags.
    pub flags: u32,
}

impl Segment {
    pub fn new(s: &mut Stream) -> Result<Self> {
        // Field sizes and order differ between 32-bit and 64-bit ELF files,
        // see https://llvm.org/doxygen/BinaryFormat_2ELF_8h_source.html.
        let segment = if s.layout.sixty_four_bit {
            let p_type = SegmentKind::from_u32(s.read_word()?);
            let p_flags = s.read_word()?;
            let p_offset = s.read_offset()?;
            let p_vaddr = s.read_addr()?;
            let _p_paddr = s.read_addr()?;
            let p_filesz = s.read_xword()?;
            let p_memsz = s.read_xword()?;
            let _p_align = s.read_xword()?;
            Segment {
                kind: p_type,
                offset: p_offset,
                vaddr: p_vaddr,
                file_size: p_filesz,
                mem_size: p_memsz,
                flags: p_flags,
            }
        } else {
            let p_type = SegmentKind::from_u32(s.read_word()?);
            let p_offset = s.read_offset()?;
            let p_vaddr = s.read_addr()?;
            let _p_paddr = s.read_addr()?;
            let p_filesz = s.read_word()? as u64;
            let p_memsz = s.read_word()? as u64;
            let p_flags = s.read_word()?;
            let _p_align = s.read_word()?;
            Segment {
                kind: p_type,
                offset: p_offset,
                vaddr: p_vaddr,
                file_size: p_filesz,
                mem_size: p_memsz,
                flags: p_flags,
            }
        };
        if segment.kind == SegmentKind::Load && segment.file_size > segment.mem_size {
            warn!(
                "segment at {:#x} has file size {:#x} larger than memory size {:#x}",
                segment.vaddr, segment.file_size, segment.mem_size
            );
        }
        Ok(segment)
    }

    /// True if `[vaddr, vaddr + mem_size)` contains `addr`.
    pub fn contains(&self, addr: u64) -> bool {
        self.vaddr <= addr && addr < self.vaddr + self.mem_size
    }

    pub fn executable(&self) -> bool {
        self.flags & EXECUTE_FLAG != 0
    }

    pub fn writeable(&self) -> bool {
        self.flags & WRITE_FLAG != 0
    }

    pub fn readable(&self) -> bool {
        self.flags & READ_FLAG != 0
    }

    pub fn flags(&self) -> String {
        let mut result = String::new();
        result.push(if self.executable() { 'x' } else { '-' });
        result.push(if self.writeable() { 'w' } else { '-' });
        result.push(if self.readable() { 'r' } else { '-' });
        result
    }
}

/// Read every program header. Even a large core file has a small number of
/// them, so callers re-iterate freely. A header that cannot be read is
/// reported and skipped: cores are sometimes damaged (typically truncated)
/// and we want to keep working when that happens.
pub fn read_segments(reader: &ReaderRef, header: &ElfHeader, layout: Layout) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut offset = header.ph_offset;
    for _ in 0..header.num_ph_entries {
        let mut s = Stream::new(reader.as_ref(), layout, offset);
        match Segment::new(&mut s) {
            Ok(segment) => segments.push(segment),
            Err(err) => warn!("failed to read program header at {offset}: {err}"),
        }
        offset += header.ph_entry_size as u64;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_render() {
        let seg = Segment {
            kind: SegmentKind::Load,
            offset: 0,
            vaddr: 0x1000,
            file_size: 0x100,
            mem_size: 0x200,
            flags: READ_FLAG | EXECUTE_FLAG,
        };
        assert_eq!(seg.flags(), "x-r");
        assert!(seg.contains(0x1000));
        assert!(seg.contains(0x11ff));
        assert!(!seg.contains(0x1200));
    }
}
