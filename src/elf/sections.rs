//! Section headers: the static linking and debugging view of an image.
//! Core files usually carry no sections; the executables mapped into them
//! carry the symbol tables and .debug_* sections we symbolicate with.
//! Also see segments.
use super::{ElfHeader, Layout, ReaderRef, Stream};
use crate::error::Result;
use log::warn;

pub const COMPRESSED_FLAG: u64 = 1 << 11;

/// Compression type in a Chdr for sections with [`COMPRESSED_FLAG`] set.
pub const ELFCOMPRESS_ZLIB: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SectionKind {
    /// Not to be used.
    Null,

    /// CPU instructions or constant data.
    ProgBits,

    /// Debugging info.
    SymbolTable,

    /// Strings for use by the linker and debugger.
    StringTable,

    /// Uninitialized data.
    NoBits,

    /// Arbitrary metadata.
    Note,

    /// Dynamic linker symbol table.
    DynamicSymbolTable,

    /// Dynamic linking information.
    Dynamic,

    /// Everything we have no use for.
    Other(u32),
}

impl SectionKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x0 => SectionKind::Null,
            0x1 => SectionKind::ProgBits,
            0x2 => SectionKind::SymbolTable,
            0x3 => SectionKind::StringTable,
            0x6 => SectionKind::Dynamic,
            0x7 => SectionKind::Note,
            0x8 => SectionKind::NoBits,
            0xb => SectionKind::DynamicSymbolTable,
            n => SectionKind::Other(n),
        }
    }
}

#[derive(Clone)]
pub struct SectionHeader {
    /// Index into the section string table. Zero means no name.
    pub name: u32,

    pub kind: SectionKind,

    /// Write, alloc, exec, compressed, etc.
    pub flags: u64,

    /// Virtual address if the section is mapped, otherwise zero.
    pub vaddr: u64,

    /// Offset of the section's first byte within the ELF file.
    pub offset: u64,

    /// Number of bytes in the section.
    pub size: u64,

    /// Link to a related section, usually a string or symbol table.
    pub link: u32,

    /// Set if the section holds a table of fixed-size entries.
    pub entry_size: u64,
}

impl SectionHeader {
    pub fn new(s: &mut Stream) -> Result<Self> {
        if s.layout.sixty_four_bit {
            let name = s.read_word()?;
            let kind = SectionKind::from_u32(s.read_word()?);
            let flags = s.read_xword()?;
            let vaddr = s.read_addr()?;
            let offset = s.read_offset()?;
            let size = s.read_xword()?;
            let link = s.read_word()?;
            let _info = s.read_word()?;
            let _align = s.read_xword()?;
            let entry_size = s.read_xword()?;
            Ok(SectionHeader { name, kind, flags, vaddr, offset, size, link, entry_size })
        } else {
            let name = s.read_word()?;
            let kind = SectionKind::from_u32(s.read_word()?);
            let flags = s.read_word()? as u64;
            let vaddr = s.read_addr()?;
            let offset = s.read_offset()?;
            let size = s.read_word()? as u64;
            let link = s.read_word()?;
            let _info = s.read_word()?;
            let _align = s.read_word()?;
            let entry_size = s.read_word()? as u64;
            Ok(SectionHeader { name, kind, flags, vaddr, offset, size, link, entry_size })
        }
    }

    pub fn compressed(&self) -> bool {
        self.flags & COMPRESSED_FLAG != 0
    }
}

/// Read every section header, skipping null entries. Damage is reported and
/// skipped, the same policy as for program headers.
pub fn read_sections(reader: &ReaderRef, header: &ElfHeader, layout: Layout) -> Vec<SectionHeader> {
    let mut sections = Vec::new();
    let mut offset = header.section_offset;
    for _ in 0..header.num_section_entries {
        let mut s = Stream::new(reader.as_ref(), layout, offset);
        match SectionHeader::new(&mut s) {
            Ok(h) => {
                if h.kind != SectionKind::Null {
                    sections.push(h);
                }
            }
            Err(err) => warn!("failed to read section header at {offset}: {err}"),
        }
        offset += header.section_entry_size as u64;
    }
    sections
}
