//! One ELF image: a core file, an executable, or a shared library. This is
//! the inspector the rest of the crate goes through; it knows the image's
//! loadable segments, its notes, and how to hand out section contents
//! (decompressing them when needed) without exposing any of the container
//! format to callers.
use super::{
    read_sections, read_segments, view, ElfHeader, ElfType, Layout, MemReader, NoteIter, ReaderRef,
    SectionHeader, SectionKind, Segment, SegmentKind, Stream, ELFCOMPRESS_ZLIB,
};
use crate::error::{Error, Result};
use flate2::read::ZlibDecoder;
use log::warn;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ElfObject {
    pub path: PathBuf,
    pub reader: ReaderRef,
    pub header: ElfHeader,

    /// Loadable segments ordered by vaddr.
    loads: Vec<Segment>,

    /// Every program header, for the note walker.
    segments: Vec<Segment>,

    sections: Vec<SectionHeader>,
    section_names: HashMap<String, usize>,
}

impl ElfObject {
    pub fn new(reader: ReaderRef, path: PathBuf) -> Result<Arc<Self>> {
        let header = ElfHeader::new(reader.as_ref())?;
        let layout = header.layout;
        let segments = read_segments(&reader, &header, layout);
        let mut loads: Vec<Segment> =
            segments.iter().filter(|s| s.kind == SegmentKind::Load).copied().collect();
        // Keep these sorted so an address lookup over a malformed image with
        // overlapping segments deterministically picks the lowest vaddr.
        loads.sort_by_key(|s| s.vaddr);

        let sections = read_sections(&reader, &header, layout);
        let section_names = ElfObject::load_section_names(&reader, &header, &sections);

        Ok(Arc::new(ElfObject { path, reader, header, loads, segments, sections, section_names }))
    }

    pub fn layout(&self) -> Layout {
        self.header.layout
    }

    pub fn is_core(&self) -> bool {
        self.header.etype == ElfType::Core
    }

    /// The loadable segments, ordered by vaddr.
    pub fn loads(&self) -> &[Segment] {
        &self.loads
    }

    /// The segments of one kind, in file order.
    pub fn segments(&self, kind: SegmentKind) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.kind == kind)
    }

    /// Lazily walk the image's notes.
    pub fn notes(&self) -> NoteIter {
        let note_segments: Vec<&Segment> = self.segments(SegmentKind::Note).collect();
        NoteIter::new(&self.reader, self.header.layout, &note_segments)
    }

    /// The loadable segment containing `addr`, if any. With overlapping
    /// segments (malformed image) the one with the smallest vaddr wins.
    pub fn find_segment_for_address(&self, addr: u64) -> Option<&Segment> {
        self.loads.iter().find(|s| s.contains(addr))
    }

    pub fn section_by_name(&self, name: &str) -> Option<&SectionHeader> {
        self.section_names.get(name).map(|&i| &self.sections[i])
    }

    /// A reader over the uncompressed contents of whichever of the two
    /// section names exists: `name` itself, or its compressed alias of the
    /// `.zdebug_` flavor. Decompression is our concern; callers always see
    /// plain bytes.
    pub fn section_reader(&self, name: &str, compressed_alias: &str) -> Option<ReaderRef> {
        if let Some(section) = self.section_by_name(name) {
            if section.kind == SectionKind::NoBits {
                return None;
            }
            if section.compressed() {
                return match self.inflate_chdr_section(name, section) {
                    Ok(reader) => Some(reader),
                    Err(err) => {
                        warn!("failed to decompress section {name}: {err}");
                        None
                    }
                };
            }
            return Some(view(self.reader.clone(), name, section.offset, section.size));
        }
        if let Some(section) = self.section_by_name(compressed_alias) {
            return match self.inflate_zdebug_section(compressed_alias, section) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    warn!("failed to decompress section {compressed_alias}: {err}");
                    None
                }
            };
        }
        None
    }

    /// SHF_COMPRESSED sections start with a Chdr naming the algorithm and
    /// the uncompressed size, followed by a zlib stream.
    fn inflate_chdr_section(&self, name: &str, section: &SectionHeader) -> Result<ReaderRef> {
        let layout = self.header.layout;
        let mut s = Stream::new(self.reader.as_ref(), layout, section.offset);
        let ch_type = s.read_word()?;
        if layout.sixty_four_bit {
            let _ch_reserved = s.read_word()?;
        }
        let ch_size = s.read_ulong()?;
        let _ch_addralign = s.read_ulong()?;
        if ch_type != ELFCOMPRESS_ZLIB {
            return Err(Error::BadElf(format!("unsupported compression type {ch_type} in {name}")));
        }
        let header_size = s.offset - section.offset;
        let payload_size = section
            .size
            .checked_sub(header_size)
            .ok_or_else(|| Error::BadElf(format!("section {name} too small for its Chdr")))?;
        let payload = s.read_bytes(payload_size as usize)?;
        self.inflate(name, &payload, ch_size)
    }

    /// Legacy .zdebug_* sections: a "ZLIB" magic, the uncompressed size as
    /// a big-endian u64, then the zlib stream.
    fn inflate_zdebug_section(&self, name: &str, section: &SectionHeader) -> Result<ReaderRef> {
        let mut s = Stream::new(self.reader.as_ref(), self.header.layout, section.offset);
        let magic = s.read_bytes(4)?;
        if magic != b"ZLIB" {
            return Err(Error::BadElf(format!("bad magic in compressed section {name}")));
        }
        let size = u64::from_be_bytes(s.read_bytes(8)?.try_into().unwrap());
        let payload_size = section
            .size
            .checked_sub(12)
            .ok_or_else(|| Error::BadElf(format!("section {name} too small for its header")))?;
        let payload = s.read_bytes(payload_size as usize)?;
        self.inflate(name, &payload, size)
    }

    fn inflate(&self, name: &str, payload: &[u8], expected: u64) -> Result<ReaderRef> {
        let mut bytes = Vec::with_capacity(expected as usize);
        ZlibDecoder::new(payload).read_to_end(&mut bytes)?;
        if bytes.len() as u64 != expected {
            return Err(Error::BadElf(format!(
                "section {name} inflated to {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        Ok(Arc::new(MemReader::new(name, bytes)))
    }

    /// Returns a string from the section string table. Note that the index
    /// can point into the middle of a string.
    fn load_section_names(
        reader: &ReaderRef,
        header: &ElfHeader,
        sections: &[SectionHeader],
    ) -> HashMap<String, usize> {
        let mut names = HashMap::new();
        let strtab_index = header.string_table_index as u64;
        let offset = header.section_offset + strtab_index * header.section_entry_size as u64;
        let mut s = Stream::new(reader.as_ref(), header.layout, offset);
        let strtab = match SectionHeader::new(&mut s) {
            Ok(h) => h,
            Err(err) => {
                if !sections.is_empty() {
                    warn!("failed to read section string table header: {err}");
                }
                return names;
            }
        };
        for (i, section) in sections.iter().enumerate() {
            match reader.read_string_at(strtab.offset + section.name as u64) {
                Ok(name) => {
                    names.insert(name, i);
                }
                Err(err) => warn!("failed to read section name {}: {err}", section.name),
            }
        }
        names
    }

    /// Resolve a string table entry for the symbol tables.
    pub fn string_at(&self, strtab: &SectionHeader, index: u64) -> Option<String> {
        if index >= strtab.size {
            return None;
        }
        match self.reader.read_string_at(strtab.offset + index) {
            Ok(s) => Some(s),
            Err(err) => {
                warn!("failed to read string at index {index}: {err}");
                None
            }
        }
    }

    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimage::ImageBuilder;

    #[test]
    fn loads_are_sorted_and_searchable() {
        let object = ImageBuilder::core()
            .segment(0x500000, vec![1; 0x100], 0x100, 5)
            .segment(0x400000, vec![0; 0x1000], 0x2000, 5)
            .build_object();
        let loads = object.loads();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].vaddr, 0x400000);
        assert_eq!(loads[1].vaddr, 0x500000);

        let seg = object.find_segment_for_address(0x400800).unwrap();
        assert_eq!(seg.vaddr, 0x400000);
        assert_eq!(seg.file_size, 0x1000);
        assert_eq!(seg.mem_size, 0x2000);
        // The zero-fill tail still counts as mapped.
        assert!(object.find_segment_for_address(0x401fff).is_some());
        assert!(object.find_segment_for_address(0x402000).is_none());
    }

    #[test]
    fn notes_walk_in_order() {
        let object = ImageBuilder::core()
            .note("CORE", 6, vec![0u8; 16])
            .note("CORE", 1, vec![1u8; 8])
            .note("GNU", 3, vec![2u8; 4])
            .build_object();
        let notes: Vec<_> = object.notes().collect();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].name, "CORE");
        assert_eq!(notes[0].core_type(), Some(crate::elf::CoreNoteType::AuxV));
        assert_eq!(notes[1].core_type(), Some(crate::elf::CoreNoteType::PrStatus));
        assert_eq!(notes[1].data.size(), 8);
        assert_eq!(notes[2].name, "GNU");
        assert_eq!(notes[2].core_type(), None);
    }

    #[test]
    fn section_lookup_by_name() {
        let object = ImageBuilder::exec()
            .section(".debug_info", vec![9u8; 32])
            .build_object();
        let reader = object.section_reader(".debug_info", ".zdebug_info").unwrap();
        assert_eq!(reader.size(), 32);
        let mut buf = [0u8; 4];
        reader.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
        assert!(object.section_reader(".debug_line", ".zdebug_line").is_none());
    }
}
