//! One compilation unit: the debug-info record for a single translation
//! unit. Everything a unit owns beyond its header is loaded on demand and
//! cached: the abbreviation table on the first entry resolution, each DIE
//! the first time its offset is asked for, the line number program the
//! first time source info is wanted.
use super::{
    Abbreviation, AttrValue, AttributeName, ContainsAddr, DebugSections, Die, LineProgram, Macros,
    RawDie, Tag, UnitKind,
};
use crate::elf::Stream;
use crate::error::{Error, Result};
use crate::verbose;
use log::warn;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub struct Unit {
    pub sections: Rc<DebugSections>,

    /// Section offset of the unit header.
    pub offset: u64,

    /// Length of the unit past the initial-length field.
    pub length: u64,

    /// Section offset one past the unit's last byte.
    pub end: u64,

    pub version: u16,
    pub kind: UnitKind,

    /// Size of an address on the target, from the header.
    pub addr_len: u8,

    /// 4 or 8: the width of offsets in this unit's DWARF encoding.
    pub dwarf_len: u8,

    pub abbrev_offset: u64,

    /// Only meaningful for split units.
    pub id: [u8; 8],

    /// Section offset of the root DIE, directly after the header.
    pub root_offset: u64,

    /// Populated at most once, on the first entry resolution.
    abbreviations: RefCell<HashMap<u64, Rc<Abbreviation>>>,

    /// Sparse cache of decoded DIEs keyed by section offset. An occupied
    /// slot holding `None` records a decode failure (or a null entry) and
    /// suppresses re-decoding.
    entries: RefCell<HashMap<u64, Option<Rc<RawDie>>>>,

    lines: RefCell<Option<Rc<LineProgram>>>,
    macros: RefCell<Option<Rc<Macros>>>,
    ranges_cache: RefCell<HashMap<u64, Rc<Vec<(u64, u64)>>>>,
}

impl Unit {
    /// Parse a unit header at `offset` in .debug_info. See section 7.5.1.
    pub fn new(sections: Rc<DebugSections>, offset: u64) -> Result<Self> {
        let layout = sections.layout;
        let mut s = Stream::new(sections.info.as_ref(), layout, offset);

        let word = s.read_word()?;
        let (mut dwarf_len, length) =
            if word == 0xffffffff { (8u8, s.read_xword()?) } else { (4u8, word as u64) };
        let end = s.offset + length;

        let version = s.read_half()?;
        if version <= 2 {
            // DWARF 2 uses the architecture's address size for offsets.
            dwarf_len = layout.addr_size();
        }

        let mut kind = UnitKind::Compile;
        let mut id = [0u8; 8];
        let addr_len;
        let abbrev_offset;
        if version >= 5 {
            kind = UnitKind::from_u8(s.read_byte()?)?;
            match kind {
                UnitKind::Compile | UnitKind::Type | UnitKind::Partial | UnitKind::Skeleton => {
                    addr_len = s.read_byte()?;
                    abbrev_offset = s.read_uint(dwarf_len)?;
                }
                UnitKind::SplitCompile | UnitKind::SplitType => {
                    addr_len = s.read_byte()?;
                    abbrev_offset = s.read_uint(dwarf_len)?;
                    id = s.read_bytes(8)?.try_into().unwrap();
                }
            }
        } else {
            abbrev_offset = s.read_uint(if version <= 2 { 4 } else { dwarf_len })?;
            addr_len = s.read_byte()?;
        }
        let root_offset = s.offset;

        Ok(Unit {
            sections,
            offset,
            length,
            end,
            version,
            kind,
            addr_len,
            dwarf_len,
            abbrev_offset,
            id,
            root_offset,
            abbreviations: RefCell::new(HashMap::new()),
            entries: RefCell::new(HashMap::new()),
            lines: RefCell::new(None),
            macros: RefCell::new(None),
            ranges_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Read the unit's abbreviation table. Loading twice is prevented by
    /// the non-emptiness check.
    fn load(&self) -> Result<()> {
        if !self.abbreviations.borrow().is_empty() {
            return Ok(());
        }
        let abbrev = self
            .sections
            .abbrev
            .as_ref()
            .ok_or_else(|| Error::BadDwarf("no .debug_abbrev section".to_string()))?;
        let mut s = Stream::new(abbrev.as_ref(), self.sections.layout, self.abbrev_offset);
        let mut table = self.abbreviations.borrow_mut();
        while let Some((code, abbreviation)) = Abbreviation::new(&mut s)? {
            table.insert(code, Rc::new(abbreviation));
        }
        Ok(())
    }

    pub fn find_abbreviation(&self, code: u64) -> Option<Rc<Abbreviation>> {
        self.abbreviations.borrow().get(&code).cloned()
    }

    /// Convert a section-absolute offset to a raw DIE. The parent may be
    /// the empty DIE when it is not known.
    pub fn offset_to_raw_die(self: &Rc<Self>, parent: &Die, offset: u64) -> Option<Rc<RawDie>> {
        if offset == 0 || offset < self.offset || offset >= self.end {
            return None;
        }
        if let Some(cached) = self.entries.borrow().get(&offset) {
            return cached.clone();
        }
        let raw = match RawDie::decode(self, parent, offset) {
            Ok(raw) => raw.map(Rc::new),
            Err(err) => {
                warn!("failed to decode entry at {offset:#x}: {err}");
                None
            }
        };
        // A None still occupies a slot in the table: it's harmless, and
        // cheaper than re-attempting the decode.
        self.entries.borrow_mut().insert(offset, raw.clone());
        raw
    }

    /// Convert a section-absolute offset to a DIE handle.
    pub fn offset_to_die(self: &Rc<Self>, parent: &Die, offset: u64) -> Die {
        if self.abbreviations.borrow().is_empty() {
            if let Err(err) = self.load() {
                warn!("failed to load abbreviations for unit at {:#x}: {err}", self.offset);
                return Die::empty();
            }
        }
        Die { unit: Some(self.clone()), offset, raw: self.offset_to_raw_die(parent, offset) }
    }

    pub fn root(self: &Rc<Self>) -> Die {
        self.offset_to_die(&Die::empty(), self.root_offset)
    }

    pub fn name(self: &Rc<Self>) -> Option<String> {
        self.root().name()
    }

    /// Map a code address to `(file, line)` using the unit's line number
    /// program. Under verbosity the file name is qualified by its
    /// directory.
    pub fn source_from_addr(self: &Rc<Self>, addr: u64) -> Option<(String, u32)> {
        let root = self.root();
        if root.contains_address(addr) == ContainsAddr::No {
            return None;
        }
        let lines = self.get_lines()?;
        for pair in lines.matrix.windows(2) {
            let (row, next) = (&pair[0], &pair[1]);
            if row.end_sequence {
                continue;
            }
            if row.addr <= addr && addr < next.addr {
                let file = lines.files.get(row.file)?;
                let name = if verbose() > 0 {
                    let dir = lines.directories.get(file.dir_index).map(String::as_str).unwrap_or("");
                    format!("{dir}/{}", file.name)
                } else {
                    file.name.clone()
                };
                return Some((name, row.line));
            }
        }
        None
    }

    /// The unit's line number program, materialized on first call. Only
    /// root DIEs of compile and partial units carry one.
    pub fn get_lines(self: &Rc<Self>) -> Option<Rc<LineProgram>> {
        if let Some(lines) = self.lines.borrow().as_ref() {
            return Some(lines.clone());
        }

        let root = self.root();
        match root.tag() {
            Some(Tag::DW_TAG_compile_unit) | Some(Tag::DW_TAG_partial_unit) => {}
            _ => return None,
        }
        let offset = match root.attribute(AttributeName::DW_AT_stmt_list) {
            Some(AttrValue::SecOffset(offset)) => offset,
            Some(AttrValue::Udata(offset)) => offset,
            _ => return None,
        };
        match LineProgram::new(&self.sections, offset, self) {
            Ok(lines) => {
                let lines = Rc::new(lines);
                *self.lines.borrow_mut() = Some(lines.clone());
                Some(lines)
            }
            Err(err) => {
                warn!("failed to read line program at {offset:#x}: {err}");
                None
            }
        }
    }

    /// The unit's macro table, if the root names one. DW_AT_macro_info is
    /// the DWARF 4 flavor; the other two use the version 5 format.
    pub fn get_macros(self: &Rc<Self>) -> Option<Rc<Macros>> {
        if let Some(macros) = self.macros.borrow().as_ref() {
            return Some(macros.clone());
        }
        let root = self.root();
        for name in [
            AttributeName::DW_AT_GNU_macros,
            AttributeName::DW_AT_macros,
            AttributeName::DW_AT_macro_info,
        ] {
            let offset = match root.attribute(name) {
                Some(AttrValue::SecOffset(offset)) => offset,
                Some(AttrValue::Udata(offset)) => offset,
                _ => continue,
            };
            let version = if name == AttributeName::DW_AT_macro_info { 4 } else { 5 };
            match Macros::new(&self.sections, offset, version) {
                Ok(macros) => {
                    let macros = Rc::new(macros);
                    *self.macros.borrow_mut() = Some(macros.clone());
                    return Some(macros);
                }
                Err(err) => {
                    warn!("failed to read macro table at {offset:#x}: {err}");
                    return None;
                }
            }
        }
        None
    }

    /// The range list at `offset`, decoded once per unit lifetime.
    pub fn ranges_at(&self, offset: u64, base: u64) -> Option<Rc<Vec<(u64, u64)>>> {
        if let Some(ranges) = self.ranges_cache.borrow().get(&offset) {
            return Some(ranges.clone());
        }
        let ranges = match super::read_ranges(&self.sections, self, offset, base) {
            Ok(ranges) => Rc::new(ranges),
            Err(err) => {
                warn!("failed to read ranges at {offset:#x}: {err}");
                return None;
            }
        };
        self.ranges_cache.borrow_mut().insert(offset, ranges.clone());
        Some(ranges)
    }

    /// Resolve a DW_FORM_addrx index through .debug_addr. The base comes
    /// from the root's DW_AT_addr_base, defaulting to just past the section
    /// header.
    pub fn addr_from_index(self: &Rc<Self>, index: u64) -> Option<AttrValue> {
        let addr = self.sections.addr.as_ref()?;
        let base = match self.root().attribute(AttributeName::DW_AT_addr_base) {
            Some(AttrValue::SecOffset(base)) => base,
            _ => self.table_header_size(),
        };
        let mut s = Stream::new(addr.as_ref(), self.sections.layout, base + index * self.addr_len as u64);
        match s.read_uint(self.addr_len) {
            Ok(value) => Some(AttrValue::Addr(value)),
            Err(err) => {
                warn!("failed to resolve address index {index}: {err}");
                None
            }
        }
    }

    /// Resolve a DW_FORM_strx index through .debug_str_offsets into
    /// .debug_str.
    pub fn string_from_index(self: &Rc<Self>, index: u64) -> Option<AttrValue> {
        let offsets = self.sections.str_offsets.as_ref()?;
        let strings = self.sections.strings.as_ref()?;
        let base = match self.root().attribute(AttributeName::DW_AT_str_offsets_base) {
            Some(AttrValue::SecOffset(base)) => base,
            _ => self.table_header_size(),
        };
        let mut s =
            Stream::new(offsets.as_ref(), self.sections.layout, base + index * self.dwarf_len as u64);
        let offset = match s.read_uint(self.dwarf_len) {
            Ok(offset) => offset,
            Err(err) => {
                warn!("failed to resolve string index {index}: {err}");
                return None;
            }
        };
        match strings.read_string_at(offset) {
            Ok(value) => Some(AttrValue::Str(value)),
            Err(err) => {
                warn!("failed to read string at {offset:#x}: {err}");
                None
            }
        }
    }

    fn table_header_size(&self) -> u64 {
        if self.dwarf_len == 8 { 16 } else { 8 }
    }

    /// Reclaim the caches that grow during symbolication. The abbreviation
    /// table and line program stay; they are small and expensive to rebuild.
    pub fn purge(&self) {
        self.entries.replace(HashMap::new());
        self.ranges_cache.replace(HashMap::new());
        self.macros.replace(None);
    }
}
