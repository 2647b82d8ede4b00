//! The debug info container for one ELF object: the handles to its .debug_*
//! sections and the lazily materialized list of compilation units.
use super::{ContainsAddr, Die, Tag, Unit};
use crate::elf::{ElfObject, Layout, ReaderRef};
use log::warn;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Readers over the uncompressed contents of the debug sections an object
/// carries. Units keep a strong reference to this, which in turn keeps the
/// backing object alive.
pub struct DebugSections {
    pub object: Arc<ElfObject>,
    pub layout: Layout,
    pub info: ReaderRef,
    pub abbrev: Option<ReaderRef>,
    pub strings: Option<ReaderRef>,
    pub line: Option<ReaderRef>,
    pub line_strings: Option<ReaderRef>,
    pub str_offsets: Option<ReaderRef>,
    pub addr: Option<ReaderRef>,
    pub ranges: Option<ReaderRef>,
    pub rnglists: Option<ReaderRef>,
    pub macros: Option<ReaderRef>,
    pub macinfo: Option<ReaderRef>,
}

pub struct DwarfInfo {
    pub sections: Rc<DebugSections>,
    units: RefCell<Vec<Rc<Unit>>>,

    /// Section offset of the first unit not yet materialized; u64::MAX once
    /// the section is exhausted or damaged.
    next_unit_offset: Cell<u64>,
}

impl DwarfInfo {
    /// `None` if the object has no .debug_info at all.
    pub fn new(object: Arc<ElfObject>) -> Option<DwarfInfo> {
        let info = object.section_reader(".debug_info", ".zdebug_info")?;
        let layout = object.layout();
        let sections = DebugSections {
            layout,
            info,
            abbrev: object.section_reader(".debug_abbrev", ".zdebug_abbrev"),
            strings: object.section_reader(".debug_str", ".zdebug_str"),
            line: object.section_reader(".debug_line", ".zdebug_line"),
            line_strings: object.section_reader(".debug_line_str", ".zdebug_line_str"),
            str_offsets: object.section_reader(".debug_str_offsets", ".zdebug_str_offsets"),
            addr: object.section_reader(".debug_addr", ".zdebug_addr"),
            ranges: object.section_reader(".debug_ranges", ".zdebug_ranges"),
            rnglists: object.section_reader(".debug_rnglists", ".zdebug_rnglists"),
            macros: object.section_reader(".debug_macro", ".zdebug_macro"),
            macinfo: object.section_reader(".debug_macinfo", ".zdebug_macinfo"),
            object,
        };
        Some(DwarfInfo {
            sections: Rc::new(sections),
            units: RefCell::new(Vec::new()),
            next_unit_offset: Cell::new(0),
        })
    }

    /// The unit at `index`, materializing it if the walk hasn't reached it
    /// yet. Units are laid out back to back in .debug_info, so materializing
    /// unit N means having parsed the headers of units 0..N.
    fn unit_by_index(&self, index: usize) -> Option<Rc<Unit>> {
        loop {
            if let Some(unit) = self.units.borrow().get(index) {
                return Some(unit.clone());
            }
            let offset = self.next_unit_offset.get();
            if offset >= self.sections.info.size() {
                return None;
            }
            match Unit::new(self.sections.clone(), offset) {
                Ok(unit) => {
                    self.next_unit_offset.set(unit.end);
                    self.units.borrow_mut().push(Rc::new(unit));
                }
                Err(err) => {
                    warn!("failed to read unit at offset {offset:#x}: {err}");
                    // The header framing is gone; later units are unreachable.
                    self.next_unit_offset.set(u64::MAX);
                    return None;
                }
            }
        }
    }

    /// Every unit, fully materialized.
    pub fn units(&self) -> Vec<Rc<Unit>> {
        let mut index = 0;
        while self.unit_by_index(index).is_some() {
            index += 1;
        }
        self.units.borrow().clone()
    }

    /// The unit whose header starts at (or covers) the given section offset.
    pub fn unit_at(&self, offset: u64) -> Option<Rc<Unit>> {
        let mut index = 0;
        while let Some(unit) = self.unit_by_index(index) {
            if unit.offset <= offset && offset < unit.end {
                return Some(unit);
            }
            index += 1;
        }
        None
    }

    /// The unit whose root DIE covers the given object-local code address.
    pub fn unit_for_address(&self, addr: u64) -> Option<Rc<Unit>> {
        let mut index = 0;
        while let Some(unit) = self.unit_by_index(index) {
            if unit.root().contains_address(addr) == ContainsAddr::Yes {
                return Some(unit);
            }
            index += 1;
        }
        None
    }

    /// Map an object-local code address to a source file and line by asking
    /// each unit in turn. The first match wins.
    pub fn source_for_address(&self, addr: u64) -> Option<(String, u32)> {
        let mut index = 0;
        while let Some(unit) = self.unit_by_index(index) {
            if let Some(found) = unit.source_from_addr(addr) {
                return Some(found);
            }
            index += 1;
        }
        None
    }

    /// The name of the subprogram entry covering an object-local code
    /// address, searching through namespaces and type scopes.
    pub fn function_for_address(&self, addr: u64) -> Option<String> {
        let unit = self.unit_for_address(addr)?;
        let found = find_subprogram(&unit.root(), addr)?;
        found.name()
    }

    /// Drop the per-unit caches that grow during symbolication.
    pub fn purge(&self) {
        for unit in self.units.borrow().iter() {
            unit.purge();
        }
    }
}

fn find_subprogram(scope: &Die, addr: u64) -> Option<Die> {
    for child in scope.children() {
        match child.tag() {
            Some(Tag::DW_TAG_subprogram) => {
                if child.contains_address(addr) == ContainsAddr::Yes {
                    return Some(child);
                }
            }
            Some(Tag::DW_TAG_namespace)
            | Some(Tag::DW_TAG_structure_type)
            | Some(Tag::DW_TAG_class_type) => {
                if let Some(found) = find_subprogram(&child, addr) {
                    return Some(found);
                }
            }
            _ => (),
        }
    }
    None
}
