//! Debug-info entries: the nodes of a unit's tree. A `RawDie` is the
//! decoded attribute values of one entry; a `Die` is the cheap handle that
//! pairs a raw entry with its unit.
use super::{decode_i64, decode_u64, Abbreviation, AttrSpec, AttributeName, Form, Tag, Unit};
use crate::elf::Stream;
use crate::error::{Error, Result};
use std::rc::Rc;

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Addr(u64),

    /// An index into .debug_addr, resolved against the unit's addr base.
    AddrIndex(u64),
    Udata(u64),
    Sdata(i64),
    SecOffset(u64),

    /// A section-absolute offset of another DIE.
    Ref(u64),
    Str(String),

    /// An index into .debug_str_offsets, resolved against the unit's base.
    StrIndex(u64),
    Flag(bool),
    Block(Vec<u8>),
    RangeListIndex(u64),
    LocListIndex(u64),
}

pub struct RawDie {
    pub abbrev: Rc<Abbreviation>,

    /// One value per abbreviation attribute, in declaration order.
    pub values: Vec<AttrValue>,

    /// Section offset of the parent entry, zero when unknown.
    pub parent_offset: u64,

    /// Offset just past the attribute values: the first child when the
    /// entry has children, otherwise the next sibling.
    pub next_offset: u64,
}

impl RawDie {
    /// Decode the entry at the section-absolute `offset`. A code of zero is
    /// a null entry (the end-of-children marker) and yields `None`.
    pub fn decode(unit: &Rc<Unit>, parent: &Die, offset: u64) -> Result<Option<RawDie>> {
        let sections = &unit.sections;
        let mut s = Stream::new(sections.info.as_ref(), sections.layout, offset);
        let code = decode_u64(&mut s)?;
        if code == 0 {
            return Ok(None);
        }
        let abbrev = unit
            .find_abbreviation(code)
            .ok_or_else(|| Error::BadDwarf(format!("no abbreviation with code {code}")))?;

        let mut values = Vec::with_capacity(abbrev.attrs.len());
        for attr in &abbrev.attrs {
            values.push(read_form(&mut s, unit, attr.form, attr)?);
        }
        Ok(Some(RawDie { abbrev, values, parent_offset: parent.offset, next_offset: s.offset }))
    }
}

fn read_u24(s: &mut Stream) -> Result<u64> {
    let b = s.read_bytes(3)?;
    if s.layout.little_endian {
        Ok(u64::from(b[0]) | u64::from(b[1]) << 8 | u64::from(b[2]) << 16)
    } else {
        Ok(u64::from(b[2]) | u64::from(b[1]) << 8 | u64::from(b[0]) << 16)
    }
}

fn read_form(s: &mut Stream, unit: &Rc<Unit>, form: Form, attr: &AttrSpec) -> Result<AttrValue> {
    let sections = &unit.sections;
    let value = match form {
        Form::DW_FORM_addr => AttrValue::Addr(s.read_uint(unit.addr_len)?),
        Form::DW_FORM_addrx => AttrValue::AddrIndex(decode_u64(s)?),
        Form::DW_FORM_addrx1 => AttrValue::AddrIndex(s.read_uint(1)?),
        Form::DW_FORM_addrx2 => AttrValue::AddrIndex(s.read_uint(2)?),
        Form::DW_FORM_addrx3 => AttrValue::AddrIndex(read_u24(s)?),
        Form::DW_FORM_addrx4 => AttrValue::AddrIndex(s.read_uint(4)?),

        Form::DW_FORM_data1 => AttrValue::Udata(s.read_uint(1)?),
        Form::DW_FORM_data2 => AttrValue::Udata(s.read_uint(2)?),
        Form::DW_FORM_data4 => AttrValue::Udata(s.read_uint(4)?),
        Form::DW_FORM_data8 => AttrValue::Udata(s.read_xword()?),
        Form::DW_FORM_data16 => AttrValue::Block(s.read_bytes(16)?),
        Form::DW_FORM_udata => AttrValue::Udata(decode_u64(s)?),
        Form::DW_FORM_sdata => AttrValue::Sdata(decode_i64(s)?),
        Form::DW_FORM_implicit_const => AttrValue::Sdata(
            attr.value.ok_or_else(|| Error::BadDwarf("implicit const without value".to_string()))?,
        ),

        Form::DW_FORM_string => AttrValue::Str(s.read_string()?),
        Form::DW_FORM_strp => {
            let offset = s.read_uint(unit.dwarf_len)?;
            let strings = sections
                .strings
                .as_ref()
                .ok_or_else(|| Error::BadDwarf("strp without .debug_str".to_string()))?;
            AttrValue::Str(strings.read_string_at(offset)?)
        }
        Form::DW_FORM_line_strp => {
            let offset = s.read_uint(unit.dwarf_len)?;
            let strings = sections
                .line_strings
                .as_ref()
                .ok_or_else(|| Error::BadDwarf("line_strp without .debug_line_str".to_string()))?;
            AttrValue::Str(strings.read_string_at(offset)?)
        }
        Form::DW_FORM_strx => AttrValue::StrIndex(decode_u64(s)?),
        Form::DW_FORM_strx1 => AttrValue::StrIndex(s.read_uint(1)?),
        Form::DW_FORM_strx2 => AttrValue::StrIndex(s.read_uint(2)?),
        Form::DW_FORM_strx3 => AttrValue::StrIndex(read_u24(s)?),
        Form::DW_FORM_strx4 => AttrValue::StrIndex(s.read_uint(4)?),

        Form::DW_FORM_ref1 => AttrValue::Ref(unit.offset + s.read_uint(1)?),
        Form::DW_FORM_ref2 => AttrValue::Ref(unit.offset + s.read_uint(2)?),
        Form::DW_FORM_ref4 => AttrValue::Ref(unit.offset + s.read_uint(4)?),
        Form::DW_FORM_ref8 => AttrValue::Ref(unit.offset + s.read_xword()?),
        Form::DW_FORM_ref_udata => AttrValue::Ref(unit.offset + decode_u64(s)?),
        Form::DW_FORM_ref_addr => AttrValue::Ref(s.read_uint(unit.dwarf_len)?),
        Form::DW_FORM_ref_sig8 => AttrValue::Udata(s.read_xword()?),

        Form::DW_FORM_sec_offset => AttrValue::SecOffset(s.read_uint(unit.dwarf_len)?),
        Form::DW_FORM_loclistx => AttrValue::LocListIndex(decode_u64(s)?),
        Form::DW_FORM_rnglistx => AttrValue::RangeListIndex(decode_u64(s)?),

        Form::DW_FORM_flag => AttrValue::Flag(s.read_byte()? != 0),
        Form::DW_FORM_flag_present => AttrValue::Flag(true),

        Form::DW_FORM_block1 => {
            let len = s.read_uint(1)? as usize;
            AttrValue::Block(s.read_bytes(len)?)
        }
        Form::DW_FORM_block2 => {
            let len = s.read_uint(2)? as usize;
            AttrValue::Block(s.read_bytes(len)?)
        }
        Form::DW_FORM_block4 => {
            let len = s.read_uint(4)? as usize;
            AttrValue::Block(s.read_bytes(len)?)
        }
        Form::DW_FORM_block | Form::DW_FORM_exprloc => {
            let len = decode_u64(s)? as usize;
            AttrValue::Block(s.read_bytes(len)?)
        }

        Form::DW_FORM_indirect => {
            let actual = Form::from_u64(decode_u64(s)?)?;
            if actual == Form::DW_FORM_indirect {
                return Err(Error::BadDwarf("nested indirect form".to_string()));
            }
            read_form(s, unit, actual, attr)?
        }
    };
    Ok(value)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainsAddr {
    Yes,
    No,

    /// The entry carries no address information either way.
    Unknown,
}

/// A reference to a debug-info entry. The empty DIE has no unit, a zero
/// offset, and no raw entry.
#[derive(Clone)]
pub struct Die {
    pub unit: Option<Rc<Unit>>,
    pub offset: u64,
    pub raw: Option<Rc<RawDie>>,
}

impl Die {
    pub fn empty() -> Die {
        Die { unit: None, offset: 0, raw: None }
    }

    pub fn valid(&self) -> bool {
        self.raw.is_some()
    }

    pub fn tag(&self) -> Option<Tag> {
        self.raw.as_ref().map(|raw| raw.abbrev.tag)
    }

    /// The entry's value for `name`, with indexed address and string forms
    /// resolved through the unit's base offsets.
    pub fn attribute(&self, name: AttributeName) -> Option<AttrValue> {
        let raw = self.raw.as_ref()?;
        let (index, _) = raw.abbrev.find_attr(name)?;
        let value = raw.values.get(index)?.clone();
        match value {
            AttrValue::AddrIndex(i) => self.unit.as_ref()?.addr_from_index(i),
            AttrValue::StrIndex(i) => self.unit.as_ref()?.string_from_index(i),
            other => Some(other),
        }
    }

    /// The entry's name, following specification and abstract-origin links
    /// when the entry itself is anonymous.
    pub fn name(&self) -> Option<String> {
        if let Some(AttrValue::Str(name)) = self.attribute(AttributeName::DW_AT_name) {
            return Some(name);
        }
        for link in [AttributeName::DW_AT_specification, AttributeName::DW_AT_abstract_origin] {
            if let Some(AttrValue::Ref(offset)) = self.attribute(link) {
                if offset == self.offset {
                    continue; // a self-referential link would never terminate
                }
                let unit = self.unit.as_ref()?;
                let target = unit.offset_to_die(&Die::empty(), offset);
                if let Some(name) = target.name() {
                    return Some(name);
                }
            }
        }
        None
    }

    /// Whether the entry's code ranges cover `addr`.
    pub fn contains_address(&self, addr: u64) -> ContainsAddr {
        let Some(unit) = self.unit.as_ref() else { return ContainsAddr::Unknown };
        if !self.valid() {
            return ContainsAddr::Unknown;
        }

        let low = match self.attribute(AttributeName::DW_AT_low_pc) {
            Some(AttrValue::Addr(low)) => Some(low),
            _ => None,
        };

        match self.attribute(AttributeName::DW_AT_ranges) {
            Some(AttrValue::SecOffset(offset)) => {
                let base = low.unwrap_or(0);
                return match unit.ranges_at(offset, base) {
                    Some(ranges) => {
                        if ranges.iter().any(|&(start, end)| start <= addr && addr < end) {
                            ContainsAddr::Yes
                        } else {
                            ContainsAddr::No
                        }
                    }
                    None => ContainsAddr::Unknown,
                };
            }
            Some(AttrValue::RangeListIndex(index)) => {
                let base = low.unwrap_or(0);
                return match super::resolve_rnglistx(unit, index)
                    .and_then(|offset| unit.ranges_at(offset, base))
                {
                    Some(ranges) => {
                        if ranges.iter().any(|&(start, end)| start <= addr && addr < end) {
                            ContainsAddr::Yes
                        } else {
                            ContainsAddr::No
                        }
                    }
                    None => ContainsAddr::Unknown,
                };
            }
            _ => {}
        }

        let low = match low {
            Some(low) => low,
            None => return ContainsAddr::Unknown,
        };
        let high = match self.attribute(AttributeName::DW_AT_high_pc) {
            // Address class: an absolute end. Constant class: a size.
            Some(AttrValue::Addr(high)) => high,
            Some(AttrValue::Udata(size)) => low + size,
            Some(AttrValue::Sdata(size)) => low.wrapping_add(size as u64),
            _ => return ContainsAddr::Unknown,
        };
        if low <= addr && addr < high { ContainsAddr::Yes } else { ContainsAddr::No }
    }

    /// Iterate the entry's direct children.
    pub fn children(&self) -> DieChildren {
        let first = match (&self.unit, &self.raw) {
            (Some(_), Some(raw)) if raw.abbrev.has_children => Some(raw.next_offset),
            _ => None,
        };
        DieChildren { parent: self.clone(), next: first }
    }

    /// The section offset just past this entry and its whole subtree.
    fn subtree_end(&self) -> Option<u64> {
        let raw = self.raw.as_ref()?;
        if let Some(AttrValue::Ref(sibling)) = self.attribute(AttributeName::DW_AT_sibling) {
            return Some(sibling);
        }
        if !raw.abbrev.has_children {
            return Some(raw.next_offset);
        }
        let unit = self.unit.as_ref()?;
        let mut offset = raw.next_offset;
        loop {
            let child = unit.offset_to_die(self, offset);
            match child.raw {
                // The null entry terminating the children is a single zero
                // byte.
                None => return Some(offset + 1),
                Some(_) => offset = child.subtree_end()?,
            }
        }
    }
}

pub struct DieChildren {
    parent: Die,
    next: Option<u64>,
}

impl Iterator for DieChildren {
    type Item = Die;

    fn next(&mut self) -> Option<Die> {
        let offset = self.next?;
        let unit = self.parent.unit.as_ref()?;
        let child = unit.offset_to_die(&self.parent, offset);
        if !child.valid() {
            self.next = None;
            return None;
        }
        // A sibling link pointing backwards would loop forever.
        self.next = child.subtree_end().filter(|&end| end > offset);
        Some(child)
    }
}
