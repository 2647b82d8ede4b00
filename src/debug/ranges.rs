//! Non-contiguous code ranges. DWARF 4 keeps them in .debug_ranges as
//! address pairs; DWARF 5 moved to the bytecoded .debug_rnglists.
use super::{decode_u64, AttrValue, AttributeName, DebugSections, Unit};
use crate::elf::{ByteReader, Layout, Stream};
use crate::error::{Error, Result};
use log::warn;
use std::rc::Rc;

/// Decode the range list at `offset` into absolute `[start, end)` pairs.
/// `base` is the unit's base address (normally the root's low_pc).
pub fn read_ranges(
    sections: &DebugSections,
    unit: &Unit,
    offset: u64,
    base: u64,
) -> Result<Vec<(u64, u64)>> {
    if unit.version >= 5 {
        let rnglists = sections
            .rnglists
            .as_ref()
            .ok_or_else(|| Error::BadDwarf("no .debug_rnglists section".to_string()))?;
        read_rnglists(rnglists.as_ref(), sections, unit, offset, base)
    } else {
        let ranges = sections
            .ranges
            .as_ref()
            .ok_or_else(|| Error::BadDwarf("no .debug_ranges section".to_string()))?;
        read_ranges_v4(ranges.as_ref(), sections.layout, unit.addr_len, offset, base)
    }
}

fn read_ranges_v4(
    reader: &dyn ByteReader,
    layout: Layout,
    addr_len: u8,
    offset: u64,
    mut base: u64,
) -> Result<Vec<(u64, u64)>> {
    let mut s = Stream::new(reader, layout, offset);
    let max = if addr_len == 8 { u64::MAX } else { 0xffffffff };
    let mut ranges = Vec::new();
    loop {
        let start = s.read_uint(addr_len)?;
        let end = s.read_uint(addr_len)?;
        if start == 0 && end == 0 {
            break;
        }
        if start == max {
            // A base address selection entry.
            base = end;
            continue;
        }
        ranges.push((base + start, base + end));
    }
    Ok(ranges)
}

fn read_rnglists(
    reader: &dyn ByteReader,
    sections: &DebugSections,
    unit: &Unit,
    offset: u64,
    mut base: u64,
) -> Result<Vec<(u64, u64)>> {
    let mut s = Stream::new(reader, sections.layout, offset);
    let mut ranges = Vec::new();
    loop {
        let kind = s.read_byte()?;
        match kind {
            0 => break, // DW_RLE_end_of_list
            1 => {
                // DW_RLE_base_addressx: needs .debug_addr, which split
                // units may lack. Best effort.
                let index = decode_u64(&mut s)?;
                match read_addr_entry(sections, unit, index) {
                    Some(addr) => base = addr,
                    None => warn!("base address index {index} is unresolvable"),
                }
            }
            2 => {
                // DW_RLE_startx_endx
                let start = decode_u64(&mut s)?;
                let end = decode_u64(&mut s)?;
                if let (Some(start), Some(end)) =
                    (read_addr_entry(sections, unit, start), read_addr_entry(sections, unit, end))
                {
                    ranges.push((start, end));
                }
            }
            3 => {
                // DW_RLE_startx_length
                let start = decode_u64(&mut s)?;
                let length = decode_u64(&mut s)?;
                if let Some(start) = read_addr_entry(sections, unit, start) {
                    ranges.push((start, start + length));
                }
            }
            4 => {
                // DW_RLE_offset_pair
                let start = decode_u64(&mut s)?;
                let end = decode_u64(&mut s)?;
                ranges.push((base + start, base + end));
            }
            5 => base = s.read_uint(unit.addr_len)?, // DW_RLE_base_address
            6 => {
                // DW_RLE_start_end
                let start = s.read_uint(unit.addr_len)?;
                let end = s.read_uint(unit.addr_len)?;
                ranges.push((start, end));
            }
            7 => {
                // DW_RLE_start_length
                let start = s.read_uint(unit.addr_len)?;
                let length = decode_u64(&mut s)?;
                ranges.push((start, start + length));
            }
            n => return Err(Error::BadDwarf(format!("unknown range list entry kind: {n}"))),
        }
    }
    Ok(ranges)
}

fn read_addr_entry(sections: &DebugSections, unit: &Unit, index: u64) -> Option<u64> {
    let addr = sections.addr.as_ref()?;
    let base = if unit.dwarf_len == 8 { 16 } else { 8 };
    let mut s = Stream::new(addr.as_ref(), sections.layout, base + index * unit.addr_len as u64);
    s.read_uint(unit.addr_len).ok()
}

/// Turn a DW_FORM_rnglistx index into a .debug_rnglists offset via the
/// unit's offsets table.
pub fn resolve_rnglistx(unit: &Rc<Unit>, index: u64) -> Option<u64> {
    let rnglists = unit.sections.rnglists.as_ref()?;
    let base = match unit.root().attribute(AttributeName::DW_AT_rnglists_base) {
        Some(AttrValue::SecOffset(base)) => base,
        // Just past the header: initial length, version, address size,
        // segment selector size, offset entry count.
        _ => {
            if unit.dwarf_len == 8 {
                20
            } else {
                12
            }
        }
    };
    let mut s =
        Stream::new(rnglists.as_ref(), unit.sections.layout, base + index * unit.dwarf_len as u64);
    match s.read_uint(unit.dwarf_len) {
        Ok(offset) => Some(base + offset),
        Err(err) => {
            warn!("failed to resolve range list index {index}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::MemReader;

    const LE64: Layout = Layout { little_endian: true, sixty_four_bit: true };

    #[test]
    fn v4_pairs_and_base_selection() {
        let mut bytes = Vec::new();
        for value in [0x10u64, 0x20, u64::MAX, 0x400000, 0x10, 0x20, 0, 0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let reader = MemReader::new("ranges", bytes);
        let ranges = read_ranges_v4(&reader, LE64, 8, 0, 0x1000).unwrap();
        assert_eq!(ranges, vec![(0x1010, 0x1020), (0x400010, 0x400020)]);
    }

    #[test]
    fn v4_truncated_list_is_fatal() {
        let mut bytes = Vec::new();
        for value in [0x10u64, 0x20] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let reader = MemReader::new("ranges", bytes);
        assert!(read_ranges_v4(&reader, LE64, 8, 0, 0).is_err());
    }
}
