//! Support for the debugging info encoded into ELF files, nearly all of it
//! in the executables rather than the core. The info lives in ".debug_FOO"
//! sections, e.g. ".debug_info", ".debug_abbrev", holding DWARF data as
//! documented in https://dwarfstd.org/doc/DWARF5.pdf. The readelf sources
//! at https://github.com/bminor/binutils-gdb/tree/master/binutils are also
//! a useful reference.
use crate::elf::Stream;
use crate::error::{Error, Result};

pub mod abbrev;
pub mod die;
pub mod info;
pub mod line;
pub mod macros;
pub mod ranges;
pub mod symbols;
pub mod unit;

pub use abbrev::*;
pub use die::*;
pub use info::*;
pub use line::*;
pub use macros::*;
pub use ranges::*;
pub use symbols::*;
pub use unit::*;

#[allow(non_camel_case_types)] // figure 18
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    //                            value
    DW_TAG_array_type,         // 0x01
    DW_TAG_class_type,         // 0x02
    DW_TAG_enumeration_type,   // 0x04
    DW_TAG_formal_parameter,   // 0x05
    DW_TAG_lexical_block,      // 0x0b
    DW_TAG_member,             // 0x0d
    DW_TAG_pointer_type,       // 0x0f
    DW_TAG_compile_unit,       // 0x11
    DW_TAG_structure_type,     // 0x13
    DW_TAG_subroutine_type,    // 0x15
    DW_TAG_typedef,            // 0x16
    DW_TAG_union_type,         // 0x17
    DW_TAG_inlined_subroutine, // 0x1d
    DW_TAG_subrange_type,      // 0x21
    DW_TAG_base_type,          // 0x24
    DW_TAG_const_type,         // 0x26
    DW_TAG_enumerator,         // 0x28
    DW_TAG_subprogram,         // 0x2e
    DW_TAG_variable,           // 0x34
    DW_TAG_namespace,          // 0x39
    DW_TAG_unspecified_type,   // 0x3b
    DW_TAG_partial_unit,       // 0x3c
    DW_TAG_type_unit,          // 0x41
    DW_TAG_skeleton_unit,      // 0x4a

    /// A tag we carry but have no behavior for.
    DW_TAG_other(u64),
}

impl Tag {
    pub fn from_u64(value: u64) -> Self {
        match value {
            0x01 => Tag::DW_TAG_array_type,
            0x02 => Tag::DW_TAG_class_type,
            0x04 => Tag::DW_TAG_enumeration_type,
            0x05 => Tag::DW_TAG_formal_parameter,
            0x0b => Tag::DW_TAG_lexical_block,
            0x0d => Tag::DW_TAG_member,
            0x0f => Tag::DW_TAG_pointer_type,
            0x11 => Tag::DW_TAG_compile_unit,
            0x13 => Tag::DW_TAG_structure_type,
            0x15 => Tag::DW_TAG_subroutine_type,
            0x16 => Tag::DW_TAG_typedef,
            0x17 => Tag::DW_TAG_union_type,
            0x1d => Tag::DW_TAG_inlined_subroutine,
            0x21 => Tag::DW_TAG_subrange_type,
            0x24 => Tag::DW_TAG_base_type,
            0x26 => Tag::DW_TAG_const_type,
            0x28 => Tag::DW_TAG_enumerator,
            0x2e => Tag::DW_TAG_subprogram,
            0x34 => Tag::DW_TAG_variable,
            0x39 => Tag::DW_TAG_namespace,
            0x3b => Tag::DW_TAG_unspecified_type,
            0x3c => Tag::DW_TAG_partial_unit,
            0x41 => Tag::DW_TAG_type_unit,
            0x4a => Tag::DW_TAG_skeleton_unit,
            n => Tag::DW_TAG_other(n),
        }
    }
}

#[allow(non_camel_case_types)] // figure 20
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeName {
    //                         value & class
    DW_AT_sibling,          // 0x01 reference
    DW_AT_name,             // 0x03 string
    DW_AT_stmt_list,        // 0x10 lineptr
    DW_AT_low_pc,           // 0x11 address
    DW_AT_high_pc,          // 0x12 address, constant
    DW_AT_language,         // 0x13 constant
    DW_AT_comp_dir,         // 0x1b string
    DW_AT_producer,         // 0x25 string
    DW_AT_abstract_origin,  // 0x31 reference
    DW_AT_macro_info,       // 0x43 macptr
    DW_AT_specification,    // 0x47 reference
    DW_AT_type,             // 0x49 reference
    DW_AT_entry_pc,         // 0x52 address
    DW_AT_ranges,           // 0x55 rangelistptr
    DW_AT_call_file,        // 0x58 constant
    DW_AT_call_line,        // 0x59 constant
    DW_AT_linkage_name,     // 0x6e string
    DW_AT_str_offsets_base, // 0x72 stroffsetsptr
    DW_AT_addr_base,        // 0x73 addrptr
    DW_AT_rnglists_base,    // 0x74 rnglistsptr
    DW_AT_macros,           // 0x79 macptr
    DW_AT_GNU_macros,       // 0x2119 macptr, see https://sourceware.org/elfutils/DwarfExtensions
    DW_AT_other(u64),
}

impl AttributeName {
    pub fn from_u64(value: u64) -> Self {
        match value {
            0x01 => AttributeName::DW_AT_sibling,
            0x03 => AttributeName::DW_AT_name,
            0x10 => AttributeName::DW_AT_stmt_list,
            0x11 => AttributeName::DW_AT_low_pc,
            0x12 => AttributeName::DW_AT_high_pc,
            0x13 => AttributeName::DW_AT_language,
            0x1b => AttributeName::DW_AT_comp_dir,
            0x25 => AttributeName::DW_AT_producer,
            0x31 => AttributeName::DW_AT_abstract_origin,
            0x43 => AttributeName::DW_AT_macro_info,
            0x47 => AttributeName::DW_AT_specification,
            0x49 => AttributeName::DW_AT_type,
            0x52 => AttributeName::DW_AT_entry_pc,
            0x55 => AttributeName::DW_AT_ranges,
            0x58 => AttributeName::DW_AT_call_file,
            0x59 => AttributeName::DW_AT_call_line,
            0x6e => AttributeName::DW_AT_linkage_name,
            0x72 => AttributeName::DW_AT_str_offsets_base,
            0x73 => AttributeName::DW_AT_addr_base,
            0x74 => AttributeName::DW_AT_rnglists_base,
            0x79 => AttributeName::DW_AT_macros,
            0x2119 => AttributeName::DW_AT_GNU_macros,
            n => AttributeName::DW_AT_other(n),
        }
    }
}

#[allow(non_camel_case_types)] // section 7.5.6
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Form {
    //                        value & class
    DW_FORM_addr,          // 0x01 address
    DW_FORM_block2,        // 0x03 block
    DW_FORM_block4,        // 0x04 block
    DW_FORM_data2,         // 0x05 constant
    DW_FORM_data4,         // 0x06 constant
    DW_FORM_data8,         // 0x07 constant
    DW_FORM_string,        // 0x08 string
    DW_FORM_block,         // 0x09 block
    DW_FORM_block1,        // 0x0a block
    DW_FORM_data1,         // 0x0b constant
    DW_FORM_flag,          // 0x0c flag
    DW_FORM_sdata,         // 0x0d constant
    DW_FORM_strp,          // 0x0e string
    DW_FORM_udata,         // 0x0f constant
    DW_FORM_ref_addr,      // 0x10 reference
    DW_FORM_ref1,          // 0x11 reference
    DW_FORM_ref2,          // 0x12 reference
    DW_FORM_ref4,          // 0x13 reference
    DW_FORM_ref8,          // 0x14 reference
    DW_FORM_ref_udata,     // 0x15 reference
    DW_FORM_indirect,      // 0x16
    DW_FORM_sec_offset,    // 0x17 lineptr, macptr, rnglistptr, ...
    DW_FORM_exprloc,       // 0x18 exprloc
    DW_FORM_flag_present,  // 0x19 flag
    DW_FORM_strx,          // 0x1a string
    DW_FORM_addrx,         // 0x1b address
    DW_FORM_data16,        // 0x1e constant
    DW_FORM_line_strp,     // 0x1f string
    DW_FORM_ref_sig8,      // 0x20 reference
    DW_FORM_implicit_const, // 0x21 constant
    DW_FORM_loclistx,      // 0x22 loclist
    DW_FORM_rnglistx,      // 0x23 rnglist
    DW_FORM_strx1,         // 0x25 string
    DW_FORM_strx2,         // 0x26 string
    DW_FORM_strx3,         // 0x27 string
    DW_FORM_strx4,         // 0x28 string
    DW_FORM_addrx1,        // 0x29 address
    DW_FORM_addrx2,        // 0x2a address
    DW_FORM_addrx3,        // 0x2b address
    DW_FORM_addrx4,        // 0x2c address
}

impl Form {
    pub fn from_u64(value: u64) -> Result<Self> {
        match value {
            0x01 => Ok(Form::DW_FORM_addr),
            0x03 => Ok(Form::DW_FORM_block2),
            0x04 => Ok(Form::DW_FORM_block4),
            0x05 => Ok(Form::DW_FORM_data2),
            0x06 => Ok(Form::DW_FORM_data4),
            0x07 => Ok(Form::DW_FORM_data8),
            0x08 => Ok(Form::DW_FORM_string),
            0x09 => Ok(Form::DW_FORM_block),
            0x0a => Ok(Form::DW_FORM_block1),
            0x0b => Ok(Form::DW_FORM_data1),
            0x0c => Ok(Form::DW_FORM_flag),
            0x0d => Ok(Form::DW_FORM_sdata),
            0x0e => Ok(Form::DW_FORM_strp),
            0x0f => Ok(Form::DW_FORM_udata),
            0x10 => Ok(Form::DW_FORM_ref_addr),
            0x11 => Ok(Form::DW_FORM_ref1),
            0x12 => Ok(Form::DW_FORM_ref2),
            0x13 => Ok(Form::DW_FORM_ref4),
            0x14 => Ok(Form::DW_FORM_ref8),
            0x15 => Ok(Form::DW_FORM_ref_udata),
            0x16 => Ok(Form::DW_FORM_indirect),
            0x17 => Ok(Form::DW_FORM_sec_offset),
            0x18 => Ok(Form::DW_FORM_exprloc),
            0x19 => Ok(Form::DW_FORM_flag_present),
            0x1a => Ok(Form::DW_FORM_strx),
            0x1b => Ok(Form::DW_FORM_addrx),
            0x1e => Ok(Form::DW_FORM_data16),
            0x1f => Ok(Form::DW_FORM_line_strp),
            0x20 => Ok(Form::DW_FORM_ref_sig8),
            0x21 => Ok(Form::DW_FORM_implicit_const),
            0x22 => Ok(Form::DW_FORM_loclistx),
            0x23 => Ok(Form::DW_FORM_rnglistx),
            0x25 => Ok(Form::DW_FORM_strx1),
            0x26 => Ok(Form::DW_FORM_strx2),
            0x27 => Ok(Form::DW_FORM_strx3),
            0x28 => Ok(Form::DW_FORM_strx4),
            0x29 => Ok(Form::DW_FORM_addrx1),
            0x2a => Ok(Form::DW_FORM_addrx2),
            0x2b => Ok(Form::DW_FORM_addrx3),
            0x2c => Ok(Form::DW_FORM_addrx4),
            _ => Err(Error::BadDwarf(format!("unknown form encoding: {value:#x}"))),
        }
    }
}

/// Unit kinds introduced by DWARF 5, section 7.5.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitKind {
    Compile,      // 0x01
    Type,         // 0x02
    Partial,      // 0x03
    Skeleton,     // 0x04
    SplitCompile, // 0x05
    SplitType,    // 0x06
}

impl UnitKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(UnitKind::Compile),
            0x02 => Ok(UnitKind::Type),
            0x03 => Ok(UnitKind::Partial),
            0x04 => Ok(UnitKind::Skeleton),
            0x05 => Ok(UnitKind::SplitCompile),
            0x06 => Ok(UnitKind::SplitType),
            n => Err(Error::BadDwarf(format!("unknown unit kind: {n:#x}"))),
        }
    }
}

/// Unsigned LEB128.
pub fn decode_u64(stream: &mut Stream) -> Result<u64> {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte = stream.read_byte()? as u64;
        result |= (byte & 0x7f) << shift;
        if (byte & 0x80) == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

/// Signed LEB128.
pub fn decode_i64(stream: &mut Stream) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let byte = stream.read_byte()? as i64;
        result |= (byte & 0x7f) << shift;
        shift += 7;
        if (byte & 0x80) == 0 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= -1i64 << shift;
            }
            break;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{Layout, MemReader, Stream};

    const LE64: Layout = Layout { little_endian: true, sixty_four_bit: true };

    #[test]
    fn leb128() {
        let r = MemReader::new("buf", vec![0xe5, 0x8e, 0x26, 0x7f, 0x80, 0x01]);
        let mut s = Stream::new(&r, LE64, 0);
        assert_eq!(decode_u64(&mut s).unwrap(), 624485);
        assert_eq!(decode_i64(&mut s).unwrap(), -1);
        assert_eq!(decode_u64(&mut s).unwrap(), 128);
    }

    #[test]
    fn unknown_unit_kind_is_fatal() {
        assert!(UnitKind::from_u8(0x07).is_err());
        assert!(UnitKind::from_u8(0).is_err());
    }
}
