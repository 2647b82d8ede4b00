//! The line number program: a bytecoded state machine in .debug_line whose
//! output is a matrix of (address, file, line) rows. See chapter 6.2 of the
//! DWARF spec; versions 2 through 4 differ only in details, version 5
//! restructured the directory and file tables.
use super::{decode_i64, decode_u64, DebugSections, Unit};
use crate::elf::Stream;
use crate::error::{Error, Result};
use log::warn;

pub struct FileEntry {
    pub name: String,

    /// Index into [`LineProgram::directories`].
    pub dir_index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineRow {
    pub addr: u64,

    /// Index into [`LineProgram::files`].
    pub file: usize,
    pub line: u32,
    pub column: u16,
    pub is_stmt: bool,

    /// The first address past a contiguous run; rows flagged with this
    /// carry no source position.
    pub end_sequence: bool,
}

pub struct LineProgram {
    pub version: u16,
    pub directories: Vec<String>,
    pub files: Vec<FileEntry>,
    pub matrix: Vec<LineRow>,
}

// Standard opcodes, section 6.2.5.2.
const DW_LNS_COPY: u8 = 1;
const DW_LNS_ADVANCE_PC: u8 = 2;
const DW_LNS_ADVANCE_LINE: u8 = 3;
const DW_LNS_SET_FILE: u8 = 4;
const DW_LNS_SET_COLUMN: u8 = 5;
const DW_LNS_NEGATE_STMT: u8 = 6;
const DW_LNS_BASIC_BLOCK: u8 = 7;
const DW_LNS_CONST_ADD_PC: u8 = 8;
const DW_LNS_FIXED_ADVANCE_PC: u8 = 9;
const DW_LNS_SET_PROLOGUE_END: u8 = 10;
const DW_LNS_SET_EPILOGUE_BEGIN: u8 = 11;
const DW_LNS_SET_ISA: u8 = 12;

// Extended opcodes, section 6.2.5.3.
const DW_LNE_END_SEQUENCE: u8 = 1;
const DW_LNE_SET_ADDRESS: u8 = 2;
const DW_LNE_DEFINE_FILE: u8 = 3;
const DW_LNE_SET_DISCRIMINATOR: u8 = 4;

// Content types for the version 5 entry formats, section 6.2.4.1.
const DW_LNCT_PATH: u64 = 1;
const DW_LNCT_DIRECTORY_INDEX: u64 = 2;

struct Header {
    program_end: u64,
    program_start: u64,
    min_inst_length: u8,
    default_is_stmt: bool,
    line_base: i8,
    line_range: u8,
    opcode_base: u8,
    std_opcode_lengths: Vec<u8>,
}

impl LineProgram {
    pub fn new(sections: &DebugSections, offset: u64, unit: &Unit) -> Result<Self> {
        let line = sections
            .line
            .as_ref()
            .ok_or_else(|| Error::BadDwarf("no .debug_line section".to_string()))?;
        let mut s = Stream::new(line.as_ref(), sections.layout, offset);

        let word = s.read_word()?;
        let (dwarf_len, unit_length) =
            if word == 0xffffffff { (8u8, s.read_xword()?) } else { (4u8, word as u64) };
        let program_end = s.offset + unit_length;

        let version = s.read_half()?;
        if !(2..=5).contains(&version) {
            return Err(Error::BadDwarf(format!("bad .debug_line version: {version}")));
        }
        if version >= 5 {
            let _address_size = s.read_byte()?;
            let _segment_selector_size = s.read_byte()?;
        }

        let header_length = s.read_uint(dwarf_len)?;
        let program_start = s.offset + header_length;

        let min_inst_length = s.read_byte()?;
        if version >= 4 {
            let max_ops = s.read_byte()?;
            if max_ops != 1 {
                // VLIW targets; the special-opcode arithmetic below would
                // need the op_index register.
                warn!("unsupported maximum_operations_per_instruction: {max_ops}");
            }
        }
        let default_is_stmt = s.read_byte()? != 0;
        let line_base = s.read_byte()? as i8;
        let line_range = s.read_byte()?;
        if line_range == 0 {
            return Err(Error::BadDwarf("line_range of zero".to_string()));
        }
        let opcode_base = s.read_byte()?;
        let mut std_opcode_lengths = Vec::new();
        for _ in 1..opcode_base {
            std_opcode_lengths.push(s.read_byte()?);
        }

        let (directories, files) = if version >= 5 {
            read_tables_v5(&mut s, sections, dwarf_len)?
        } else {
            read_tables_v2(&mut s)?
        };

        let header = Header {
            program_end,
            program_start,
            min_inst_length,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            std_opcode_lengths,
        };
        let mut program = LineProgram { version, directories, files, matrix: Vec::new() };
        program.run(&mut s, &header, unit)?;
        Ok(program)
    }

    /// Interpret the opcodes, appending a matrix row for every copy/special
    /// opcode and every end of sequence.
    fn run(&mut self, s: &mut Stream, header: &Header, unit: &Unit) -> Result<()> {
        s.offset = header.program_start;

        let mut addr: u64 = 0;
        let mut file: usize = 1;
        let mut line: i64 = 1;
        let mut column: u16 = 0;
        let mut is_stmt = header.default_is_stmt;

        while s.offset < header.program_end {
            let opcode = s.read_byte()?;
            if opcode >= header.opcode_base {
                let adjusted = opcode - header.opcode_base;
                addr += (adjusted / header.line_range) as u64 * header.min_inst_length as u64;
                line += header.line_base as i64 + (adjusted % header.line_range) as i64;
                self.push_row(addr, file, line, column, is_stmt, false);
            } else if opcode == 0 {
                let length = decode_u64(s)?;
                let next = s.offset + length;
                let sub_opcode = s.read_byte()?;
                match sub_opcode {
                    DW_LNE_END_SEQUENCE => {
                        self.push_row(addr, file, line, column, is_stmt, true);
                        addr = 0;
                        file = 1;
                        line = 1;
                        column = 0;
                        is_stmt = header.default_is_stmt;
                    }
                    DW_LNE_SET_ADDRESS => addr = s.read_uint(unit.addr_len)?,
                    DW_LNE_DEFINE_FILE => {
                        let name = s.read_string()?;
                        let dir_index = decode_u64(s)? as usize;
                        let _mtime = decode_u64(s)?;
                        let _size = decode_u64(s)?;
                        self.files.push(FileEntry { name, dir_index });
                    }
                    DW_LNE_SET_DISCRIMINATOR => {
                        let _discriminator = decode_u64(s)?;
                    }
                    n => warn!("skipping unknown extended line opcode {n}"),
                }
                s.offset = next;
            } else {
                match opcode {
                    DW_LNS_COPY => self.push_row(addr, file, line, column, is_stmt, false),
                    DW_LNS_ADVANCE_PC => {
                        addr += decode_u64(s)? * header.min_inst_length as u64;
                    }
                    DW_LNS_ADVANCE_LINE => line += decode_i64(s)?,
                    DW_LNS_SET_FILE => file = decode_u64(s)? as usize,
                    DW_LNS_SET_COLUMN => column = decode_u64(s)? as u16,
                    DW_LNS_NEGATE_STMT => is_stmt = !is_stmt,
                    DW_LNS_BASIC_BLOCK => (),
                    DW_LNS_CONST_ADD_PC => {
                        let adjusted = 255 - header.opcode_base;
                        addr +=
                            (adjusted / header.line_range) as u64 * header.min_inst_length as u64;
                    }
                    DW_LNS_FIXED_ADVANCE_PC => addr += s.read_half()? as u64,
                    DW_LNS_SET_PROLOGUE_END | DW_LNS_SET_EPILOGUE_BEGIN => (),
                    DW_LNS_SET_ISA => {
                        let _isa = decode_u64(s)?;
                    }
                    n => {
                        // A vendor opcode: the header tells us how many
                        // LEB128 operands to discard.
                        let args = header.std_opcode_lengths.get(n as usize - 1).copied().unwrap_or(0);
                        for _ in 0..args {
                            decode_u64(s)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn push_row(&mut self, addr: u64, file: usize, line: i64, column: u16, is_stmt: bool, end_sequence: bool) {
        self.matrix.push(LineRow {
            addr,
            file,
            line: line.clamp(0, u32::MAX as i64) as u32,
            column,
            is_stmt,
            end_sequence,
        });
    }
}

/// The version 2 to 4 tables: null-terminated lists. File and directory
/// numbering is 1-based, with slot 0 reserved for the compilation unit
/// itself, so both vectors get a placeholder entry.
fn read_tables_v2(s: &mut Stream) -> Result<(Vec<String>, Vec<FileEntry>)> {
    let mut directories = vec![String::new()];
    loop {
        let dir = s.read_string()?;
        if dir.is_empty() {
            break;
        }
        directories.push(dir);
    }

    let mut files = vec![FileEntry { name: String::new(), dir_index: 0 }];
    loop {
        let name = s.read_string()?;
        if name.is_empty() {
            break;
        }
        let dir_index = decode_u64(s)? as usize;
        let _mtime = decode_u64(s)?;
        let _size = decode_u64(s)?;
        files.push(FileEntry { name, dir_index });
    }
    Ok((directories, files))
}

/// The version 5 tables: each prefixed by a format description saying which
/// fields are present and how they are encoded. Numbering is 0-based.
fn read_tables_v5(
    s: &mut Stream,
    sections: &DebugSections,
    dwarf_len: u8,
) -> Result<(Vec<String>, Vec<FileEntry>)> {
    let dir_formats = read_formats(s)?;
    let dir_count = decode_u64(s)?;
    let mut directories = Vec::new();
    for _ in 0..dir_count {
        let mut path = String::new();
        for &(content, form) in &dir_formats {
            match read_table_value(s, sections, dwarf_len, form)? {
                TableValue::Str(value) if content == DW_LNCT_PATH => path = value,
                _ => (),
            }
        }
        directories.push(path);
    }

    let file_formats = read_formats(s)?;
    let file_count = decode_u64(s)?;
    let mut files = Vec::new();
    for _ in 0..file_count {
        let mut name = String::new();
        let mut dir_index = 0usize;
        for &(content, form) in &file_formats {
            match read_table_value(s, sections, dwarf_len, form)? {
                TableValue::Str(value) if content == DW_LNCT_PATH => name = value,
                TableValue::Udata(value) if content == DW_LNCT_DIRECTORY_INDEX => {
                    dir_index = value as usize
                }
                _ => (),
            }
        }
        files.push(FileEntry { name, dir_index });
    }
    Ok((directories, files))
}

fn read_formats(s: &mut Stream) -> Result<Vec<(u64, u64)>> {
    let count = s.read_byte()?;
    let mut formats = Vec::new();
    for _ in 0..count {
        let content = decode_u64(s)?;
        let form = decode_u64(s)?;
        formats.push((content, form));
    }
    Ok(formats)
}

enum TableValue {
    Str(String),
    Udata(u64),
    Skipped,
}

/// The restricted form vocabulary the line table headers use.
fn read_table_value(
    s: &mut Stream,
    sections: &DebugSections,
    dwarf_len: u8,
    form: u64,
) -> Result<TableValue> {
    match form {
        0x08 => Ok(TableValue::Str(s.read_string()?)), // string
        0x0e => {
            // strp
            let offset = s.read_uint(dwarf_len)?;
            let strings = sections
                .strings
                .as_ref()
                .ok_or_else(|| Error::BadDwarf("strp without .debug_str".to_string()))?;
            Ok(TableValue::Str(strings.read_string_at(offset)?))
        }
        0x1f => {
            // line_strp
            let offset = s.read_uint(dwarf_len)?;
            let strings = sections
                .line_strings
                .as_ref()
                .ok_or_else(|| Error::BadDwarf("line_strp without .debug_line_str".to_string()))?;
            Ok(TableValue::Str(strings.read_string_at(offset)?))
        }
        0x0b => Ok(TableValue::Udata(s.read_uint(1)?)),  // data1
        0x05 => Ok(TableValue::Udata(s.read_uint(2)?)),  // data2
        0x06 => Ok(TableValue::Udata(s.read_uint(4)?)),  // data4
        0x07 => Ok(TableValue::Udata(s.read_xword()?)),  // data8
        0x0f => Ok(TableValue::Udata(decode_u64(s)?)),   // udata
        0x1e => {
            // data16, md5 checksums
            s.skip(16);
            Ok(TableValue::Skipped)
        }
        0x09 => {
            // block
            let len = decode_u64(s)?;
            s.skip(len);
            Ok(TableValue::Skipped)
        }
        n => Err(Error::BadDwarf(format!("unsupported form {n:#x} in line table header"))),
    }
}
