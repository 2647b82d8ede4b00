//! Preprocessor macro tables. DWARF 4 keeps them in .debug_macinfo; DWARF 5
//! (and the GNU extension that preceded it) uses .debug_macro, which adds a
//! header and indirect string forms.
use super::{decode_u64, DebugSections};
use crate::elf::Stream;
use crate::error::{Error, Result};
use log::warn;

pub enum MacroEntry {
    Define { line: u64, text: String },
    Undef { line: u64, text: String },
    StartFile { line: u64, file: u64 },
    EndFile,
}

pub struct Macros {
    /// 4 for the macinfo flavor, 5 for the macro flavor.
    pub version: u16,
    pub debug_line_offset: Option<u64>,
    pub entries: Vec<MacroEntry>,
}

impl Macros {
    pub fn new(sections: &DebugSections, offset: u64, version: u16) -> Result<Self> {
        if version >= 5 {
            Macros::new_v5(sections, offset)
        } else {
            Macros::new_v4(sections, offset)
        }
    }

    fn new_v4(sections: &DebugSections, offset: u64) -> Result<Self> {
        let macinfo = sections
            .macinfo
            .as_ref()
            .ok_or_else(|| Error::BadDwarf("no .debug_macinfo section".to_string()))?;
        let mut s = Stream::new(macinfo.as_ref(), sections.layout, offset);
        let mut entries = Vec::new();
        loop {
            match s.read_byte()? {
                0 => break,
                1 => {
                    let line = decode_u64(&mut s)?;
                    let text = s.read_string()?;
                    entries.push(MacroEntry::Define { line, text });
                }
                2 => {
                    let line = decode_u64(&mut s)?;
                    let text = s.read_string()?;
                    entries.push(MacroEntry::Undef { line, text });
                }
                3 => {
                    let line = decode_u64(&mut s)?;
                    let file = decode_u64(&mut s)?;
                    entries.push(MacroEntry::StartFile { line, file });
                }
                4 => entries.push(MacroEntry::EndFile),
                n => return Err(Error::BadDwarf(format!("unknown macinfo entry type: {n}"))),
            }
        }
        Ok(Macros { version: 4, debug_line_offset: None, entries })
    }

    fn new_v5(sections: &DebugSections, offset: u64) -> Result<Self> {
        let section = sections
            .macros
            .as_ref()
            .ok_or_else(|| Error::BadDwarf("no .debug_macro section".to_string()))?;
        let mut s = Stream::new(section.as_ref(), sections.layout, offset);

        let version = s.read_half()?;
        let flags = s.read_byte()?;
        let offset_size: u8 = if flags & 0x1 != 0 { 8 } else { 4 };
        let debug_line_offset =
            if flags & 0x2 != 0 { Some(s.read_uint(offset_size)?) } else { None };

        let mut entries = Vec::new();
        loop {
            let opcode = s.read_byte()?;
            match opcode {
                0 => break,
                1 => {
                    let line = decode_u64(&mut s)?;
                    let text = s.read_string()?;
                    entries.push(MacroEntry::Define { line, text });
                }
                2 => {
                    let line = decode_u64(&mut s)?;
                    let text = s.read_string()?;
                    entries.push(MacroEntry::Undef { line, text });
                }
                3 => {
                    let line = decode_u64(&mut s)?;
                    let file = decode_u64(&mut s)?;
                    entries.push(MacroEntry::StartFile { line, file });
                }
                4 => entries.push(MacroEntry::EndFile),
                5 | 6 => {
                    // define_strp / undef_strp
                    let line = decode_u64(&mut s)?;
                    let str_offset = s.read_uint(offset_size)?;
                    let strings = sections
                        .strings
                        .as_ref()
                        .ok_or_else(|| Error::BadDwarf("macro strp without .debug_str".to_string()))?;
                    let text = strings.read_string_at(str_offset)?;
                    if opcode == 5 {
                        entries.push(MacroEntry::Define { line, text });
                    } else {
                        entries.push(MacroEntry::Undef { line, text });
                    }
                }
                7 => {
                    // import: a transparent include of another table. We
                    // record nothing for it.
                    let _target = s.read_uint(offset_size)?;
                }
                n => {
                    warn!("stopping at unknown macro entry type {n}");
                    break;
                }
            }
        }
        Ok(Macros { version, debug_line_offset, entries })
    }

    pub fn definitions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            MacroEntry::Define { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macinfo_entries() {
        let object = crate::testimage::ImageBuilder::exec()
            .section(".debug_info", vec![0u8; 4])
            .section(
                ".debug_macinfo",
                [
                    &[3u8][..],                       // start_file
                    &[0, 1],                          // line 0, file 1
                    &[1, 4],                          // define at line 4
                    b"PI 3\0",
                    &[2, 9],                          // undef at line 9
                    b"PI\0",
                    &[4],                             // end_file
                    &[0],                             // terminator
                ]
                .concat(),
            )
            .build_object();
        let info = crate::debug::DwarfInfo::new(object).unwrap();
        let macros = Macros::new(&info.sections, 0, 4).unwrap();
        assert_eq!(macros.entries.len(), 4);
        assert_eq!(macros.definitions().collect::<Vec<_>>(), vec!["PI 3"]);
    }
}
