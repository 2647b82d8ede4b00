//! ELF symbol tables, used to name the function containing a code address
//! when it has one. Debug info can be stripped; the dynamic symbol table
//! almost always survives, so both .symtab and .dynsym are consulted.
use crate::elf::{ElfObject, SectionHeader, SectionKind, Stream};
use crate::error::Result;
use log::warn;

pub struct FuncSymbol {
    pub name: String,

    /// The symbol's address within the object.
    pub value: u64,

    /// Zero if the symbol has no or unknown size.
    pub size: u64,
}

/// The function symbols of one object, sorted by address.
pub struct SymbolTable {
    functions: Vec<FuncSymbol>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum SymbolType {
    None,

    /// A data object, variable, array, etc.
    Object,

    /// Function or other executable code.
    Func,

    /// Another section, a source file, a TLS block: nothing we name
    /// addresses after.
    Other,
}

impl SymbolType {
    pub fn from_u8(info: u8) -> Self {
        // The low nibble of st_info, see
        // https://refspecs.linuxbase.org/elf/gabi4+/ch4.symtab.html
        match info & 0xf {
            0 => SymbolType::None,
            1 => SymbolType::Object,
            2 => SymbolType::Func,
            _ => SymbolType::Other,
        }
    }
}

struct SymbolEntry {
    name_index: u64,
    value: u64,
    size: u64,
    stype: SymbolType,
}

impl SymbolEntry {
    fn new(s: &mut Stream) -> Result<Self> {
        // Field order differs between the two widths.
        if s.layout.sixty_four_bit {
            let name = s.read_word()?;
            let info = s.read_byte()?;
            let _other = s.read_byte()?;
            let _shndx = s.read_half()?;
            let value = s.read_addr()?;
            let size = s.read_xword()?;
            Ok(SymbolEntry {
                name_index: name as u64,
                value,
                size,
                stype: SymbolType::from_u8(info),
            })
        } else {
            let name = s.read_word()?;
            let value = s.read_addr()?;
            let size = s.read_word()? as u64;
            let info = s.read_byte()?;
            let _other = s.read_byte()?;
            let _shndx = s.read_half()?;
            Ok(SymbolEntry {
                name_index: name as u64,
                value,
                size,
                stype: SymbolType::from_u8(info),
            })
        }
    }
}

impl SymbolTable {
    pub fn new(object: &ElfObject) -> SymbolTable {
        let mut functions = Vec::new();
        for section in object.sections() {
            match section.kind {
                SectionKind::SymbolTable | SectionKind::DynamicSymbolTable => {
                    SymbolTable::load_functions(object, section, &mut functions);
                }
                _ => (),
            }
        }
        functions.sort_by_key(|f| f.value);
        functions.dedup_by(|a, b| a.value == b.value && a.name == b.name);
        SymbolTable { functions }
    }

    fn load_functions(object: &ElfObject, section: &SectionHeader, out: &mut Vec<FuncSymbol>) {
        if section.entry_size == 0 || section.link == 0 {
            warn!("symbol table section with no entry size or string table");
            return;
        }
        let strtab = match object.sections().get(section.link as usize - 1) {
            // sections() drops the null entry, shifting indices down one
            Some(h) if h.kind == SectionKind::StringTable => h.clone(),
            _ => {
                warn!("symbol table has no usable string table link");
                return;
            }
        };

        let mut offset = section.offset;
        let end = section.offset + section.size;
        while offset < end {
            let mut s = Stream::new(object.reader.as_ref(), object.layout(), offset);
            match SymbolEntry::new(&mut s) {
                Ok(entry) => {
                    if entry.stype == SymbolType::Func && entry.value != 0 {
                        if let Some(name) = object.string_at(&strtab, entry.name_index) {
                            if !name.is_empty() {
                                out.push(FuncSymbol { name, value: entry.value, size: entry.size });
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!("failed to read symbol at offset {offset}: {err}");
                    break;
                }
            }
            offset += section.entry_size;
        }
    }

    /// The function whose `[value, value + size)` covers `addr`. Symbols
    /// with zero size match as the nearest preceding function.
    pub fn find_function(&self, addr: u64) -> Option<&FuncSymbol> {
        let index = self.functions.partition_point(|f| f.value <= addr);
        let candidate = self.functions.get(index.checked_sub(1)?)?;
        if candidate.size == 0 || addr < candidate.value + candidate.size {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
