//! The ELF file header.
use super::{ByteReader, Layout, Stream};
use crate::error::{require, Error, Result};

/// See https://en.wikipedia.org/wiki/Executable_and_Linkable_Format for the
/// field layout.
pub struct ElfHeader {
    pub layout: Layout,
    pub etype: ElfType,
    pub machine: u16,
    pub entry: u64,
    pub ph_offset: u64,
    pub ph_entry_size: u16,
    pub num_ph_entries: u16,
    pub section_offset: u64,
    pub section_entry_size: u16,
    pub num_section_entries: u16,
    pub string_table_index: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElfType {
    /// Relocatable object file.
    Rel,

    /// Non position independent executable.
    Exec,

    /// Shared library, or a position independent executable.
    Dyn,

    /// A kernel generated snapshot of a terminated process.
    Core,
}

impl ElfHeader {
    pub fn new(reader: &dyn ByteReader) -> Result<Self> {
        let mut ident = [0u8; 16];
        require(
            reader.read_at(0, &mut ident)? == 16,
            || Error::BadElf("file is much too small".to_string()),
        )?;
        require(
            ident[0] == 0x7f && ident[1] == b'E' && ident[2] == b'L' && ident[3] == b'F',
            || Error::BadElf("not an ELF file (bad magic)".to_string()),
        )?;

        let ei_class = ident[4];
        let ei_data = ident[5];
        let ei_version = ident[6];
        require(ei_version == 1, || Error::BadElf(format!("bad elf version: {ei_version}")))?;
        require(
            ei_class == 1 || ei_class == 2,
            || Error::BadElf(format!("bad elf class: {ei_class}")),
        )?;
        require(
            ei_data == 1 || ei_data == 2,
            || Error::BadElf(format!("bad elf data encoding: {ei_data}")),
        )?;
        let layout = Layout { little_endian: ei_data == 1, sixty_four_bit: ei_class == 2 };

        let mut s = Stream::new(reader, layout, 16);
        let e_type = s.read_half()?;
        let e_machine = s.read_half()?;
        let _e_version = s.read_word()?;
        let e_entry = s.read_addr()?;
        let e_phoff = s.read_offset()?;
        let e_shoff = s.read_offset()?;
        let _e_flags = s.read_word()?;
        let _e_ehsize = s.read_half()?;
        let e_phentsize = s.read_half()?;
        let e_phnum = s.read_half()?;
        let e_shentsize = s.read_half()?;
        let e_shnum = s.read_half()?;
        let e_shstrndx = s.read_half()?;

        let etype = match e_type {
            1 => ElfType::Rel,
            2 => ElfType::Exec,
            3 => ElfType::Dyn,
            4 => ElfType::Core,
            n => return Err(Error::BadElf(format!("bad elf type: {n}"))),
        };

        Ok(ElfHeader {
            layout,
            etype,
            machine: e_machine,
            entry: e_entry,
            ph_offset: e_phoff,
            ph_entry_size: e_phentsize,
            num_ph_entries: e_phnum,
            section_offset: e_shoff,
            section_entry_size: e_shentsize,
            num_section_entries: e_shnum,
            string_table_index: e_shstrndx,
        })
    }

    pub fn machine(&self) -> &'static str {
        match self.machine {
            0x03 => "x86",
            0x28 => "arm",
            0x3e => "x86-64",
            0xb7 => "aarch64",
            0xf3 => "risc-v",
            _ => "unknown machine",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::MemReader;
    use crate::testimage::ImageBuilder;

    #[test]
    fn core_header() {
        let bytes = ImageBuilder::core().build();
        let reader = MemReader::new("core", bytes);
        let header = ElfHeader::new(&reader).unwrap();
        assert_eq!(header.etype, ElfType::Core);
        assert_eq!(header.machine(), "x86-64");
        assert!(header.layout.little_endian);
        assert!(header.layout.sixty_four_bit);
    }

    #[test]
    fn rejects_bad_magic() {
        let reader = MemReader::new("bad", vec![0u8; 64]);
        assert!(ElfHeader::new(&reader).is_err());
    }
}
