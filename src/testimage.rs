//! Builds small ELF64 images in memory so tests don't depend on checked-in
//! binaries. Only the subset of the format the crate reads is emitted.
use crate::elf::{ElfObject, MemReader, ReaderRef};
use std::path::PathBuf;
use std::sync::Arc;

pub struct SegmentSpec {
    pub vaddr: u64,
    pub bytes: Vec<u8>,
    pub mem_size: u64,
    pub flags: u32,
}

pub struct SectionSpec {
    pub name: String,
    pub kind: u32,
    pub flags: u64,
    pub link: u32,
    pub entry_size: u64,
    pub bytes: Vec<u8>,
}

pub struct ImageBuilder {
    etype: u16,
    entry: u64,
    segments: Vec<SegmentSpec>,
    notes: Vec<(String, u32, Vec<u8>)>,
    sections: Vec<SectionSpec>,
}

impl ImageBuilder {
    pub fn core() -> Self {
        ImageBuilder { etype: 4, entry: 0, segments: Vec::new(), notes: Vec::new(), sections: Vec::new() }
    }

    pub fn exec() -> Self {
        ImageBuilder { etype: 2, entry: 0x401000, segments: Vec::new(), notes: Vec::new(), sections: Vec::new() }
    }

    /// Add a PT_LOAD segment whose file bytes are `bytes` and whose memory
    /// size may exceed them (the zero-fill tail).
    pub fn segment(mut self, vaddr: u64, bytes: Vec<u8>, mem_size: u64, flags: u32) -> Self {
        assert!(bytes.len() as u64 <= mem_size);
        self.segments.push(SegmentSpec { vaddr, bytes, mem_size, flags });
        self
    }

    pub fn note(mut self, name: &str, ntype: u32, desc: Vec<u8>) -> Self {
        self.notes.push((name.to_string(), ntype, desc));
        self
    }

    /// Add a PROGBITS section.
    pub fn section(self, name: &str, bytes: Vec<u8>) -> Self {
        self.section_full(name, 1, 0, 0, 0, bytes)
    }

    pub fn section_full(
        mut self,
        name: &str,
        kind: u32,
        flags: u64,
        link: u32,
        entry_size: u64,
        bytes: Vec<u8>,
    ) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            kind,
            flags,
            link,
            entry_size,
            bytes,
        });
        self
    }

    /// Add a .strtab/.symtab pair holding global function symbols.
    pub fn func_symbols(mut self, symbols: &[(&str, u64, u64)]) -> Self {
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 24]; // null symbol
        for (name, value, size) in symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            symtab.extend_from_slice(&name_off.to_le_bytes());
            symtab.push(0x12); // STB_GLOBAL, STT_FUNC
            symtab.push(0); // st_other
            symtab.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
            symtab.extend_from_slice(&value.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
        }
        let strtab_index = self.sections.len() as u32 + 1; // after the null section
        self = self.section_full(".strtab", 3, 0, 0, 0, strtab);
        self.section_full(".symtab", 2, 0, strtab_index, 24, symtab)
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len() + if self.notes.is_empty() { 0 } else { 1 };
        let mut out = vec![0u8; 64 + phnum * 56];

        // Segment payloads.
        let mut phdrs = Vec::new();
        for seg in &self.segments {
            align_to(&mut out, 8);
            let offset = out.len() as u64;
            out.extend_from_slice(&seg.bytes);
            phdrs.push((1u32, seg.flags, offset, seg.vaddr, seg.bytes.len() as u64, seg.mem_size));
        }
        if !self.notes.is_empty() {
            align_to(&mut out, 4);
            let offset = out.len() as u64;
            for (name, ntype, desc) in &self.notes {
                out.extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
                out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
                out.extend_from_slice(&ntype.to_le_bytes());
                out.extend_from_slice(name.as_bytes());
                out.push(0);
                align_to(&mut out, 4);
                out.extend_from_slice(desc);
                align_to(&mut out, 4);
            }
            let size = out.len() as u64 - offset;
            phdrs.push((4u32, 4, offset, 0, size, size));
        }

        // Program header table.
        for (i, (kind, flags, offset, vaddr, filesz, memsz)) in phdrs.iter().enumerate() {
            let at = 64 + i * 56;
            out[at..at + 4].copy_from_slice(&kind.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&flags.to_le_bytes());
            out[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
            out[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
            out[at + 24..at + 32].copy_from_slice(&vaddr.to_le_bytes()); // paddr
            out[at + 32..at + 40].copy_from_slice(&filesz.to_le_bytes());
            out[at + 40..at + 48].copy_from_slice(&memsz.to_le_bytes());
            out[at + 48..at + 56].copy_from_slice(&8u64.to_le_bytes()); // align
        }

        // Sections: a null entry, the user sections, then .shstrtab.
        let mut shstrtab = vec![0u8];
        let mut shdrs: Vec<[u8; 64]> = vec![[0u8; 64]];
        let mut payloads = Vec::new();
        for section in &self.sections {
            let name_off = shstrtab.len() as u32;
            shstrtab.extend_from_slice(section.name.as_bytes());
            shstrtab.push(0);
            align_to(&mut out, 8);
            let offset = out.len() as u64;
            out.extend_from_slice(&section.bytes);
            payloads.push((name_off, section, offset));
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        for (name_off, section, offset) in payloads {
            shdrs.push(shdr(
                name_off,
                section.kind,
                section.flags,
                offset,
                section.bytes.len() as u64,
                section.link,
                section.entry_size,
            ));
        }
        align_to(&mut out, 8);
        let shstrtab_offset = out.len() as u64;
        out.extend_from_slice(&shstrtab);
        shdrs.push(shdr(shstrtab_name, 3, 0, shstrtab_offset, shstrtab.len() as u64, 0, 0));

        align_to(&mut out, 8);
        let shoff = out.len() as u64;
        for entry in &shdrs {
            out.extend_from_slice(entry);
        }

        // Finally the ELF header itself.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // 64-bit
        out[5] = 1; // little endian
        out[6] = 1; // version
        out[16..18].copy_from_slice(&self.etype.to_le_bytes());
        out[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // x86-64
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes()); // ehsize
        out[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes()); // shentsize
        out[60..62].copy_from_slice(&(shdrs.len() as u16).to_le_bytes());
        out[62..64].copy_from_slice(&(shdrs.len() as u16 - 1).to_le_bytes()); // shstrndx
        out
    }

    pub fn build_reader(&self, label: &str) -> ReaderRef {
        Arc::new(MemReader::new(label, self.build()))
    }

    pub fn build_object(&self) -> Arc<ElfObject> {
        ElfObject::new(self.build_reader("synthetic"), PathBuf::from("synthetic")).unwrap()
    }
}

fn shdr(name: u32, kind: u32, flags: u64, offset: u64, size: u64, link: u32, entry_size: u64) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[0..4].copy_from_slice(&name.to_le_bytes());
    out[4..8].copy_from_slice(&kind.to_le_bytes());
    out[8..16].copy_from_slice(&flags.to_le_bytes());
    out[24..32].copy_from_slice(&offset.to_le_bytes());
    out[32..40].copy_from_slice(&size.to_le_bytes());
    out[40..44].copy_from_slice(&link.to_le_bytes());
    out[56..64].copy_from_slice(&entry_size.to_le_bytes());
    out
}

fn align_to(out: &mut Vec<u8>, alignment: usize) {
    while out.len() % alignment != 0 {
        out.push(0);
    }
}

/// The bytes of a PRSTATUS note for a thread.
pub fn prstatus_bytes(pid: i32, cursig: i32, registers: &[(usize, u64)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&cursig.to_le_bytes()); // si_signo
    bytes.extend_from_slice(&0i32.to_le_bytes()); // si_code
    bytes.extend_from_slice(&0i32.to_le_bytes()); // si_errno
    bytes.extend_from_slice(&(cursig as u16).to_le_bytes()); // pr_cursig
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 16]); // pending and held signals
    bytes.extend_from_slice(&pid.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 12]); // ppid, pgrp, sid
    bytes.extend_from_slice(&[0u8; 64]); // utime, stime, cutime, cstime
    let mut regs = [0u64; 27];
    for &(index, value) in registers {
        regs[index] = value;
    }
    for r in regs {
        bytes.extend_from_slice(&r.to_le_bytes());
    }
    bytes
}

/// The bytes of an NT_FILE note.
pub fn file_note_bytes(page_size: u64, entries: &[(u64, u64, u64, &str)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&page_size.to_le_bytes());
    for (start, end, off, _) in entries {
        bytes.extend_from_slice(&start.to_le_bytes());
        bytes.extend_from_slice(&end.to_le_bytes());
        bytes.extend_from_slice(&off.to_le_bytes());
    }
    for (_, _, _, path) in entries {
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);
    }
    bytes
}

pub const REG_RBP: usize = 4;
pub const REG_RIP: usize = 16;
