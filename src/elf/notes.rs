//! The notes in an ELF image. For cores these describe the process that
//! died: one PRSTATUS note per thread, the auxiliary vector, the table of
//! memory mapped files. For executables they describe the build. Not all
//! may be present. See fill_files_note and friends in
//! https://android.googlesource.com/kernel/common/+/6e7bfa046de8/fs/binfmt_elf.c
use super::{view, ByteReader, Layout, ReaderRef, Segment, SegmentKind, Stream};
use crate::error::{Error, Result};
use log::{debug, warn};

/// A typed, named payload embedded in an image.
pub struct Note {
    pub name: String,
    pub ntype: u32,
    pub data: ReaderRef,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CoreNoteType {
    /// Per-thread register and signal state. One per thread; the first one
    /// belongs to the thread that caused the dump.
    PrStatus,

    /// Floating point register values.
    FpRegSet,

    /// Process state: name, arguments, niceness.
    PrPsInfo,

    TaskStruct,

    Platform,

    /// The auxiliary vector the kernel handed to the process at exec time.
    /// See https://man7.org/linux/man-pages/man7/vdso.7.html
    AuxV,

    /// Details of the signal that killed the process.
    SigInfo,

    /// Memory-mapped files.
    File,

    /// Type we don't handle.
    Other,
}

impl CoreNoteType {
    pub fn from_u32(value: u32) -> Self {
        // see https://docs.huihoo.com/doxygen/linux/kernel/3.7/include_2uapi_2linux_2elf_8h_source.html
        match value {
            1 => CoreNoteType::PrStatus,
            2 => CoreNoteType::FpRegSet,
            3 => CoreNoteType::PrPsInfo,
            4 => CoreNoteType::TaskStruct,
            5 => CoreNoteType::Platform,
            6 => CoreNoteType::AuxV,
            0x53494749 => CoreNoteType::SigInfo,
            0x46494c45 => CoreNoteType::File,
            _ => CoreNoteType::Other,
        }
    }
}

impl Note {
    pub fn core_type(&self) -> Option<CoreNoteType> {
        if self.name == "CORE" { Some(CoreNoteType::from_u32(self.ntype)) } else { None }
    }
}

fn align_to_word(n: u32) -> u32 {
    (n + 3) & !3
}

/// Lazily walk the notes in every PT_NOTE segment of an image. Notes that
/// cannot be decoded are reported and skipped; cores are sometimes damaged
/// and not all notes are essential.
pub struct NoteIter<'a> {
    reader: &'a ReaderRef,
    layout: Layout,
    segments: Vec<(u64, u64)>, // remaining (offset, end) pairs, reversed
    offset: u64,
    end: u64,
}

impl<'a> NoteIter<'a> {
    pub fn new(reader: &'a ReaderRef, layout: Layout, segments: &[&Segment]) -> Self {
        let mut ranges: Vec<(u64, u64)> = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Note)
            .map(|s| (s.offset, s.offset + s.file_size))
            .collect();
        ranges.reverse();
        let (offset, end) = ranges.pop().unwrap_or((0, 0));
        NoteIter { reader, layout, segments: ranges, offset, end }
    }

    fn read_note(&mut self) -> Result<Note> {
        let mut s = Stream::new(self.reader.as_ref(), self.layout, self.offset);
        let n_namesz = s.read_word()?;
        let n_descsz = s.read_word()?;
        let n_type = s.read_word()?;

        let name = if n_namesz == 0 { String::new() } else { s.reader.read_string_at(s.offset)? };
        s.skip(align_to_word(n_namesz) as u64);

        let data = view(self.reader.clone(), "note", s.offset, n_descsz as u64);
        s.skip(align_to_word(n_descsz) as u64);
        self.offset = s.offset;
        Ok(Note { name, ntype: n_type, data })
    }
}

impl<'a> Iterator for NoteIter<'a> {
    type Item = Note;

    fn next(&mut self) -> Option<Note> {
        loop {
            if self.offset >= self.end {
                let (offset, end) = self.segments.pop()?;
                self.offset = offset;
                self.end = end;
                continue;
            }
            match self.read_note() {
                Ok(note) => return Some(note),
                Err(err) => {
                    warn!("failed to read note at offset {}: {err}", self.offset);
                    // Give up on this segment; the framing is lost.
                    self.offset = self.end;
                }
            }
        }
    }
}

/// The architecture register file of one thread, laid out as the kernel's
/// pt_regs. See
/// https://elixir.bootlin.com/linux/v4.9/source/arch/x86/include/uapi/asm/ptrace.h#L60
#[derive(Clone)]
pub struct CoreRegisters(pub [u64; 27]);

impl CoreRegisters {
    /// The instruction address within the currently executing function.
    pub fn get_ip(&self) -> u64 {
        self.0[16]
    }

    /// Top of the current frame (rbp). Garbage when the image was built
    /// with -fomit-frame-pointer.
    pub fn get_frame_stack_top(&self) -> u64 {
        self.0[4]
    }

    /// Start of the current frame's locals (rsp).
    pub fn get_frame_stack_bottom(&self) -> u64 {
        self.0[19]
    }

    pub fn name(n: usize) -> &'static str {
        match n {
            0 => "r15",
            1 => "r14",
            2 => "r13",
            3 => "r12",
            4 => "rbp",
            5 => "rbx",
            6 => "r11",
            7 => "r10",
            8 => "r9",
            9 => "r8",
            10 => "rax",
            11 => "rcx",
            12 => "rdx",
            13 => "rsi",
            14 => "rdi",
            15 => "orig_rax",
            16 => "rip",
            17 => "cs",
            18 => "eflags",
            19 => "rsp",
            20 => "ss",
            21 => "fs_base",
            22 => "gs_base",
            23 => "ds",
            24 => "es",
            25 => "fs",
            26 => "gs",
            _ => "?",
        }
    }
}

/// One thread's worth of a PRSTATUS note.
pub struct PrStatus {
    /// The signal that terminated the process.
    pub signal_num: i32,

    /// Further details about the signal, e.g. SEGV_MAPERR vs SEGV_ACCERR.
    pub signal_code: i32,

    /// The signal currently pending for this thread.
    pub current_signal: i32,

    /// The thread's lwp id.
    pub pid: i32,

    pub registers: CoreRegisters,
}

impl PrStatus {
    /// Decode an elf_prstatus record, see
    /// https://docs.huihoo.com/doxygen/linux/kernel/3.7/uapi_2linux_2elfcore_8h_source.html
    pub fn new(data: &dyn ByteReader, layout: Layout) -> Result<Self> {
        let mut s = Stream::new(data, layout, 0);
        let signal_num = s.read_int()?;
        let signal_code = s.read_int()?;
        let _errno = s.read_int()?;
        let current_signal = s.read_half()? as i32;
        let _padding = s.read_half()?;
        let _pending_signals = s.read_xword()?;
        let _held_signals = s.read_xword()?;
        let pid = s.read_int()?;
        let _ppid = s.read_int()?;
        let _pgrp = s.read_int()?;
        let _psid = s.read_int()?;

        // utime, stime, cutime, cstime: four timevals we have no use for.
        s.skip(4 * 16);

        let mut registers = [0u64; 27];
        for r in registers.iter_mut() {
            *r = s.read_xword()?;
        }

        Ok(PrStatus { signal_num, signal_code, current_signal, pid, registers: CoreRegisters(registers) })
    }

    pub fn signal(&self) -> &'static str {
        signal_name(self.signal_num)
    }
}

pub fn signal_name(num: i32) -> &'static str {
    match num {
        1 => "SIGHUP", // see https://man7.org/linux/man-pages/man7/signal.7.html
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        16 => "SIGSTKFLT",
        17 => "SIGCHLD",
        18 => "SIGCONT",
        19 => "SIGSTOP",
        20 => "SIGTSTP",
        21 => "SIGTTIN",
        22 => "SIGTTOU",
        23 => "SIGURG",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        26 => "SIGVTALRM",
        27 => "SIGPROF",
        28 => "SIGWINCH",
        29 => "SIGIO",
        30 => "SIGPWR",
        31 => "SIGSYS",
        _ => "unknown signal",
    }
}

/// One entry of the file-mapping table.
pub struct FileMapping {
    pub start: u64,
    pub end: u64,

    /// Offset of the mapping within the file, in pages.
    pub file_off: u64,

    pub path: String,
}

/// The decoded NT_FILE note: which address ranges were backed by which
/// on-disk files. The layout is `{count, page_size}` then `count` range
/// entries then `count` null-terminated paths in the same order.
pub struct FileTable {
    pub page_size: u64,
    pub entries: Vec<FileMapping>,
}

impl FileTable {
    pub fn new(data: &dyn ByteReader, layout: Layout) -> Result<Self> {
        let mut s = Stream::new(data, layout, 0);
        let count = s.read_ulong()?;
        let page_size = s.read_ulong()?;

        let mut ranges = Vec::new();
        for _ in 0..count {
            let start = s.read_ulong()?;
            let end = s.read_ulong()?;
            let file_off = s.read_ulong()?;
            if end < start {
                return Err(Error::BadElf(format!("file mapping ends before it starts: {start:#x}")));
            }
            ranges.push((start, end, file_off));
        }

        // The announced count governs both tables; a missing path string
        // means the note is truncated.
        let mut entries = Vec::new();
        for (start, end, file_off) in ranges {
            let path = s.read_string()?;
            entries.push(FileMapping { start, end, file_off, path });
        }
        Ok(FileTable { page_size, entries })
    }

    /// Sum of the mapped extents, for diagnostics.
    pub fn total_mapped_size(&self) -> u64 {
        self.entries.iter().map(|e| e.end - e.start).sum()
    }

    /// Files get mapped in multiple times, e.g. the text, rodata, and data
    /// portions of a shared library each get a row. The row boundaries are
    /// noise for a mapping report, so merge adjacent rows of the same file.
    pub fn merged(&self) -> Vec<FileMapping> {
        let mut files: Vec<FileMapping> = Vec::new();
        for e in &self.entries {
            if let Some(old) = files.last_mut() {
                if e.start == old.end && e.path == old.path {
                    old.end = e.end;
                    continue;
                }
            }
            files.push(FileMapping {
                start: e.start,
                end: e.end,
                file_off: e.file_off * self.page_size,
                path: e.path.clone(),
            });
        }
        files
    }
}

/// One auxiliary vector entry.
pub struct AuxEntry {
    pub a_type: u64,
    pub a_val: u64,
}

impl AuxEntry {
    pub fn type_name(&self) -> &'static str {
        match self.a_type {
            2 => "AT_EXECFD",
            3 => "AT_PHDR",
            4 => "AT_PHENT",
            5 => "AT_PHNUM",
            6 => "AT_PAGESZ",
            7 => "AT_BASE",
            8 => "AT_FLAGS",
            9 => "AT_ENTRY",
            11 => "AT_UID",
            12 => "AT_EUID",
            13 => "AT_GID",
            14 => "AT_EGID",
            15 => "AT_PLATFORM",
            16 => "AT_HWCAP",
            17 => "AT_CLKTCK",
            23 => "AT_SECURE",
            25 => "AT_RANDOM",
            26 => "AT_HWCAP2",
            31 => "AT_EXECFN",
            33 => "AT_SYSINFO_EHDR",
            _ => "AT_?",
        }
    }
}

/// Decode the retained auxiliary vector payload into entries. Stops at
/// AT_NULL or at the end of the payload, whichever comes first.
pub fn read_auxv(data: &dyn ByteReader, layout: Layout) -> Vec<AuxEntry> {
    let mut entries = Vec::new();
    let mut s = Stream::new(data, layout, 0);
    loop {
        let a_type = match s.read_ulong() {
            Ok(t) => t,
            Err(_) => break,
        };
        let a_val = match s.read_ulong() {
            Ok(v) => v,
            Err(err) => {
                debug!("auxiliary vector ends mid-entry: {err}");
                break;
            }
        };
        if a_type == 0 {
            break;
        }
        entries.push(AuxEntry { a_type, a_val });
    }
    entries
}
