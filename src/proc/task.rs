//! The task model: one captured process, assembled from its core file, its
//! executable, and whatever shared objects the core's file-mapping note
//! lets us recover. The composite memory read lives here too, since it
//! needs to see the core and the loaded objects side by side.
use super::ImageCache;
use crate::debug::{DwarfInfo, SymbolTable};
use crate::elf::{
    read_auxv, AuxEntry, ByteReader, CoreNoteType, CoreRegisters, ElfObject, ElfType, FileTable,
    PrStatus, ReaderRef, Segment,
};
use crate::error::{Error, Result};
use crate::verbose;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// An object image bound at its runtime address. The effective virtual
/// address of any segment is `load_bias + segment.vaddr`.
pub struct LoadedObject {
    pub load_bias: u64,
    pub object: Arc<ElfObject>,
}

/// One kernel thread of the task.
pub struct Lwp {
    pub id: i32,
    pub registers: CoreRegisters,
    pub current_signal: i32,
}

/// A visible range of the task's address space: `file_size` bytes are
/// materialized in the core, the rest of `mem_size` reads as zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
}

pub struct Task {
    pub exe: Option<Arc<ElfObject>>,
    pub core: Option<Arc<ElfObject>>,
    loaded: Vec<LoadedObject>,
    lwps: BTreeMap<i32, Lwp>,
    primary_pid: Option<i32>,
    auxv: Option<ReaderRef>,

    // Keyed by object identity; a None records "no debug info", so the
    // section scan doesn't repeat.
    dwarf: RefCell<HashMap<usize, Option<Rc<DwarfInfo>>>>,
    symbols: RefCell<HashMap<usize, Rc<SymbolTable>>>,
}

impl Task {
    /// Build a task over a core and (optionally) the executable it was
    /// dumped from. Call [`Task::load`] before using it.
    pub fn new(exe: Option<Arc<ElfObject>>, core: Option<Arc<ElfObject>>) -> Task {
        let mut task = Task {
            exe: exe.clone(),
            core,
            loaded: Vec::new(),
            lwps: BTreeMap::new(),
            primary_pid: None,
            auxv: None,
            dwarf: RefCell::new(HashMap::new()),
            symbols: RefCell::new(HashMap::new()),
        };
        if let Some(exe) = exe {
            // Addresses in a non-PIE executable are absolute; a PIE one is
            // re-registered at its real bias by the file-mapping note.
            task.add_object(exe, 0);
        }
        task
    }

    /// When no executable was named on the command line, guess it from the
    /// core's file-mapping note: the first header-page mapping that loads
    /// as an executable image.
    pub fn guess_executable(core: &Arc<ElfObject>, cache: &ImageCache) -> Option<Arc<ElfObject>> {
        let table = Task::find_file_table(core)?;
        let mut fallback = None;
        for entry in &table.entries {
            if entry.file_off != 0 {
                continue;
            }
            let object = match cache.image_for_path(Path::new(&entry.path)) {
                Ok(object) => object,
                Err(_) => continue,
            };
            match object.header.etype {
                ElfType::Exec => return Some(object),
                ElfType::Dyn if object.header.entry != 0 && fallback.is_none() => {
                    fallback = Some(object)
                }
                _ => (),
            }
        }
        fallback
    }

    fn find_file_table(core: &Arc<ElfObject>) -> Option<FileTable> {
        for note in core.notes() {
            if note.core_type() == Some(CoreNoteType::File) {
                match FileTable::new(note.data.as_ref(), core.layout()) {
                    Ok(table) => return Some(table),
                    Err(err) => {
                        warn!("failed to read file-mapping note: {err}");
                        return None;
                    }
                }
            }
        }
        None
    }

    /// The initial load phase: recover the thread records, the auxiliary
    /// vector, and the shared objects. The task is read-only afterwards.
    pub fn load(&mut self, cache: &ImageCache) {
        self.find_lwps();
        self.find_auxv();
        self.load_shared_objects_from_file_note(cache);
    }

    fn find_lwps(&mut self) {
        let Some(core) = self.core.clone() else { return };
        for note in core.notes() {
            if note.core_type() != Some(CoreNoteType::PrStatus) {
                continue;
            }
            match PrStatus::new(note.data.as_ref(), core.layout()) {
                Ok(status) => {
                    if verbose() > 0 {
                        debug!("task {} current sig is {}", status.pid, status.current_signal);
                    }
                    if self.primary_pid.is_none() {
                        self.primary_pid = Some(status.pid);
                    }
                    self.lwps.insert(
                        status.pid,
                        Lwp {
                            id: status.pid,
                            registers: status.registers,
                            current_signal: status.current_signal,
                        },
                    );
                }
                Err(err) => warn!("failed to read prstatus note: {err}"),
            }
        }
    }

    fn find_auxv(&mut self) {
        let Some(core) = self.core.clone() else { return };
        for note in core.notes() {
            if note.core_type() == Some(CoreNoteType::AuxV) {
                self.auxv = Some(note.data);
                return;
            }
        }
    }

    /// If the core is truncated and we have no access to the link map, the
    /// file-mapping note is our guess at what shared libraries were mapped
    /// where. Only entries mapping a file's header page (offset zero) are
    /// load candidates; an entry that fails to load is skipped, not fatal.
    /// Returns false when the note is absent.
    pub fn load_shared_objects_from_file_note(&mut self, cache: &ImageCache) -> bool {
        let Some(core) = self.core.clone() else { return false };
        let Some(table) = Task::find_file_table(&core) else { return false };

        let mut total_size: u64 = 0;
        for entry in &table.entries {
            total_size += entry.end - entry.start;
            if verbose() > 2 {
                debug!(
                    "file mapping {} {:#x} {:#x}",
                    entry.path,
                    entry.start,
                    entry.end - entry.start
                );
            }
            if entry.file_off != 0 {
                continue;
            }
            match cache.image_for_path(Path::new(&entry.path)) {
                Ok(object) => self.add_object(object, entry.start),
                Err(err) => debug!("couldn't load {}: {err}", entry.path),
            }
        }
        if verbose() > 0 {
            debug!("total mapped file size: {total_size}");
        }
        true
    }

    /// Bind an object at `load_bias`. An object appears at most once in
    /// the loaded set.
    pub fn add_object(&mut self, object: Arc<ElfObject>, load_bias: u64) {
        if self.loaded.iter().any(|lo| Arc::ptr_eq(&lo.object, &object)) {
            return;
        }
        self.loaded.push(LoadedObject { load_bias, object });
    }

    pub fn loaded_objects(&self) -> &[LoadedObject] {
        &self.loaded
    }

    pub fn lwps(&self) -> impl Iterator<Item = &Lwp> {
        self.lwps.values()
    }

    /// The pid of the first thread record, or -1 when the core carries
    /// none.
    pub fn get_pid(&self) -> i32 {
        self.primary_pid.unwrap_or(-1)
    }

    pub fn get_registers(&self, lwp_id: i32) -> Result<CoreRegisters> {
        self.lwps
            .get(&lwp_id)
            .map(|lwp| lwp.registers.clone())
            .ok_or(Error::NoSuchLwp(lwp_id))
    }

    /// The raw auxiliary vector payload, if the core carried one.
    pub fn auxv(&self) -> Option<ReaderRef> {
        self.auxv.clone()
    }

    pub fn aux_entries(&self) -> Vec<AuxEntry> {
        match (&self.auxv, &self.core) {
            (Some(auxv), Some(core)) => read_auxv(auxv.as_ref(), core.layout()),
            _ => Vec::new(),
        }
    }

    /// The decoded file-mapping table, for mapping reports.
    pub fn file_table(&self) -> Option<FileTable> {
        Task::find_file_table(self.core.as_ref()?)
    }

    /// The first loaded object whose translated segment range contains
    /// `addr`.
    pub fn find_segment(&self, addr: u64) -> Option<(u64, &Arc<ElfObject>, &Segment)> {
        for lo in &self.loaded {
            let Some(local) = addr.checked_sub(lo.load_bias) else { continue };
            if let Some(segment) = lo.object.find_segment_for_address(local) {
                return Some((lo.load_bias, &lo.object, segment));
            }
        }
        None
    }

    /// The task's visible address ranges: the
    /// `{vaddr, file_size, mem_size}` projection of the core's loadable
    /// segments in file order.
    pub fn address_ranges(&self) -> Vec<AddressRange> {
        let Some(core) = &self.core else { return Vec::new() };
        core.segments(crate::elf::SegmentKind::Load)
            .map(|s| AddressRange { vaddr: s.vaddr, file_size: s.file_size, mem_size: s.mem_size })
            .collect()
    }

    /// Can't resume a post-mortem task.
    pub fn resume(&self, _lwp_id: i32) {}

    /// Can't stop a dead task either.
    pub fn stop(&self, _lwp_id: i32) {}

    /// Read task memory at the virtual address `start`. Returns the number
    /// of bytes written, which is less than `dst.len()` only when no
    /// source (core, loaded object, or zero-fill) covers the tail.
    pub fn read_memory(&self, start: u64, dst: &mut [u8]) -> Result<usize> {
        let mut addr = start;
        let mut pos = 0usize;
        while pos < dst.len() {
            let mut zeroes: u64 = 0;

            if let Some(core) = &self.core {
                // The core's own segments take precedence for any bytes
                // they actually materialize.
                if let Some(segment) = core.find_segment_for_address(addr) {
                    let count = read_from_segment(core, segment, addr, &mut dst[pos..], &mut zeroes)?;
                    addr += count as u64;
                    pos += count;
                    if count != 0 && zeroes == 0 {
                        // Real bytes and nothing to default: stay on the
                        // core path.
                        continue;
                    }
                }
            }

            // Either no data in the core, or it was incomplete to this
            // point: search the loaded objects.
            let mut in_object = false;
            if let Some((bias, object, segment)) = self.find_segment(addr) {
                let count =
                    read_from_segment(object, segment, addr - bias, &mut dst[pos..], &mut zeroes)?;
                addr += count as u64;
                pos += count;
                in_object = true;
            }

            // Any real data has been copied; `zeroes` is what we may
            // default.
            let fill = (zeroes as usize).min(dst.len() - pos);
            dst[pos..pos + fill].fill(0);
            addr += fill as u64;
            pos += fill;

            if !in_object && fill == 0 {
                // Nothing from the core, objects, or zero-fill. We're stuck.
                break;
            }
        }
        Ok(pos)
    }

    /// The debug info for a loaded object, shared across lookups.
    pub fn dwarf_for(&self, object: &Arc<ElfObject>) -> Option<Rc<DwarfInfo>> {
        let key = Arc::as_ptr(object) as usize;
        if let Some(cached) = self.dwarf.borrow().get(&key) {
            return cached.clone();
        }
        let info = DwarfInfo::new(object.clone()).map(Rc::new);
        self.dwarf.borrow_mut().insert(key, info.clone());
        info
    }

    fn symbols_for(&self, object: &Arc<ElfObject>) -> Rc<SymbolTable> {
        let key = Arc::as_ptr(object) as usize;
        if let Some(cached) = self.symbols.borrow().get(&key) {
            return cached.clone();
        }
        let table = Rc::new(SymbolTable::new(object));
        self.symbols.borrow_mut().insert(key, table.clone());
        table
    }

    /// Bind a program counter to a source position: pick the covering
    /// object, undo its load bias, and ask its debug info.
    pub fn source_for_pc(&self, pc: u64) -> Result<(String, u32)> {
        let (bias, object, _) = self.find_segment(pc).ok_or(Error::Unmapped(pc))?;
        let dwarf = self
            .dwarf_for(object)
            .ok_or_else(|| Error::NoDebugInfo(object.path.clone()))?;
        dwarf
            .source_for_address(pc - bias)
            .ok_or_else(|| Error::NoDebugInfo(object.path.clone()))
    }

    /// Name the function containing `pc`: the debug info's subprogram entry
    /// when there is one, else the nearest function symbol.
    pub fn function_for_pc(&self, pc: u64) -> Option<String> {
        let (bias, object, _) = self.find_segment(pc)?;
        let local = pc - bias;
        if let Some(dwarf) = self.dwarf_for(object) {
            if let Some(name) = dwarf.function_for_address(local) {
                return Some(name);
            }
        }
        self.symbols_for(object).find_function(local).map(|f| f.name.clone())
    }

    /// Drop the debug-info caches grown during symbolication; used between
    /// independent requests when dumping repeatedly.
    pub fn purge_units(&self) {
        for info in self.dwarf.borrow().values().flatten() {
            info.purge();
        }
    }
}

/// Copy the intersection of `dst` and one segment, starting at `addr`
/// (already object-local). On return `to_clear` holds how many bytes past
/// the copied prefix may be defaulted to zero from this segment's memory
/// tail, net of anything a previous source already supplied.
fn read_from_segment(
    object: &ElfObject,
    segment: &Segment,
    addr: u64,
    dst: &mut [u8],
    to_clear: &mut u64,
) -> Result<usize> {
    let mut off = addr - segment.vaddr;
    let count = if off < segment.file_size {
        // Some of the data is in the file: read the min of what we need
        // and what it has.
        let wanted = (segment.file_size - off).min(dst.len() as u64) as usize;
        let got = object.reader.read_at(segment.offset + off, &mut dst[..wanted])?;
        if got != wanted {
            return Err(Error::TruncatedCore(object.reader.describe()));
        }
        off += got as u64;
        got
    } else {
        0
    };

    let size_left = dst.len() as u64 - count as u64;
    let tail = if size_left != 0 && off < segment.mem_size {
        size_left.min(segment.mem_size - off)
    } else {
        0
    };
    *to_clear = to_clear.saturating_sub(count as u64).max(tail);
    Ok(count)
}

/// The composite reader handed to consumers that want the task's memory
/// behind the plain [`ByteReader`] interface. It only borrows the task;
/// the task owns it conceptually, not the other way around.
pub struct CoreReader<'a> {
    task: &'a Task,
}

impl Task {
    pub fn memory(&self) -> CoreReader {
        CoreReader { task: self }
    }
}

impl ByteReader for CoreReader<'_> {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        self.task.read_memory(offset, dst)
    }

    fn size(&self) -> u64 {
        u64::MAX
    }

    fn describe(&self) -> String {
        match &self.task.core {
            Some(core) => format!("memory of {}", core.reader.describe()),
            None => "no backing core file".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimage::{prstatus_bytes, ImageBuilder};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn simple_core() -> Task {
        // One load at 0x400000: 0x1000 file bytes repeating 0x00..0xff,
        // 0x1000 more of zero-fill tail.
        let core = ImageBuilder::core()
            .segment(0x400000, pattern(0x1000), 0x2000, 4)
            .note("CORE", 1, prstatus_bytes(1234, 11, &[]))
            .build_object();
        let mut task = Task::new(None, Some(core));
        task.load(&ImageCache::new());
        task
    }

    #[test]
    fn read_inside_file_portion() {
        let task = simple_core();
        let mut buf = [0u8; 16];
        assert_eq!(task.read_memory(0x400010, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..4], &[0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn read_straddles_zero_fill_boundary() {
        let task = simple_core();
        let mut buf = [0u8; 4];
        assert_eq!(task.read_memory(0x400ffe, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0xfe, 0xff, 0x00, 0x00]);
    }

    #[test]
    fn read_entirely_in_zero_fill_tail() {
        let task = simple_core();
        let mut buf = [0xaau8; 32];
        assert_eq!(task.read_memory(0x401100, &mut buf).unwrap(), 32);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_past_mapping_is_short() {
        let task = simple_core();
        let mut buf = [0u8; 1];
        assert_eq!(task.read_memory(0x402000, &mut buf).unwrap(), 0);
        // A read that starts mapped and runs off the end is short too.
        let mut buf = [0u8; 0x20];
        assert_eq!(task.read_memory(0x401ff0, &mut buf).unwrap(), 0x10);
    }

    #[test]
    fn registers_and_pid_from_prstatus() {
        let task = simple_core();
        assert_eq!(task.get_pid(), 1234);
        assert!(task.get_registers(1234).is_ok());
        assert!(matches!(task.get_registers(9999), Err(Error::NoSuchLwp(9999))));
    }

    #[test]
    fn first_prstatus_is_the_primary() {
        let core = ImageBuilder::core()
            .note("CORE", 1, prstatus_bytes(42, 6, &[]))
            .note("CORE", 1, prstatus_bytes(7, 0, &[]))
            .build_object();
        let mut task = Task::new(None, Some(core));
        task.load(&ImageCache::new());
        assert_eq!(task.get_pid(), 42);
        assert_eq!(task.lwps().count(), 2);
        // The lwp map is ordered by id regardless of note order.
        let ids: Vec<i32> = task.lwps().map(|l| l.id).collect();
        assert_eq!(ids, vec![7, 42]);
    }

    #[test]
    fn address_ranges_project_the_core_loads() {
        let core = ImageBuilder::core()
            .segment(0x500000, pattern(0x100), 0x100, 4)
            .segment(0x400000, pattern(0x1000), 0x2000, 4)
            .build_object();
        let mut task = Task::new(None, Some(core));
        task.load(&ImageCache::new());
        // File order, not sorted order.
        assert_eq!(
            task.address_ranges(),
            vec![
                AddressRange { vaddr: 0x500000, file_size: 0x100, mem_size: 0x100 },
                AddressRange { vaddr: 0x400000, file_size: 0x1000, mem_size: 0x2000 },
            ]
        );
    }

    #[test]
    fn loaded_object_supplies_uncaptured_memory() {
        let core = ImageBuilder::core().segment(0x400000, pattern(0x100), 0x100, 4).build_object();
        let exe =
            ImageBuilder::exec().segment(0x600000, vec![0x77; 0x100], 0x200, 5).build_object();
        let mut task = Task::new(Some(exe), Some(core));
        task.load(&ImageCache::new());

        let mut buf = [0u8; 4];
        assert_eq!(task.read_memory(0x600000, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0x77; 4]);

        // The object's zero-fill tail counts as well.
        let mut buf = [0xffu8; 4];
        assert_eq!(task.read_memory(0x600180, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0; 4]);

        let (bias, object, segment) = task.find_segment(0x600010).unwrap();
        assert_eq!(bias, 0);
        assert_eq!(segment.vaddr, 0x600000);
        assert!(!object.is_core());
    }

    #[test]
    fn core_bytes_take_precedence_over_objects() {
        // Both the core and the exe map 0x400000; the core's bytes win.
        let core = ImageBuilder::core().segment(0x400000, vec![0xcc; 0x100], 0x100, 4).build_object();
        let exe = ImageBuilder::exec().segment(0x400000, vec![0x11; 0x100], 0x100, 5).build_object();
        let mut task = Task::new(Some(exe), Some(core));
        task.load(&ImageCache::new());

        let mut buf = [0u8; 8];
        assert_eq!(task.read_memory(0x400000, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0xcc; 8]);
    }

    #[test]
    fn object_bytes_fill_past_the_core_file_portion() {
        // The core only materialized the first 0x100 bytes of the segment.
        // Past that point a loaded object with real file bytes supplies
        // them; its read also cancels the core's zero tail.
        let core = ImageBuilder::core().segment(0x400000, vec![0xcc; 0x100], 0x200, 4).build_object();
        let exe = ImageBuilder::exec().segment(0x400000, vec![0x11; 0x200], 0x200, 5).build_object();
        let mut task = Task::new(Some(exe), Some(core));
        task.load(&ImageCache::new());

        let mut buf = [0xffu8; 0x10];
        assert_eq!(task.read_memory(0x400100, &mut buf).unwrap(), 0x10);
        assert_eq!(buf, [0x11u8; 0x10]);

        // Where no object covers the tail, the core's zero-fill stands.
        let core = ImageBuilder::core().segment(0x400000, vec![0xcc; 0x100], 0x200, 4).build_object();
        let mut task = Task::new(None, Some(core));
        task.load(&ImageCache::new());
        let mut buf = [0xffu8; 0x10];
        assert_eq!(task.read_memory(0x400100, &mut buf).unwrap(), 0x10);
        assert_eq!(buf, [0u8; 0x10]);
    }

    #[test]
    fn composite_reader_is_a_byte_reader() {
        let task = simple_core();
        let memory = task.memory();
        assert_eq!(memory.read_string_at(0x401500).unwrap(), ""); // zero tail
        let mut buf = [0u8; 2];
        memory.read_exact_at(0x400001, &mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn object_dedupe_in_loaded_set() {
        let exe = ImageBuilder::exec().segment(0x400000, pattern(0x10), 0x10, 5).build_object();
        let mut task = Task::new(Some(exe.clone()), None);
        task.add_object(exe, 0x1000);
        assert_eq!(task.loaded_objects().len(), 1);
    }

    #[test]
    fn auxv_is_retained_and_decoded() {
        let mut auxv = Vec::new();
        for (t, v) in [(6u64, 0x1000u64), (9, 0x401000), (0, 0)] {
            auxv.extend_from_slice(&t.to_le_bytes());
            auxv.extend_from_slice(&v.to_le_bytes());
        }
        let core = ImageBuilder::core().note("CORE", 6, auxv).build_object();
        let mut task = Task::new(None, Some(core));
        task.load(&ImageCache::new());
        assert!(task.auxv().is_some());
        let entries = task.aux_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].a_val, 0x401000);
    }
}
