//! End-to-end tests over core and executable images written to disk, the
//! way the tool meets them in the wild: the shared objects named by the
//! core's file-mapping note are recovered through the image cache.
use corestack::elf::{CoreNoteType, FileTable};
use corestack::proc::{ImageCache, Task};
use std::fs;
use std::path::PathBuf;

/// A throwaway directory for the synthesized images.
struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    fn new(name: &str) -> Scratch {
        let dir = std::env::temp_dir().join(format!("corestack-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        Scratch { dir }
    }

    fn write(&self, name: &str, bytes: Vec<u8>) -> PathBuf {
        let path = self.dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Just enough of an ELF64 writer for these tests: a header, program
/// headers, and raw segment payloads. No section table.
fn elf_bytes(etype: u16, entry: u64, segments: &[(u32, u64, &[u8], u64)]) -> Vec<u8> {
    let mut out = vec![0u8; 64 + segments.len() * 56];
    let mut phdrs = Vec::new();
    for &(kind, vaddr, bytes, mem_size) in segments {
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let offset = out.len() as u64;
        out.extend_from_slice(bytes);
        phdrs.push((kind, offset, vaddr, bytes.len() as u64, mem_size));
    }
    for (i, &(kind, offset, vaddr, file_size, mem_size)) in phdrs.iter().enumerate() {
        let at = 64 + i * 56;
        out[at..at + 4].copy_from_slice(&kind.to_le_bytes());
        out[at + 4..at + 8].copy_from_slice(&4u32.to_le_bytes());
        out[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
        out[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
        out[at + 32..at + 40].copy_from_slice(&file_size.to_le_bytes());
        out[at + 40..at + 48].copy_from_slice(&mem_size.to_le_bytes());
    }
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2;
    out[5] = 1;
    out[6] = 1;
    out[16..18].copy_from_slice(&etype.to_le_bytes());
    out[18..20].copy_from_slice(&0x3eu16.to_le_bytes());
    out[24..32].copy_from_slice(&entry.to_le_bytes());
    out[32..40].copy_from_slice(&64u64.to_le_bytes());
    out[54..56].copy_from_slice(&56u16.to_le_bytes());
    out[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());
    out
}

fn file_note(entries: &[(u64, u64, u64, &str)]) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    desc.extend_from_slice(&0x1000u64.to_le_bytes());
    for &(start, end, off, _) in entries {
        desc.extend_from_slice(&start.to_le_bytes());
        desc.extend_from_slice(&end.to_le_bytes());
        desc.extend_from_slice(&off.to_le_bytes());
    }
    for &(_, _, _, path) in entries {
        desc.extend_from_slice(path.as_bytes());
        desc.push(0);
    }
    let mut note = Vec::new();
    note.extend_from_slice(&5u32.to_le_bytes()); // "CORE" and its null
    note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    note.extend_from_slice(&0x46494c45u32.to_le_bytes());
    note.extend_from_slice(b"CORE\0\0\0\0");
    note.extend_from_slice(&desc);
    while note.len() % 4 != 0 {
        note.push(0);
    }
    note
}

#[test]
fn shared_objects_come_back_through_the_file_note() {
    let scratch = Scratch::new("filenote");
    let lib = scratch.write("libX.so", elf_bytes(3, 0, &[(1, 0, &[0xabu8; 0x1000], 0x1000)]));
    let exe = scratch.write("app", elf_bytes(2, 0x401000, &[(1, 0x400000, &[0x90u8; 0x100], 0x100)]));

    let lib_str = lib.to_str().unwrap();
    let exe_str = exe.to_str().unwrap();
    let note = file_note(&[
        (0x7f0000000000, 0x7f0000001000, 0, lib_str),
        (0x7f0000001000, 0x7f0000002000, 1, lib_str), // non-header page: skipped
        (0x400000, 0x401000, 0, exe_str),
        (0x500000, 0x501000, 0, "/nonexistent/libZ.so"), // load failure: swallowed
    ]);
    let core = scratch.write("app.core", elf_bytes(4, 0, &[(4, 0, &note, note.len() as u64)]));

    let cache = ImageCache::new();
    let core_object = cache.image_for_path(&core).unwrap();

    let guessed = Task::guess_executable(&core_object, &cache).unwrap();
    assert_eq!(guessed.path, exe);

    let mut task = Task::new(Some(guessed), Some(core_object.clone()));
    task.load(&cache);

    // The library from the note is bound at its mapping start.
    let (bias, object, segment) = task.find_segment(0x7f0000000500).unwrap();
    assert_eq!(bias, 0x7f0000000000);
    assert_eq!(object.path, lib);
    assert_eq!(segment.vaddr, 0);

    // The failed path contributed nothing.
    assert!(task.find_segment(0x500500).is_none());

    // Reads resolve through the recovered library.
    let mut buf = [0u8; 4];
    assert_eq!(task.read_memory(0x7f0000000400, &mut buf).unwrap(), 4);
    assert_eq!(buf, [0xab; 4]);
}

#[test]
fn file_note_table_matches_its_announcement() {
    let scratch = Scratch::new("announce");
    let entries: &[(u64, u64, u64, &str)] = &[
        (0x1000, 0x4000, 0, "/lib/a.so"),
        (0x8000, 0x9000, 0, "/lib/b.so"),
    ];
    let note = file_note(entries);
    let core = scratch.write("t.core", elf_bytes(4, 0, &[(4, 0, &note, note.len() as u64)]));

    let cache = ImageCache::new();
    let core_object = cache.image_for_path(&core).unwrap();
    let data = core_object
        .notes()
        .find(|n| n.core_type() == Some(CoreNoteType::File))
        .unwrap()
        .data;
    let table = FileTable::new(data.as_ref(), core_object.layout()).unwrap();

    assert_eq!(table.entries.len(), entries.len());
    let expected: u64 = entries.iter().map(|e| e.1 - e.0).sum();
    assert_eq!(table.total_mapped_size(), expected);
    assert_eq!(table.entries[1].path, "/lib/b.so");
}

#[test]
fn image_cache_deduplicates_by_path() {
    let scratch = Scratch::new("dedupe");
    let exe = scratch.write("app", elf_bytes(2, 0x401000, &[(1, 0x400000, &[0u8; 16], 16)]));
    let cache = ImageCache::new();
    let first = cache.image_for_path(&exe).unwrap();
    let second = cache.image_for_path(&exe).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}
