//! Stack reconstruction. The walker follows the chain of saved frame
//! pointers: on x86-64 each frame stores the caller's rbp at `[rbp]` and
//! the return address at `[rbp + 8]`. Its only inputs are the task's
//! registers and its memory reads.
use super::Task;
use crate::elf::signal_name;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// What the stack printers should include.
#[derive(Clone, Copy, Default)]
pub struct StackOptions {
    /// Leave out source file and line info.
    pub no_src: bool,
}

#[derive(Serialize)]
pub struct Frame {
    pub ip: u64,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceInfo>,
}

#[derive(Serialize)]
pub struct SourceInfo {
    pub file: String,
    pub line: u32,
}

#[derive(Serialize)]
pub struct ThreadStack {
    pub lwp_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<&'static str>,
    pub frames: Vec<Frame>,
}

// Sanity bounds for the frame-pointer chain. Frames grow toward higher
// addresses as we unwind; anything else is a corrupt or omitted frame
// pointer.
const MAX_FRAME_SIZE: u64 = 1024 * 1024;

impl Task {
    /// Reconstruct every thread's stack, at most `max_frames` deep each.
    pub fn get_stacks(&self, options: &StackOptions, max_frames: usize) -> Vec<ThreadStack> {
        self.lwps()
            .map(|lwp| {
                let frames = self.walk_stack(lwp.registers.get_ip(), lwp.registers.get_frame_stack_top(), max_frames);
                ThreadStack {
                    lwp_id: lwp.id,
                    signal: if lwp.current_signal != 0 {
                        Some(signal_name(lwp.current_signal))
                    } else {
                        None
                    },
                    frames: frames
                        .into_iter()
                        .enumerate()
                        .map(|(i, ip)| self.symbolize_frame(ip, i > 0, options))
                        .collect(),
                }
            })
            .collect()
    }

    fn walk_stack(&self, ip: u64, mut bp: u64, max_frames: usize) -> Vec<u64> {
        let mut ips = vec![ip];
        while ips.len() < max_frames {
            if bp == 0 || bp % 8 != 0 {
                break;
            }
            // [bp] is the saved frame pointer, [bp + 8] the return address.
            let (saved_bp, ret) = match (self.read_word_at(bp), self.read_word_at(bp + 8)) {
                (Some(saved_bp), Some(ret)) => (saved_bp, ret),
                // An unmapped address ends the stack.
                _ => break,
            };
            if ret == 0 {
                break;
            }
            ips.push(ret);
            if saved_bp <= bp || saved_bp - bp > MAX_FRAME_SIZE {
                break;
            }
            bp = saved_bp;
        }
        ips
    }

    fn read_word_at(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        match self.read_memory(addr, &mut buf) {
            Ok(8) => Some(u64::from_le_bytes(buf)),
            _ => None,
        }
    }

    fn symbolize_frame(&self, ip: u64, is_return_address: bool, options: &StackOptions) -> Frame {
        // A return address points after the call; back the lookup up one
        // byte so it lands inside the calling instruction.
        let lookup = if is_return_address { ip - 1 } else { ip };
        let function = self.function_for_pc(lookup).unwrap_or_else(|| "??".to_string());
        let source = if options.no_src {
            None
        } else {
            match self.source_for_pc(lookup) {
                Ok((file, line)) => Some(SourceInfo { file, line }),
                // Missing debug info is the common case, not a failure.
                Err(_) => None,
            }
        };
        Frame { ip, function, source }
    }
}

/// The plain-text printer.
pub fn dump_stack_text(
    out: &mut dyn Write,
    stack: &ThreadStack,
    _options: &StackOptions,
) -> Result<()> {
    match stack.signal {
        Some(signal) => writeln!(out, "thread: {} (current signal {signal})", stack.lwp_id)?,
        None => writeln!(out, "thread: {}", stack.lwp_id)?,
    }
    for (i, frame) in stack.frames.iter().enumerate() {
        match &frame.source {
            Some(source) => writeln!(
                out,
                "#{i:<3} {:#018x} in {} at {}:{}",
                frame.ip, frame.function, source.file, source.line
            )?,
            None => writeln!(out, "#{i:<3} {:#018x} in {}", frame.ip, frame.function)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ImageCache;
    use crate::testimage::{prstatus_bytes, ImageBuilder, REG_RBP, REG_RIP};

    fn walkable_task() -> Task {
        // A stack at 0x7ff000 with two frame records and a terminator.
        let mut stack = vec![0u8; 0x100];
        for (at, value) in [
            (0x10, 0x7ff040u64), // saved rbp of frame 0
            (0x18, 0x401110),    // return into middle
            (0x40, 0x7ff080),    // saved rbp of frame 1
            (0x48, 0x401210),    // return into main
        ] {
            stack[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        let core = ImageBuilder::core()
            .segment(0x7ff000, stack, 0x100, 6)
            .note(
                "CORE",
                1,
                prstatus_bytes(321, 6, &[(REG_RIP, 0x401050), (REG_RBP, 0x7ff010)]),
            )
            .build_object();
        let exe = ImageBuilder::exec()
            .segment(0x401000, vec![0x90; 0x300], 0x300, 5)
            .func_symbols(&[
                ("leaf", 0x401000, 0x100),
                ("middle", 0x401100, 0x100),
                ("main", 0x401200, 0x100),
            ])
            .build_object();
        let mut task = Task::new(Some(exe), Some(core));
        task.load(&ImageCache::new());
        task
    }

    #[test]
    fn walks_the_frame_pointer_chain() {
        let task = walkable_task();
        let stacks = task.get_stacks(&StackOptions::default(), 64);
        assert_eq!(stacks.len(), 1);
        let stack = &stacks[0];
        assert_eq!(stack.lwp_id, 321);
        assert_eq!(stack.signal, Some("SIGABRT"));

        let names: Vec<&str> = stack.frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["leaf", "middle", "main"]);
        let ips: Vec<u64> = stack.frames.iter().map(|f| f.ip).collect();
        assert_eq!(ips, vec![0x401050, 0x401110, 0x401210]);
        // No debug info in the synthetic exe: frames carry no source.
        assert!(stack.frames.iter().all(|f| f.source.is_none()));
    }

    #[test]
    fn max_frames_caps_the_walk() {
        let task = walkable_task();
        let stacks = task.get_stacks(&StackOptions::default(), 2);
        assert_eq!(stacks[0].frames.len(), 2);
    }

    #[test]
    fn unmapped_frame_pointer_ends_the_stack() {
        let core = ImageBuilder::core()
            .note("CORE", 1, prstatus_bytes(1, 0, &[(REG_RIP, 0x401050), (REG_RBP, 0xdead000)]))
            .build_object();
        let mut task = Task::new(None, Some(core));
        task.load(&ImageCache::new());
        let stacks = task.get_stacks(&StackOptions::default(), 64);
        assert_eq!(stacks[0].frames.len(), 1);
        assert_eq!(stacks[0].frames[0].function, "??");
        assert_eq!(stacks[0].signal, None);
    }

    #[test]
    fn text_format() {
        let stack = ThreadStack {
            lwp_id: 7,
            signal: Some("SIGABRT"),
            frames: vec![
                Frame {
                    ip: 0x401234,
                    function: "main".to_string(),
                    source: Some(SourceInfo { file: "main.c".to_string(), line: 10 }),
                },
                Frame { ip: 0x401300, function: "??".to_string(), source: None },
            ],
        };
        let mut out = Vec::new();
        dump_stack_text(&mut out, &stack, &StackOptions::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("thread: 7 (current signal SIGABRT)"));
        assert!(text.contains("in main at main.c:10"));
        assert!(text.contains("in ??\n"));
    }

    #[test]
    fn json_shape() {
        let stack = ThreadStack {
            lwp_id: 1,
            signal: None,
            frames: vec![Frame { ip: 16, function: "f".to_string(), source: None }],
        };
        let json = serde_json::to_value(&stack).unwrap();
        assert_eq!(json["lwp_id"], 1);
        assert_eq!(json["frames"][0]["ip"], 16);
        assert!(json["frames"][0].get("source").is_none());
        assert!(json.get("signal").is_none());
    }
}
