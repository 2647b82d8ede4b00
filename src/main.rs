use clap::Parser;
use corestack::elf::ElfObject;
use corestack::error::Error;
use corestack::proc::{dump_stack_text, ImageCache, StackOptions, Task};
use log::LevelFilter;
use std::error::Error as StdError;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{io, thread, time};

#[derive(Parser)]
#[command(version, about = "print a stack trace of every thread in a core file", long_about = None)]
struct Cli {
    /// paths to a core and/or exe file
    paths: Vec<PathBuf>,

    /// executable to use by default
    #[arg(short = 'e', long)]
    executable: Option<PathBuf>,

    /// use JSON output rather than plain text
    #[arg(short = 'j', long)]
    json: bool,

    /// don't include source info
    #[arg(short = 's', long = "no-src")]
    no_src: bool,

    /// maximum number of stack frames to print for a thread
    #[arg(short = 'M', long, default_value_t = 1024)]
    max_frames: usize,

    /// repeat, with `delay` seconds between each iteration (can be
    /// non-integer)
    #[arg(short = 'b', long, value_name = "delay")]
    delay: Option<f64>,

    /// more debugging data; can be repeated
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_interrupt_handler() {
    // Only interrupt cleanly once, then terminate, in case we're stuck in
    // a loop.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_interrupt as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

fn main() -> Result<(), Box<dyn StdError>> {
    let cli = Cli::parse();
    corestack::set_verbose(cli.verbose);
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        })
        .init();
    install_interrupt_handler();

    if cli.paths.is_empty() || cli.paths.len() > 2 {
        return Err("expected a path to a core and/or exe file".into());
    }

    let cache = ImageCache::new();
    let mut exe = match &cli.executable {
        Some(path) => Some(cache.image_for_path(path)?),
        None => None,
    };
    let mut core: Option<Arc<ElfObject>> = None;
    for path in &cli.paths {
        if path.to_str().is_some_and(|s| s.parse::<i32>().is_ok()) {
            return Err("tracing a live process is not supported; pass a core file".into());
        }
        let object = cache.image_for_path(path)?;
        if object.is_core() {
            if core.is_some() {
                return Err("can't have multiple core files".into());
            }
            core = Some(object);
        } else if exe.is_none() {
            exe = Some(object);
        } else {
            return Err("can't have multiple exe files".into());
        }
    }
    let core = core.ok_or("expected one of the paths to be a core file")?;
    if exe.is_none() {
        exe = Task::guess_executable(&core, &cache);
    }

    let mut task = Task::new(exe, Some(core));
    task.load(&cache);

    if cli.verbose > 1 {
        for entry in task.aux_entries() {
            log::debug!("auxv {} = {:#x}", entry.type_name(), entry.a_val);
        }
        if let Some(table) = task.file_table() {
            for mapping in table.merged() {
                log::debug!(
                    "mapped {:#014x}..{:#014x} at offset {:#x}: {}",
                    mapping.start,
                    mapping.end,
                    mapping.file_off,
                    mapping.path
                );
            }
        }
        if let Some(core) = &task.core {
            for segment in core.loads() {
                log::debug!(
                    "load {:#014x}..{:#014x} {} ({:#x} in file)",
                    segment.vaddr,
                    segment.vaddr + segment.mem_size,
                    segment.flags(),
                    segment.file_size
                );
            }
        }
    }

    let options = StackOptions { no_src: cli.no_src };
    loop {
        print_stacks(&task, &options, cli.json, cli.max_frames)?;
        match cli.delay {
            Some(delay) if !INTERRUPTED.load(Ordering::Relaxed) => {
                thread::sleep(time::Duration::from_secs_f64(delay));
                // Drop the caches grown during this dump before the next.
                task.purge_units();
            }
            _ => break,
        }
        if INTERRUPTED.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(())
}

fn print_stacks(task: &Task, options: &StackOptions, json: bool, max_frames: usize) -> Result<(), Error> {
    let stacks = task.get_stacks(options, max_frames);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer(&mut out, &stacks).map_err(io::Error::from)?;
        writeln!(out)?;
    } else {
        match &task.core {
            Some(core) => writeln!(out, "process: {}", core.reader.describe())?,
            None => writeln!(out, "process: (no core)")?,
        }
        for stack in &stacks {
            dump_stack_text(&mut out, stack, options)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
