//! Post-mortem stack tracing for ELF core files.
//!
//! The layers, bottom up:
//! * [`elf`] understands the container format: segments, sections, notes,
//!   and random access byte sources over mapped or in-memory images.
//! * [`debug`] understands the DWARF sections of an executable: compilation
//!   units, debug-info entries, line number programs.
//! * [`proc`] ties a core file and its executables together into a [`proc::Task`]
//!   whose memory can be read by virtual address and whose threads can be
//!   walked into stacks.
pub mod debug;
pub mod elf;
pub mod error;
pub mod proc;

pub use error::{Error, Result};

use std::sync::atomic::{AtomicU8, Ordering};

// Verbosity is set once at startup and only ever read afterwards.
static VERBOSE: AtomicU8 = AtomicU8::new(0);

/// Set the global verbosity counter (the number of `-v` flags).
pub fn set_verbose(level: u8) {
    VERBOSE.store(level, Ordering::Relaxed);
}

pub fn verbose() -> u8 {
    VERBOSE.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) mod testimage;
