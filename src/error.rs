//! Error kinds for the whole crate. Low level readers fail loudly (short or
//! malformed data is fatal to the current operation); the resolvers above
//! them treat absence (no attribute, no unit, no match) as recoverable and
//! report partial results instead of an error.
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The file is not the ELF we expected (bad magic, bad version, etc).
    #[error("{0}")]
    BadElf(String),

    /// A read ran past the end of the underlying byte source.
    #[error("out of bounds read at offset {offset:#x} in {source_name}")]
    OutOfBounds { offset: u64, source_name: String },

    /// A segment claimed more file bytes than the core actually has.
    #[error("unexpected short read in core file ({0})")]
    TruncatedCore(String),

    /// `get_registers` was asked about a thread the core doesn't know.
    #[error("no thread with lwp id {0}")]
    NoSuchLwp(i32),

    /// A code address that no snapshot or loaded-object segment covers.
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),

    /// The object covering an address carries no usable debug info.
    #[error("{} has no debug info", .0.display())]
    NoDebugInfo(PathBuf),

    /// Malformed DWARF. Includes the unknown-unit-kind case, which is fatal.
    #[error("bad debug info: {0}")]
    BadDwarf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn require(predicate: bool, err: impl FnOnce() -> Error) -> Result<()> {
    if predicate { Ok(()) } else { Err(err()) }
}
