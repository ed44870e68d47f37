mod config;
pub mod decompress;
mod error;
mod index;
mod loader;
mod page;
mod source;
pub mod stream;
pub mod watch;

pub use crate::{
    config::{LoadType, LoaderConfig},
    error::{DecompressError, LoadError},
    index::{INDEX_VERSION, IndexFlags, RamBlock},
    loader::{RamLoader, ZeroChecker},
    page::{AlignedPage, PAGE_SIZE, PageState, ZERO_PAGE, is_zero_range},
    source::PageSource,
};
use std::io::{self, Read};

fn read_const<const N: usize>(mut reader: impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
