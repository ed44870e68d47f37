use std::{
    io::{BufReader, Read, Seek, SeekFrom},
    mem,
    ops::Range,
    slice,
};

use lz4_flex::block::get_maximum_output_size;
use tracing::{debug, trace};

use crate::{
    error::LoadError,
    page::Page,
    read_const,
    stream::{read_delta, read_packed_num},
};

pub const INDEX_VERSION: u32 = 1;
/// The index offset itself occupies the first 8 bytes, so page data starts here.
const FIRST_PAGE_POS: i64 = 8;

/// A guest memory region the snapshot is restored into.
#[derive(Debug)]
pub struct RamBlock {
    id: String,
    host_ptr: *mut u8,
    total_size: u64,
    page_size: u32,
}

// SAFETY: the constructor's contract makes the region exclusively ours to write
// for as long as the block is alive, from any thread.
unsafe impl Send for RamBlock {}
unsafe impl Sync for RamBlock {}

impl RamBlock {
    /// Describes `total_size` bytes of guest memory at `host_ptr`, split into
    /// pages of `page_size` bytes.
    ///
    /// # Safety
    /// `host_ptr..host_ptr + total_size` must stay mapped and writable for as
    /// long as any loader holding this block is alive, and nothing else may
    /// access it while pages are being loaded.
    pub unsafe fn new(
        id: impl Into<String>,
        host_ptr: *mut u8,
        total_size: u64,
        page_size: u32,
    ) -> Self {
        Self {
            id: id.into(),
            host_ptr,
            total_size,
            page_size,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.host_ptr
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn validate(&self) -> Result<(), LoadError> {
        let invalid = |reason| LoadError::InvalidBlock {
            id: self.id.clone(),
            reason,
        };
        if self.id.len() > u8::MAX as usize {
            return Err(invalid("id is longer than 255 bytes"));
        }
        if !self.page_size.is_power_of_two() {
            return Err(invalid("page size is not a power of two"));
        }
        if self.host_ptr.is_null() {
            return Err(invalid("host pointer is null"));
        }
        Ok(())
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.host_ptr as usize;
        addr >= start && ((addr - start) as u64) < self.total_size
    }

    fn page_ptr(&self, index_in_block: usize) -> *mut u8 {
        self.host_ptr
            .wrapping_add(index_in_block * self.page_size as usize)
    }
}

/// A registered block and its slice of the shared page sequence.
pub(crate) struct Block {
    pub(crate) ram_block: RamBlock,
    pub(crate) pages: Range<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexFlags(u32);

impl IndexFlags {
    pub const COMPRESSED_PAGES: Self = Self(1);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

pub(crate) struct Index {
    pub(crate) blocks: Vec<Block>,
    pub(crate) pages: Vec<Page>,
    pub(crate) flags: IndexFlags,
}

impl Index {
    pub(crate) fn compressed(&self) -> bool {
        self.flags.contains(IndexFlags::COMPRESSED_PAGES)
    }

    fn block(&self, page: &Page) -> &Block {
        &self.blocks[page.block_index as usize]
    }

    pub(crate) fn page_size(&self, index: usize) -> usize {
        self.block(&self.pages[index]).ram_block.page_size as usize
    }

    /// Host address the page at `index` is restored to.
    pub(crate) fn page_ptr(&self, index: usize) -> *mut u8 {
        let block = self.block(&self.pages[index]);
        block.ram_block.page_ptr(index - block.pages.start)
    }

    /// Finds the page whose memory contains `ptr`.
    pub(crate) fn page_at(&self, ptr: *const u8) -> Option<usize> {
        // Block counts are tiny, a scan beats anything smarter
        let block = self.blocks.iter().find(|b| b.ram_block.contains(ptr))?;
        let page_size = block.ram_block.page_size as usize;
        debug_assert!(page_size.is_power_of_two());
        let offset = ptr as usize - block.ram_block.host_ptr as usize;
        let page_start = offset & !(page_size - 1);
        let index = block.pages.start + page_start / page_size;
        (index < block.pages.end).then_some(index)
    }

    /// Guest memory of the page at `index`.
    ///
    /// # Safety
    /// The caller must own the page's fill step, so no one else writes the range.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page_memory(&self, index: usize) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.page_ptr(index), self.page_size(index)) }
    }
}

fn corrupt(reason: impl Into<String>) -> LoadError {
    LoadError::InvalidIndex(reason.into())
}

/// Parses the index section and zero-fills every page the snapshot marks as
/// empty. Every block in `ram_blocks` must appear in the file.
pub(crate) fn read_index(
    reader: impl Read + Seek,
    ram_blocks: Vec<RamBlock>,
    is_zero: &dyn Fn(&[u8]) -> bool,
) -> Result<Index, LoadError> {
    let mut reader = BufReader::new(reader);

    let index_pos = u64::from_be_bytes(read_const(&mut reader)?);
    reader.seek(SeekFrom::Start(index_pos))?;

    let version = u32::from_be_bytes(read_const(&mut reader)?);
    if version != INDEX_VERSION {
        return Err(LoadError::FormatVersionMismatch(version));
    }
    let flags = IndexFlags::from_bits(u32::from_be_bytes(read_const(&mut reader)?));
    let compressed = flags.contains(IndexFlags::COMPRESSED_PAGES);
    let page_count_hint = u32::from_be_bytes(read_const(&mut reader)?) as usize;
    debug!(index_pos, flags = flags.bits(), page_count_hint, "reading snapshot index");

    let capacity: u64 = ram_blocks
        .iter()
        .map(|b| b.total_size / u64::from(b.page_size))
        .sum();
    let mut pages = Vec::with_capacity(page_count_hint.min(capacity as usize));
    let mut blocks: Vec<Block> = ram_blocks
        .into_iter()
        .map(|ram_block| Block {
            ram_block,
            pages: 0..0,
        })
        .collect();

    let mut seen = vec![false; blocks.len()];
    let mut running_pos = FIRST_PAGE_POS;
    let mut prev_size_on_disk = 0i64;
    for _ in 0..blocks.len() {
        let [name_len] = read_const(&mut reader)?;
        let mut name = vec![0; name_len as usize];
        reader.read_exact(&mut name)?;
        let block_index = blocks
            .iter()
            .position(|b| b.ram_block.id.as_bytes() == name)
            .ok_or_else(|| LoadError::UnknownBlock(String::from_utf8_lossy(&name).into_owned()))?;
        if mem::replace(&mut seen[block_index], true) {
            return Err(corrupt(format!(
                "block '{}' is listed more than once",
                blocks[block_index].ram_block.id
            )));
        }
        let block = &mut blocks[block_index];
        let ram_block = &block.ram_block;
        let page_size = i64::from(ram_block.page_size);
        let max_compressed = get_maximum_output_size(ram_block.page_size as usize) as u64;

        let block_pages = u32::from_be_bytes(read_const(&mut reader)?);
        if u64::from(block_pages) * u64::from(ram_block.page_size) > ram_block.total_size {
            return Err(corrupt(format!(
                "block '{}' has {block_pages} pages but only {} bytes",
                ram_block.id, ram_block.total_size
            )));
        }
        trace!(block = %ram_block.id, block_pages, "reading block");

        let begin = pages.len();
        for i in 0..block_pages as usize {
            let size = read_packed_num(&mut reader)?;
            if size == 0 {
                // SAFETY: registered memory is ours and not yet watched
                let memory = unsafe {
                    slice::from_raw_parts_mut(ram_block.page_ptr(i), ram_block.page_size as usize)
                };
                if !is_zero(memory) {
                    memory.fill(0);
                }
                pages.push(Page::zeroed(block_index as u16));
                continue;
            }

            let mut delta = read_delta(&mut reader)?;
            let size_on_disk = if compressed {
                if size > max_compressed {
                    return Err(corrupt(format!(
                        "compressed page of {size} bytes can't expand to {page_size}"
                    )));
                }
                delta = delta
                    .checked_add(prev_size_on_disk)
                    .ok_or_else(|| corrupt("page position overflows"))?;
                size
            } else {
                if size != 1 {
                    return Err(corrupt(format!(
                        "uncompressed page spans {size} pages on disk"
                    )));
                }
                delta = delta
                    .checked_mul(page_size)
                    .ok_or_else(|| corrupt("page position overflows"))?;
                size * page_size as u64
            };
            let size_on_disk = u32::try_from(size_on_disk)
                .map_err(|_| corrupt(format!("page size on disk {size_on_disk} is too large")))?;
            running_pos = running_pos
                .checked_add(delta)
                .filter(|pos| *pos >= FIRST_PAGE_POS)
                .ok_or_else(|| corrupt("page position is out of range"))?;
            prev_size_on_disk = i64::from(size_on_disk);
            pages.push(Page::new(
                block_index as u16,
                size_on_disk,
                running_pos as u64,
            ));
        }
        block.pages = begin..pages.len();
        debug_assert_eq!(block.pages.len(), block_pages as usize);
    }

    Ok(Index {
        blocks,
        pages,
        flags,
    })
}
