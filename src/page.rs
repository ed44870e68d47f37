use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU8, Ordering},
    thread,
};

pub const PAGE_SIZE: usize = 1024 * 4;
pub type RawPage = [u8; PAGE_SIZE];

/// Busy-wait iterations before a waiting thread starts yielding.
const SPIN_LIMIT: u32 = 64;

#[repr(align(64), C)]
#[derive(PartialEq, Eq, Clone, Copy, bytemuck::AnyBitPattern, bytemuck::NoUninit)]
pub struct AlignedPage(RawPage);
pub const ZERO_PAGE: AlignedPage = AlignedPage([0; PAGE_SIZE]);

impl Default for AlignedPage {
    fn default() -> Self {
        ZERO_PAGE
    }
}

impl Deref for AlignedPage {
    type Target = RawPage;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AlignedPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AlignedPage {
    pub fn is_zero(&self) -> bool {
        is_zero_range(&self.0)
    }
}

/// Default zero checker: true when every byte of `range` is zero.
pub fn is_zero_range(range: &[u8]) -> bool {
    // Word-sized compares over the aligned middle optimize far better than a byte loop
    let (head, words, tail) = bytemuck::pod_align_to::<u8, u64>(range);
    head.iter().all(|&b| b == 0) && words.iter().all(|&w| w == 0) && tail.iter().all(|&b| b == 0)
}

/// Loading lifecycle of a single page. The numeric order matters: every state
/// at or after `Read` means the disk read is over.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageState {
    Empty = 0,
    Reading = 1,
    Read = 2,
    Filling = 3,
    Filled = 4,
    Error = 5,
}

impl PageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Empty,
            1 => Self::Reading,
            2 => Self::Read,
            3 => Self::Filling,
            4 => Self::Filled,
            _ => Self::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Error)
    }
}

/// Per-page index entry. Lives in the index's single page sequence and refers
/// to its block by position.
pub(crate) struct Page {
    state: AtomicU8,
    pub(crate) block_index: u16,
    pub(crate) size_on_disk: u32,
    pub(crate) file_pos: u64,
    data: UnsafeCell<Option<Box<[u8]>>>,
}

// SAFETY: `data` is written only by the thread that moved the page into
// `Reading` and taken only by the thread that moved it into `Filling`. Both
// moves are compare-and-set, so at most one thread touches the slot at a time,
// and the Release store of `Read` publishes the write to the Acquire CAS that
// claims `Filling`.
unsafe impl Sync for Page {}

impl Page {
    pub(crate) fn new(block_index: u16, size_on_disk: u32, file_pos: u64) -> Self {
        Self {
            state: AtomicU8::new(PageState::Empty as u8),
            block_index,
            size_on_disk,
            file_pos,
            data: UnsafeCell::new(None),
        }
    }

    /// An all-zero page that was materialized while reading the index.
    pub(crate) fn zeroed(block_index: u16) -> Self {
        let page = Self::new(block_index, 0, 0);
        page.state.store(PageState::Filled as u8, Ordering::Relaxed);
        page
    }

    pub(crate) fn is_empty_on_disk(&self) -> bool {
        self.size_on_disk == 0
    }

    pub(crate) fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically moves `from -> to`, returning the observed state on failure.
    pub(crate) fn transition(&self, from: PageState, to: PageState) -> Result<(), PageState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(PageState::from_u8)
    }

    /// Only valid for the thread that owns the current transitional state.
    pub(crate) fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Spins until `pending` stops holding for the observed state.
    pub(crate) fn wait_while(&self, mut pending: impl FnMut(PageState) -> bool) -> PageState {
        let mut spins = 0;
        loop {
            let state = self.state();
            if !pending(state) {
                return state;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    /// Stores the freshly read contents.
    ///
    /// # Safety
    /// The caller must be the thread that moved this page into `Reading` and
    /// must not have published `Read` yet.
    pub(crate) unsafe fn put_data(&self, data: Box<[u8]>) {
        unsafe { *self.data.get() = Some(data) };
    }

    /// Takes the buffer stored by [`Page::put_data`], leaving the slot empty.
    ///
    /// # Safety
    /// The caller must be the thread that moved this page from `Read` into
    /// `Filling`.
    pub(crate) unsafe fn take_data(&self) -> Option<Box<[u8]>> {
        unsafe { (*self.data.get()).take() }
    }
}
