#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{self, Write},
    ptr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use snapram::{
    AlignedPage, INDEX_VERSION, IndexFlags, PAGE_SIZE, PageSource, RamBlock,
    stream::{write_delta, write_packed_num},
    watch::{
        AccessCallback, AccessWatchFactory, IdleCallback, IdleCallbackResult, MemoryAccessWatch,
        PageFiller,
    },
};

/// Recognizable, partly compressible page contents.
pub fn page_pattern(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| {
            if i < PAGE_SIZE / 2 {
                seed
            } else {
                (i as u8).wrapping_mul(31).wrapping_add(seed)
            }
        })
        .collect()
}

#[derive(Clone)]
pub enum PageData {
    /// All zero, stored as size 0 without any data on disk.
    Empty,
    Contents(Vec<u8>),
    /// Stored on disk verbatim even in compressed snapshots.
    Corrupt(Vec<u8>),
}

/// Reference snapshot encoder.
pub struct SnapshotBuilder {
    compressed: bool,
    reversed: bool,
    version: u32,
    blocks: Vec<(String, Vec<PageData>)>,
}

pub struct Snapshot {
    pub bytes: Vec<u8>,
    /// File position of every page in index order, `None` for empty pages.
    pub positions: Vec<Option<u64>>,
}

impl Snapshot {
    pub fn data_positions(&self) -> impl Iterator<Item = u64> + '_ {
        self.positions.iter().flatten().copied()
    }
}

impl SnapshotBuilder {
    pub fn new(compressed: bool) -> Self {
        Self {
            compressed,
            reversed: false,
            version: INDEX_VERSION,
            blocks: Vec::new(),
        }
    }

    /// Lays out page data in reverse index order, so position deltas go negative.
    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn block(mut self, id: &str, pages: Vec<PageData>) -> Self {
        self.blocks.push((id.to_owned(), pages));
        self
    }

    pub fn build(&self) -> Snapshot {
        let pages: Vec<&PageData> = self.blocks.iter().flat_map(|(_, p)| p).collect();
        let payloads: Vec<Option<Vec<u8>>> = pages
            .iter()
            .map(|page| match page {
                PageData::Empty => None,
                PageData::Contents(data) if self.compressed => {
                    Some(lz4_flex::block::compress(data))
                }
                PageData::Contents(data) => {
                    assert_eq!(data.len(), PAGE_SIZE);
                    Some(data.clone())
                }
                PageData::Corrupt(data) => Some(data.clone()),
            })
            .collect();

        let mut disk_order: Vec<usize> = (0..pages.len())
            .filter(|&i| payloads[i].is_some())
            .collect();
        if self.reversed {
            disk_order.reverse();
        }

        let mut bytes = vec![0u8; 8];
        let mut positions = vec![None; pages.len()];
        for i in disk_order {
            positions[i] = Some(bytes.len() as u64);
            bytes.extend(payloads[i].as_deref().unwrap_or_default());
        }

        let index_pos = bytes.len() as u64;
        bytes[..8].copy_from_slice(&index_pos.to_be_bytes());
        let flags = if self.compressed {
            IndexFlags::COMPRESSED_PAGES
        } else {
            IndexFlags::default()
        };
        bytes.write_all(&self.version.to_be_bytes()).unwrap();
        bytes.write_all(&flags.bits().to_be_bytes()).unwrap();
        bytes.write_all(&(pages.len() as u32).to_be_bytes()).unwrap();

        let mut running = 8i64;
        let mut prev_size = 0i64;
        let mut i = 0;
        for (id, block_pages) in &self.blocks {
            bytes.push(id.len() as u8);
            bytes.write_all(id.as_bytes()).unwrap();
            bytes.write_all(&(block_pages.len() as u32).to_be_bytes()).unwrap();
            for _ in block_pages {
                let (Some(pos), Some(payload)) = (positions[i], &payloads[i]) else {
                    write_packed_num(&mut bytes, 0).unwrap();
                    i += 1;
                    continue;
                };
                let pos = pos as i64;
                if self.compressed {
                    write_packed_num(&mut bytes, payload.len() as u64).unwrap();
                    write_delta(&mut bytes, pos - running - prev_size).unwrap();
                    prev_size = payload.len() as i64;
                } else {
                    write_packed_num(&mut bytes, 1).unwrap();
                    write_delta(&mut bytes, (pos - running) / PAGE_SIZE as i64).unwrap();
                }
                running = pos;
                i += 1;
            }
        }

        Snapshot { bytes, positions }
    }
}

/// In-memory snapshot that counts reads per offset.
pub struct CountingSource {
    data: Vec<u8>,
    reads: Mutex<HashMap<u64, usize>>,
}

impl CountingSource {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            reads: Mutex::default(),
        })
    }

    pub fn reads_at(&self, pos: u64) -> usize {
        self.reads.lock().unwrap().get(&pos).copied().unwrap_or(0)
    }
}

impl PageSource for CountingSource {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        *self.reads.lock().unwrap().entry(offset).or_default() += 1;
        self.data.read_at(buf, offset)
    }
}

/// Page-aligned stand-in for one RAM block's guest memory.
pub struct Guest(Vec<AlignedPage>);

impl Guest {
    pub fn new(pages: usize) -> Self {
        Self(vec![AlignedPage::default(); pages])
    }

    pub fn filled(pages: usize, byte: u8) -> Self {
        let mut guest = Self::new(pages);
        for page in &mut guest.0 {
            page.fill(byte);
        }
        guest
    }

    pub fn base(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }

    pub fn page_ptr(&mut self, i: usize) -> *mut u8 {
        self.base().wrapping_add(i * PAGE_SIZE)
    }

    pub fn block(&mut self, id: &str) -> RamBlock {
        let size = (self.0.len() * PAGE_SIZE) as u64;
        unsafe { RamBlock::new(id, self.base(), size, PAGE_SIZE as u32) }
    }

    pub fn page(&self, i: usize) -> &[u8] {
        &self.0[i][..]
    }
}

/// Shared side of a [`FakeWatch`], kept by the factory so tests can raise
/// faults and drive the idle loop by hand.
pub struct FakeWatchState {
    valid: bool,
    on_access: AccessCallback,
    on_idle: Mutex<IdleCallback>,
    ranges: Mutex<Vec<(usize, usize)>>,
    done_registering: AtomicBool,
    fills: Mutex<HashMap<usize, usize>>,
}

impl FakeWatchState {
    /// Simulates a first access to `ptr`.
    pub fn touch(&self, ptr: *mut u8) {
        (self.on_access)(ptr, self);
    }

    pub fn run_idle(&self) -> IdleCallbackResult {
        let mut on_idle = self.on_idle.lock().unwrap();
        (*on_idle)(self)
    }

    /// Calls the idle callback until it reports AllDone.
    pub fn drive_to_completion(&self) {
        for _ in 0..1_000_000 {
            match self.run_idle() {
                IdleCallbackResult::AllDone => return,
                IdleCallbackResult::RunAgain => {}
                IdleCallbackResult::Wait => thread::sleep(Duration::from_micros(100)),
            }
        }
        panic!("background loading never finished");
    }

    pub fn ranges(&self) -> Vec<(usize, usize)> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn is_done_registering(&self) -> bool {
        self.done_registering.load(Ordering::Acquire)
    }

    pub fn fills_at(&self, ptr: *mut u8) -> usize {
        self.fills.lock().unwrap().get(&(ptr as usize)).copied().unwrap_or(0)
    }
}

impl PageFiller for FakeWatchState {
    fn fill_page(&self, dst: *mut u8, data: &[u8]) -> io::Result<()> {
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        *self.fills.lock().unwrap().entry(dst as usize).or_default() += 1;
        Ok(())
    }
}

pub struct FakeWatch(Arc<FakeWatchState>);

impl MemoryAccessWatch for FakeWatch {
    fn valid(&self) -> bool {
        self.0.valid
    }

    fn register_memory_range(&mut self, start: *mut u8, len: usize) -> io::Result<()> {
        self.0.ranges.lock().unwrap().push((start as usize, len));
        Ok(())
    }

    fn done_registering(&mut self) -> io::Result<()> {
        self.0.done_registering.store(true, Ordering::Release);
        Ok(())
    }
}

pub struct FakeWatchFactory {
    supported: bool,
    valid: bool,
    created: Mutex<Option<Arc<FakeWatchState>>>,
}

impl FakeWatchFactory {
    pub fn new() -> Arc<Self> {
        Self::with(true, true)
    }

    pub fn with(supported: bool, valid: bool) -> Arc<Self> {
        Arc::new(Self {
            supported,
            valid,
            created: Mutex::default(),
        })
    }

    /// The watch the loader created, if any.
    pub fn watch(&self) -> Option<Arc<FakeWatchState>> {
        self.created.lock().unwrap().clone()
    }
}

impl AccessWatchFactory for FakeWatchFactory {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn create(
        &self,
        on_access: AccessCallback,
        on_idle: IdleCallback,
    ) -> Box<dyn MemoryAccessWatch> {
        let state = Arc::new(FakeWatchState {
            valid: self.valid,
            on_access,
            on_idle: Mutex::new(on_idle),
            ranges: Mutex::default(),
            done_registering: AtomicBool::new(false),
            fills: Mutex::default(),
        });
        *self.created.lock().unwrap() = Some(Arc::clone(&state));
        Box::new(FakeWatch(state))
    }
}

pub fn never_zero(_: &[u8]) -> bool {
    false
}
