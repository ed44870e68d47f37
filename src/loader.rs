use std::{
    io, mem,
    sync::{
        Arc, OnceLock,
        mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    config::{LoadType, LoaderConfig},
    decompress::{DecompressPool, decompress_page},
    error::LoadError,
    index::{Index, RamBlock, read_index},
    page::{AlignedPage, PAGE_SIZE, PageState},
    source::{PageSource, SourceReader, read_full_at},
    watch::{
        AccessCallback, AccessWatchFactory, IdleCallback, IdleCallbackResult, MemoryAccessWatch,
        PageFiller,
    },
};

/// Reports whether a guest memory range already holds only zeroes.
pub type ZeroChecker = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// At least `lz4_flex::block::get_maximum_output_size(PAGE_SIZE)`, the
/// largest compressed size the index accepts for a 4 KiB page.
const COMPRESSED_STACK_BUF: usize = PAGE_SIZE + PAGE_SIZE / 8;

/// A page for the reader thread, or `None` once every page was handed out.
type ReadRequest = Option<usize>;

enum ReadResult {
    Loaded(usize),
    Failed(LoadError),
    AllLoaded,
}

/// Consumer-side ends of the reader thread's queues plus the scan cursor.
/// Dropping them is what stops the reader.
struct BackgroundQueues {
    requests: SyncSender<ReadRequest>,
    results: Receiver<ReadResult>,
    capacity: usize,
    next_page: usize,
    sent_end_marker: bool,
}

/// A compressed page read during an eager load, waiting to be unpacked.
struct UnpackJob {
    index: usize,
    data: Box<[u8]>,
}

struct Shared {
    source: Box<dyn PageSource>,
    index: Index,
    queues: Mutex<Option<BackgroundQueues>>,
    failure: OnceLock<LoadError>,
    complete: Mutex<bool>,
    completed: Condvar,
    started_at: Instant,
}

/// Restores guest RAM from one snapshot.
///
/// Register every RAM block, then call [`RamLoader::start_loading`] once.
/// Without a usable access watch every page is read before `start_loading`
/// returns. With one, pages load on first access and in the background while
/// the watch drives the idle callback. Dropping the loader stops background
/// work before the snapshot source is released.
pub struct RamLoader {
    source: Option<Box<dyn PageSource>>,
    blocks: Vec<RamBlock>,
    zero_checker: ZeroChecker,
    config: LoaderConfig,
    watch_factory: Option<Arc<dyn AccessWatchFactory>>,
    started: bool,
    shared: Option<Arc<Shared>>,
    watch: Option<Box<dyn MemoryAccessWatch>>,
    reader: Option<JoinHandle<()>>,
}

impl RamLoader {
    pub fn new(
        source: impl PageSource + 'static,
        zero_checker: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: Some(Box::new(source)),
            blocks: Vec::new(),
            zero_checker: Box::new(zero_checker),
            config: LoaderConfig::default(),
            watch_factory: None,
            started: false,
            shared: None,
            watch: None,
            reader: None,
        }
    }

    pub fn with_config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads lazily through watches made by `factory` when it is supported.
    pub fn with_access_watch(mut self, factory: Arc<dyn AccessWatchFactory>) -> Self {
        self.watch_factory = Some(factory);
        self
    }

    pub fn register_block(&mut self, block: RamBlock) -> Result<(), LoadError> {
        if self.started {
            return Err(LoadError::AlreadyStarted);
        }
        block.validate()?;
        let reject = |reason| LoadError::InvalidBlock {
            id: block.id().to_owned(),
            reason,
        };
        if self.blocks.len() > u16::MAX as usize {
            return Err(reject("too many RAM blocks"));
        }
        if self.blocks.iter().any(|b| b.id() == block.id()) {
            return Err(reject("id is already registered"));
        }
        debug!(
            id = block.id(),
            size = block.total_size(),
            page_size = block.page_size(),
            "registered RAM block"
        );
        self.blocks.push(block);
        Ok(())
    }

    /// Reads the snapshot index and starts loading pages. Can only run once.
    #[tracing::instrument(skip_all)]
    pub fn start_loading(&mut self) -> Result<(), LoadError> {
        let source = self.source.take().ok_or(LoadError::AlreadyStarted)?;
        self.started = true;

        let blocks = mem::take(&mut self.blocks);
        let index = info_span!("read_index")
            .in_scope(|| read_index(SourceReader::new(&*source), blocks, &*self.zero_checker))?;
        info!(
            blocks = index.blocks.len(),
            pages = index.pages.len(),
            compressed = index.compressed(),
            "read snapshot index"
        );

        let shared = Arc::new(Shared {
            source,
            index,
            queues: Mutex::new(None),
            failure: OnceLock::new(),
            complete: Mutex::new(false),
            completed: Condvar::new(),
            started_at: Instant::now(),
        });
        self.shared = Some(Arc::clone(&shared));

        let watch = match self.config.load_type {
            LoadType::Eager => None,
            LoadType::Lazy => self.create_watch(&shared).unwrap_or_else(|err| {
                warn!(error = %err, "falling back to synchronous RAM loading");
                None
            }),
        };
        match watch {
            Some(watch) => self.start_background(shared, watch),
            None => shared.read_all_pages(&self.config),
        }
    }

    /// `Ok(None)` when there is no usable watch kind and the load is eager.
    fn create_watch(
        &self,
        shared: &Arc<Shared>,
    ) -> Result<Option<Box<dyn MemoryAccessWatch>>, LoadError> {
        let Some(factory) = &self.watch_factory else {
            return Ok(None);
        };
        if !factory.is_supported() {
            debug!("memory access watch is not supported, loading eagerly");
            return Ok(None);
        }

        let on_access: AccessCallback = {
            let shared = Arc::clone(shared);
            Box::new(move |ptr: *mut u8, filler: &dyn PageFiller| shared.handle_fault(ptr, filler))
        };
        let on_idle: IdleCallback = {
            let shared = Arc::clone(shared);
            Box::new(move |filler: &dyn PageFiller| shared.background_page_load(filler))
        };
        let watch = factory.create(on_access, on_idle);
        if !watch.valid() {
            return Err(LoadError::FaultWatchInitFailure);
        }
        Ok(Some(watch))
    }

    #[tracing::instrument(skip_all)]
    fn start_background(
        &mut self,
        shared: Arc<Shared>,
        watch: Box<dyn MemoryAccessWatch>,
    ) -> Result<(), LoadError> {
        let watch = self.watch.insert(watch);
        register_page_watches(&shared.index, &mut **watch)?;

        let capacity = self.config.queue_capacity();
        let (requests, request_rx) = mpsc::sync_channel(capacity);
        let (result_tx, results) = mpsc::sync_channel(capacity);
        *shared.lock_queues() = Some(BackgroundQueues {
            requests,
            results,
            capacity,
            next_page: 0,
            sent_end_marker: false,
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("snapram-reader".into())
            .spawn(move || reader_worker(&reader_shared, request_rx, result_tx))?;
        self.reader = Some(reader);

        watch.done_registering()?;
        Ok(())
    }

    pub fn was_started(&self) -> bool {
        self.started
    }

    /// True once any page failed to load; the restore can't succeed anymore.
    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    /// The first failure recorded by any loading path.
    pub fn error(&self) -> Option<&LoadError> {
        self.shared.as_ref()?.failure.get()
    }

    /// True when eager loading finished or background loading reported done.
    pub fn is_complete(&self) -> bool {
        self.shared.as_ref().is_some_and(|shared| shared.is_complete())
    }

    /// Blocks until [`RamLoader::is_complete`]. Lazy loads only complete while
    /// something keeps driving the watch's idle callback.
    pub fn wait_for_completion(&self) {
        let Some(shared) = &self.shared else {
            return;
        };
        let mut complete = shared.complete.lock();
        while !*complete {
            shared.completed.wait(&mut complete);
        }
    }

    /// Loading state of the page containing `ptr`, if it is a snapshot page.
    pub fn page_state(&self, ptr: *const u8) -> Option<PageState> {
        let index = &self.shared.as_ref()?.index;
        index.page_at(ptr).map(|i| index.pages[i].state())
    }

    /// Stops both background queues, which ends the reader thread.
    pub fn interrupt_reading(&self) {
        if let Some(shared) = &self.shared {
            shared.stop_queues();
            shared.mark_complete();
        }
    }
}

impl Drop for RamLoader {
    fn drop(&mut self) {
        self.interrupt_reading();
        drop(self.watch.take());
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            error!("background reader panicked");
        }
    }
}

/// Registers non-empty pages with the watch, merging pages that are adjacent
/// in host memory into one range.
fn register_page_watches(
    index: &Index,
    watch: &mut dyn MemoryAccessWatch,
) -> Result<(), LoadError> {
    let mut register = |start: usize, len: usize| {
        debug!(start, len, "watching memory range");
        watch
            .register_memory_range(start as *mut u8, len)
            .map_err(|source| LoadError::RegisterRange { start, len, source })
    };

    let mut range: Option<(usize, usize)> = None;
    for (i, page) in index.pages.iter().enumerate() {
        if page.is_empty_on_disk() {
            continue;
        }
        let ptr = index.page_ptr(i) as usize;
        let size = index.page_size(i);
        if let Some((start, len)) = range.as_mut()
            && *start + *len == ptr
        {
            *len += size;
            continue;
        }
        if let Some((start, len)) = range.replace((ptr, size)) {
            register(start, len)?;
        }
    }
    if let Some((start, len)) = range {
        register(start, len)?;
    }
    Ok(())
}

fn reader_worker(
    shared: &Shared,
    requests: Receiver<ReadRequest>,
    results: SyncSender<ReadResult>,
) {
    while let Ok(request) = requests.recv() {
        let Some(index) = request else {
            let _ = results.send(ReadResult::AllLoaded);
            break;
        };
        let result = match shared.read_for_background(index) {
            Ok(true) => ReadResult::Loaded(index),
            // A fault got there first and finishes the page itself
            Ok(false) => continue,
            Err(err) => ReadResult::Failed(err),
        };
        if results.send(result).is_err() {
            break;
        }
    }
    debug!("background reader finished");
}

impl Shared {
    fn lock_queues(&self) -> MutexGuard<'_, Option<BackgroundQueues>> {
        self.queues.lock()
    }

    fn stop_queues(&self) {
        let queues = self.lock_queues().take();
        drop(queues);
    }

    fn is_complete(&self) -> bool {
        *self.complete.lock()
    }

    fn mark_complete(&self) {
        let mut complete = self.complete.lock();
        if !*complete {
            *complete = true;
            info!(
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "RAM loading complete"
            );
            self.completed.notify_all();
        }
    }

    fn record_failure(&self, err: LoadError) {
        error!(error = %err, "snapshot RAM loading failed");
        let _ = self.failure.set(err);
    }

    fn has_failed(&self) -> bool {
        self.failure.get().is_some()
    }

    fn page_addr(&self, index: usize) -> usize {
        self.index.page_ptr(index) as usize
    }

    /// Reads the page's bytes from the source into `buf`, which must be
    /// exactly the page's on-disk size.
    fn read_page_bytes(&self, index: usize, buf: &mut [u8]) -> Result<(), LoadError> {
        let pos = self.index.pages[index].file_pos;
        let got = read_full_at(&*self.source, buf, pos)?;
        if got != buf.len() {
            return Err(LoadError::ShortRead {
                addr: self.page_addr(index),
                pos,
                got,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    /// Reads the page and leaves its final contents in `out`, decompressing
    /// through a stack buffer when the compressed form fits.
    fn load_page_data(&self, index: usize, out: &mut [u8]) -> Result<(), LoadError> {
        if !self.index.compressed() {
            return self.read_page_bytes(index, out);
        }

        let size = self.index.pages[index].size_on_disk as usize;
        let mut stack_buf = [0u8; COMPRESSED_STACK_BUF];
        let mut heap_buf;
        let input: &mut [u8] = if size <= stack_buf.len() {
            &mut stack_buf[..size]
        } else {
            heap_buf = vec![0u8; size];
            &mut heap_buf
        };
        self.read_page_bytes(index, input)?;
        decompress_page(input, out).map_err(|source| LoadError::DecompressionFailure {
            addr: self.page_addr(index),
            source,
        })
    }

    /// Claims and reads a page for the reader thread, parking the contents in
    /// the page until the consumer fills it. `Ok(false)` if it was claimed
    /// by someone else.
    fn read_for_background(&self, index: usize) -> Result<bool, LoadError> {
        let page = &self.index.pages[index];
        if page.transition(PageState::Empty, PageState::Reading).is_err() {
            return Ok(false);
        }

        let mut data = vec![0u8; self.index.page_size(index)].into_boxed_slice();
        match self.load_page_data(index, &mut data) {
            Ok(()) => {
                // SAFETY: we moved the page into Reading above
                unsafe { page.put_data(data) };
                page.set_state(PageState::Read);
                Ok(true)
            }
            Err(err) => {
                page.set_state(PageState::Error);
                Err(err)
            }
        }
    }

    /// Fills a page whose read already finished, unless another thread owns or
    /// already did the fill, in which case this waits for its outcome.
    fn fill_read_page(&self, index: usize, filler: &dyn PageFiller) -> Result<(), LoadError> {
        let page = &self.index.pages[index];
        let addr = self.page_addr(index);
        if page.transition(PageState::Read, PageState::Filling).is_err() {
            return match page.wait_while(|state| !state.is_terminal()) {
                PageState::Filled => Ok(()),
                _ => Err(LoadError::PageFailed { addr }),
            };
        }

        // SAFETY: we moved the page into Filling above
        let Some(data) = (unsafe { page.take_data() }) else {
            page.set_state(PageState::Error);
            return Err(LoadError::PageFailed { addr });
        };
        self.finish_fill(index, filler, &data)
    }

    /// Writes `data` into guest memory. The caller owns the page's Filling state.
    fn finish_fill(
        &self,
        index: usize,
        filler: &dyn PageFiller,
        data: &[u8],
    ) -> Result<(), LoadError> {
        let page = &self.index.pages[index];
        let dst = self.index.page_ptr(index);
        match filler.fill_page(dst, data) {
            Ok(()) => {
                page.set_state(PageState::Filled);
                Ok(())
            }
            Err(source) => {
                page.set_state(PageState::Error);
                Err(LoadError::FillFailed {
                    addr: dst as usize,
                    source,
                })
            }
        }
    }

    fn handle_fault(&self, ptr: *mut u8, filler: &dyn PageFiller) {
        if let Err(err) = self.load_faulted_page(ptr, filler) {
            self.record_failure(err);
        }
    }

    /// Services a first access synchronously, bypassing the queues.
    fn load_faulted_page(&self, ptr: *mut u8, filler: &dyn PageFiller) -> Result<(), LoadError> {
        let index = self
            .index
            .page_at(ptr)
            .ok_or(LoadError::UnmappedAddress(ptr as usize))?;
        let page = &self.index.pages[index];
        if page.transition(PageState::Empty, PageState::Reading).is_err() {
            // Whoever is reading it hands the fill over as soon as they're done
            page.wait_while(|state| state < PageState::Read);
            return self.fill_read_page(index, filler);
        }

        let page_size = self.index.page_size(index);
        let mut stack_buf = AlignedPage::default();
        let mut heap_buf;
        let buf: &mut [u8] = if page_size <= PAGE_SIZE {
            &mut stack_buf[..page_size]
        } else {
            heap_buf = vec![0u8; page_size];
            &mut heap_buf
        };
        if let Err(err) = self.load_page_data(index, buf) {
            page.set_state(PageState::Error);
            return Err(err);
        }
        // The contents never leave this stack frame, so publish Read and
        // claim the fill in one step
        page.set_state(PageState::Filling);
        self.finish_fill(index, filler, buf)
    }

    /// One bounded step of background loading, run from the watch's idle loop.
    fn background_page_load(&self, filler: &dyn PageFiller) -> IdleCallbackResult {
        let received = match self.lock_queues().as_mut() {
            Some(queues) => queues.results.try_recv(),
            None => return self.all_done(),
        };

        match received {
            Ok(ReadResult::Loaded(index)) => {
                if let Err(err) = self.fill_read_page(index, filler) {
                    return self.fail_background(err);
                }
                // Filling takes a while; let the driver check for faults
                // before more reads are queued
                return IdleCallbackResult::RunAgain;
            }
            Ok(ReadResult::Failed(err)) => return self.fail_background(err),
            Ok(ReadResult::AllLoaded) => {
                self.stop_queues();
                return self.all_done();
            }
            Err(TryRecvError::Disconnected) => {
                return self.fail_background(LoadError::Io(io::Error::other(
                    "background reader stopped unexpectedly",
                )));
            }
            Err(TryRecvError::Empty) => {}
        }

        match self.lock_queues().as_mut() {
            Some(queues) => self.queue_reads(queues),
            None => self.all_done(),
        }
    }

    /// Hands up to a queue's worth of still-empty pages to the reader,
    /// continuing where the previous scan stopped.
    fn queue_reads(&self, queues: &mut BackgroundQueues) -> IdleCallbackResult {
        let pages = &self.index.pages;
        for _ in 0..queues.capacity {
            while queues.next_page < pages.len()
                && pages[queues.next_page].state() != PageState::Empty
            {
                queues.next_page += 1;
            }

            if queues.next_page == pages.len() {
                if !queues.sent_end_marker {
                    queues.sent_end_marker = queues.requests.try_send(None).is_ok();
                }
                return IdleCallbackResult::Wait;
            }

            match queues.requests.try_send(Some(queues.next_page)) {
                Ok(()) => queues.next_page += 1,
                // Give the reader time to catch up. A vanished reader shows up
                // on the result queue.
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                    return IdleCallbackResult::Wait;
                }
            }
        }
        IdleCallbackResult::RunAgain
    }

    fn all_done(&self) -> IdleCallbackResult {
        self.mark_complete();
        IdleCallbackResult::AllDone
    }

    fn fail_background(&self, err: LoadError) -> IdleCallbackResult {
        self.record_failure(err);
        self.stop_queues();
        self.all_done()
    }

    /// Eager load: every page in file order, decompressing on the pool when
    /// one is configured.
    #[tracing::instrument(skip_all)]
    fn read_all_pages(&self, config: &LoaderConfig) -> Result<(), LoadError> {
        // Sequential file access is far cheaper than index order
        let pages = &self.index.pages;
        let mut sorted: Vec<usize> = (0..pages.len())
            .filter(|&i| !pages[i].is_empty_on_disk())
            .collect();
        sorted.sort_unstable_by_key(|&i| pages[i].file_pos);
        debug!(pages = sorted.len(), "reading all pages");

        let pool = match config.decompress_threads() {
            Some(threads) if self.index.compressed() => {
                let pool = DecompressPool::new(threads, config.queue_capacity())
                    .map_err(io::Error::other)?;
                Some(pool)
            }
            _ => None,
        };
        let result = match &pool {
            Some(pool) => pool.run(
                |job: UnpackJob| {
                    if let Err(err) = self.unpack_in_place(job.index, &job.data) {
                        self.record_failure(err);
                    }
                },
                |enqueue| {
                    self.read_in_order(&sorted, |job| {
                        enqueue(job);
                        Ok(())
                    })
                },
            ),
            None => self.read_in_order(&sorted, |job| self.unpack_in_place(job.index, &job.data)),
        };
        self.mark_complete();

        result?;
        match pages.iter().position(|page| page.state() == PageState::Error) {
            Some(index) => Err(LoadError::PageFailed {
                addr: self.page_addr(index),
            }),
            None => Ok(()),
        }
    }

    /// Reads `order` until a page fails, passing compressed pages to `unpack`.
    /// The cause of a failure is recorded as the load's error and the
    /// returned error names the page.
    fn read_in_order(
        &self,
        order: &[usize],
        mut unpack: impl FnMut(UnpackJob) -> Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        for &index in order {
            if self.has_failed() {
                break;
            }
            if let Err(err) = self.read_in_place(index, &mut unpack) {
                let addr = self.page_addr(index);
                self.record_failure(err);
                return Err(LoadError::PageFailed { addr });
            }
        }
        Ok(())
    }

    fn read_in_place(
        &self,
        index: usize,
        unpack: &mut impl FnMut(UnpackJob) -> Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        let page = &self.index.pages[index];
        if page.transition(PageState::Empty, PageState::Reading).is_err() {
            return Ok(());
        }

        let result = if self.index.compressed() {
            self.read_compressed(index)
                .and_then(|data| unpack(UnpackJob { index, data }))
        } else {
            // SAFETY: the page is ours in Reading and eager loads own all of
            // guest memory
            let dst = unsafe { self.index.page_memory(index) };
            self.read_page_bytes(index, dst)
                .map(|()| page.set_state(PageState::Filled))
        };
        if result.is_err() {
            page.set_state(PageState::Error);
        }
        result
    }

    fn read_compressed(&self, index: usize) -> Result<Box<[u8]>, LoadError> {
        let page = &self.index.pages[index];
        let mut data = vec![0u8; page.size_on_disk as usize].into_boxed_slice();
        self.read_page_bytes(index, &mut data)?;
        page.set_state(PageState::Read);
        Ok(data)
    }

    /// Decompresses straight into guest memory during an eager load.
    fn unpack_in_place(&self, index: usize, data: &[u8]) -> Result<(), LoadError> {
        let page = &self.index.pages[index];
        page.set_state(PageState::Filling);
        // SAFETY: the page's contents were handed to us with the job
        let dst = unsafe { self.index.page_memory(index) };
        match decompress_page(data, dst) {
            Ok(()) => {
                page.set_state(PageState::Filled);
                Ok(())
            }
            Err(source) => {
                page.set_state(PageState::Error);
                Err(LoadError::DecompressionFailure {
                    addr: self.page_addr(index),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;

    struct DirectFiller;

    impl PageFiller for DirectFiller {
        fn fill_page(&self, dst: *mut u8, data: &[u8]) -> io::Result<()> {
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
            Ok(())
        }
    }

    struct FailingFiller;

    impl PageFiller for FailingFiller {
        fn fill_page(&self, _: *mut u8, _: &[u8]) -> io::Result<()> {
            Err(io::Error::other("no"))
        }
    }

    struct BrokenWatch;

    impl MemoryAccessWatch for BrokenWatch {
        fn valid(&self) -> bool {
            false
        }

        fn register_memory_range(&mut self, _: *mut u8, _: usize) -> io::Result<()> {
            Ok(())
        }

        fn done_registering(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWatchFactory;

    impl AccessWatchFactory for BrokenWatchFactory {
        fn is_supported(&self) -> bool {
            true
        }

        fn create(&self, _: AccessCallback, _: IdleCallback) -> Box<dyn MemoryAccessWatch> {
            Box::new(BrokenWatch)
        }
    }

    /// One uncompressed page at offset 8 followed by its index at 8 + PAGE_SIZE.
    fn single_page_snapshot(fill: u8) -> Vec<u8> {
        let index_pos = (8 + PAGE_SIZE) as u64;
        let mut out = index_pos.to_be_bytes().to_vec();
        out.extend(std::iter::repeat_n(fill, PAGE_SIZE));
        out.extend(1u32.to_be_bytes());
        out.extend(0u32.to_be_bytes());
        out.extend(1u32.to_be_bytes());
        out.push(3);
        out.extend(b"ram");
        out.extend(1u32.to_be_bytes());
        out.extend([1, 0]);
        out
    }

    fn shared_for(snapshot: Vec<u8>, guest: &mut AlignedPage) -> Shared {
        let block =
            unsafe { RamBlock::new("ram", guest.as_mut_ptr(), PAGE_SIZE as u64, PAGE_SIZE as u32) };
        let index = read_index(SourceReader::new(&snapshot), vec![block], &|_| false).unwrap();
        Shared {
            source: Box::new(snapshot),
            index,
            queues: Mutex::new(None),
            failure: OnceLock::new(),
            complete: Mutex::new(false),
            completed: Condvar::new(),
            started_at: Instant::now(),
        }
    }

    #[test]
    fn test_fill_twice_is_noop() {
        let mut guest = AlignedPage::default();
        let shared = shared_for(single_page_snapshot(0x5A), &mut guest);

        assert!(shared.read_for_background(0).unwrap());
        assert_eq!(shared.index.pages[0].state(), PageState::Read);
        shared.fill_read_page(0, &DirectFiller).unwrap();
        // A second finalize must neither write again nor touch the freed buffer
        shared.fill_read_page(0, &FailingFiller).unwrap();

        assert_eq!(shared.index.pages[0].state(), PageState::Filled);
        assert!(guest.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_background_read_loses_to_claimed_page() {
        let mut guest = AlignedPage::default();
        let shared = shared_for(single_page_snapshot(1), &mut guest);
        shared.index.pages[0]
            .transition(PageState::Empty, PageState::Reading)
            .unwrap();
        assert!(!shared.read_for_background(0).unwrap());
    }

    #[test]
    fn test_fault_path_fills_directly() {
        let mut guest = AlignedPage::default();
        let shared = shared_for(single_page_snapshot(0x11), &mut guest);
        let ptr = shared.index.page_ptr(0).wrapping_add(123);

        shared.handle_fault(ptr, &DirectFiller);
        assert_eq!(shared.index.pages[0].state(), PageState::Filled);
        assert!(!shared.has_failed());
        // The background reader must not read it again
        assert!(!shared.read_for_background(0).unwrap());
        assert!(guest.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_fault_takes_over_background_read() {
        let mut guest = AlignedPage::default();
        let shared = shared_for(single_page_snapshot(0x22), &mut guest);
        assert!(shared.read_for_background(0).unwrap());

        shared.handle_fault(shared.index.page_ptr(0), &DirectFiller);
        assert_eq!(shared.index.pages[0].state(), PageState::Filled);
        assert!(guest.iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_failed_fill_marks_error() {
        let mut guest = AlignedPage::default();
        let shared = shared_for(single_page_snapshot(0x33), &mut guest);
        shared.handle_fault(shared.index.page_ptr(0), &FailingFiller);
        assert_eq!(shared.index.pages[0].state(), PageState::Error);
        assert!(matches!(shared.failure.get(), Some(LoadError::FillFailed { .. })));
        assert!(guest.is_zero());
    }

    #[test]
    fn test_short_read() {
        let mut guest = AlignedPage::default();
        let mut snapshot = single_page_snapshot(0x44);
        let index = snapshot.split_off(8 + PAGE_SIZE);
        // Move the index up so the page runs past the end of the data
        snapshot.truncate(8 + 100);
        snapshot[..8].copy_from_slice(&108u64.to_be_bytes());
        snapshot.extend(index);
        let shared = shared_for(snapshot, &mut guest);

        let err = shared.read_for_background(0).unwrap_err();
        assert!(matches!(err, LoadError::ShortRead { expected, .. } if expected == PAGE_SIZE));
        assert_eq!(shared.index.pages[0].state(), PageState::Error);
    }

    #[test]
    fn test_invalid_watch_is_init_failure() {
        let mut guest = AlignedPage::default();
        let shared = Arc::new(shared_for(single_page_snapshot(0x66), &mut guest));
        let loader = RamLoader::new(Vec::<u8>::new(), |_: &[u8]| false)
            .with_access_watch(Arc::new(BrokenWatchFactory));
        assert!(matches!(
            loader.create_watch(&shared),
            Err(LoadError::FaultWatchInitFailure)
        ));
    }

    #[test]
    fn test_largest_compressed_page_fits_stack_buffer() {
        assert!(COMPRESSED_STACK_BUF >= lz4_flex::block::get_maximum_output_size(PAGE_SIZE));
    }

    #[test]
    fn test_unmapped_fault() {
        let mut guest = AlignedPage::default();
        let shared = shared_for(single_page_snapshot(0), &mut guest);
        let outside = shared.index.page_ptr(0).wrapping_add(PAGE_SIZE);
        shared.handle_fault(outside, &DirectFiller);
        assert!(matches!(shared.failure.get(), Some(LoadError::UnmappedAddress(_))));
    }
}
