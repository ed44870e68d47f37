//! [`MemoryAccessWatch`] on top of Linux `userfaultfd`.
//!
//! Registered ranges trap missing-page faults. A handler thread polls the
//! descriptor, hands each fault to the loader and runs the idle callback
//! whenever no fault is pending. Pages are placed with `UFFDIO_COPY`, which
//! also wakes the faulting thread.
//!
//! Ranges the guest gives back with `madvise(MADV_DONTNEED)` arrive as remove
//! events. They are unregistered and pages in them are never placed, so the
//! guest sees zeroes there.

#![allow(clippy::undocumented_unsafe_blocks)]

use std::{
    cell::RefCell,
    collections::VecDeque,
    ffi::c_void,
    io,
    ops::Range,
    os::unix::io::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use snapram::watch::{
    AccessCallback, AccessWatchFactory, IdleCallback, IdleCallbackResult, MemoryAccessWatch,
    PageFiller,
};
use tracing::{debug, error, info, warn};
use userfaultfd::{Error, Event, FeatureFlags, Uffd, UffdBuilder};

/// Poll timeout while the idle callback is waiting for the reader.
const WAIT_POLL_MS: i32 = 1;
/// Poll timeout once background loading is over; bounds how long Drop waits.
const DONE_POLL_MS: i32 = 100;

fn open_uffd() -> Result<Uffd, Error> {
    UffdBuilder::new()
        .close_on_exec(true)
        .non_blocking(true)
        .user_mode_only(true)
        .require_features(FeatureFlags::EVENT_REMOVE)
        .create()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UffdWatchFactory;

impl AccessWatchFactory for UffdWatchFactory {
    fn is_supported(&self) -> bool {
        match open_uffd() {
            Ok(_) => true,
            Err(err) => {
                debug!(%err, "userfaultfd is unavailable");
                false
            }
        }
    }

    fn create(
        &self,
        on_access: AccessCallback,
        on_idle: IdleCallback,
    ) -> Box<dyn MemoryAccessWatch> {
        Box::new(UffdWatch::new(on_access, on_idle))
    }
}

pub struct UffdWatch {
    uffd: Option<Arc<Uffd>>,
    callbacks: Option<(AccessCallback, IdleCallback)>,
    running: Arc<AtomicBool>,
    handler: Option<JoinHandle<()>>,
}

impl UffdWatch {
    pub fn new(on_access: AccessCallback, on_idle: IdleCallback) -> Self {
        let uffd = match open_uffd() {
            Ok(uffd) => Some(Arc::new(uffd)),
            Err(err) => {
                warn!(%err, "failed to open userfaultfd");
                None
            }
        };
        Self {
            uffd,
            callbacks: Some((on_access, on_idle)),
            running: Arc::new(AtomicBool::new(false)),
            handler: None,
        }
    }

    fn uffd(&self) -> io::Result<&Arc<Uffd>> {
        self.uffd
            .as_ref()
            .ok_or_else(|| io::Error::other("userfaultfd is not open"))
    }
}

impl MemoryAccessWatch for UffdWatch {
    fn valid(&self) -> bool {
        self.uffd.is_some()
    }

    fn register_memory_range(&mut self, start: *mut u8, len: usize) -> io::Result<()> {
        self.uffd()?
            .register(start.cast::<c_void>(), len)
            .map_err(io::Error::other)?;
        Ok(())
    }

    fn done_registering(&mut self) -> io::Result<()> {
        let uffd = Arc::clone(self.uffd()?);
        let (on_access, on_idle) = self
            .callbacks
            .take()
            .ok_or_else(|| io::Error::other("fault handler already started"))?;

        self.running.store(true, Ordering::Release);
        let handler = FaultHandler {
            uffd,
            on_access,
            on_idle,
            running: Arc::clone(&self.running),
        };
        self.handler = Some(
            thread::Builder::new()
                .name("snapram-uffd".into())
                .spawn(move || handler.run())?,
        );
        Ok(())
    }
}

impl Drop for UffdWatch {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handler) = self.handler.take()
            && handler.join().is_err()
        {
            error!("userfaultfd handler panicked");
        }
    }
}

struct FaultHandler {
    uffd: Arc<Uffd>,
    on_access: AccessCallback,
    on_idle: IdleCallback,
    running: Arc<AtomicBool>,
}

impl FaultHandler {
    fn run(mut self) {
        let filler = UffdFiller {
            uffd: &self.uffd,
            pending: RefCell::default(),
            removed: RefCell::default(),
        };
        let mut idle_done = false;
        let mut timeout = 0;

        while self.running.load(Ordering::Acquire) {
            let mut pollfd = libc::pollfd {
                fd: self.uffd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: a single valid pollfd
            let nready = unsafe { libc::poll(&raw mut pollfd, 1, timeout) };
            if nready == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "polling userfaultfd failed");
                break;
            }

            if let Err(err) = self.handle_events(&filler) {
                error!(%err, "reading userfaultfd events failed");
                break;
            }

            timeout = if idle_done {
                DONE_POLL_MS
            } else {
                match (self.on_idle)(&filler) {
                    IdleCallbackResult::RunAgain => 0,
                    IdleCallbackResult::Wait => WAIT_POLL_MS,
                    IdleCallbackResult::AllDone => {
                        info!("background loading finished");
                        idle_done = true;
                        DONE_POLL_MS
                    }
                }
            };
        }
        debug!("userfaultfd handler stopped");
    }

    /// Serves every queued fault, including ones the filler set aside while
    /// it was waiting for the kernel to let copies through.
    fn handle_events(&self, filler: &UffdFiller<'_>) -> io::Result<()> {
        filler.drain_events()?;
        loop {
            let Some(event) = filler.pending.borrow_mut().pop_front() else {
                return Ok(());
            };
            match event {
                Event::Pagefault { addr, .. } => (self.on_access)(addr.cast(), filler),
                event => warn!(?event, "unexpected userfaultfd event"),
            }
        }
    }
}

/// Places pages with `UFFDIO_COPY`. Only used on the handler thread.
struct UffdFiller<'a> {
    uffd: &'a Uffd,
    pending: RefCell<VecDeque<Event>>,
    /// Address ranges the guest discarded; no longer registered.
    removed: RefCell<Vec<Range<usize>>>,
}

impl UffdFiller<'_> {
    /// Reads all available events, unregistering removed ranges right away
    /// and queueing everything else.
    fn drain_events(&self) -> io::Result<()> {
        while let Some(event) = self.uffd.read_event().map_err(io::Error::other)? {
            match event {
                Event::Remove { start, end } => {
                    let len = end as usize - start as usize;
                    debug!(start = ?start, len, "guest removed range");
                    self.uffd.unregister(start, len).map_err(io::Error::other)?;
                    self.removed.borrow_mut().push(start as usize..end as usize);
                }
                event => self.pending.borrow_mut().push_back(event),
            }
        }
        Ok(())
    }

    fn is_removed(&self, addr: usize) -> bool {
        self.removed.borrow().iter().any(|range| range.contains(&addr))
    }
}

impl PageFiller for UffdFiller<'_> {
    fn fill_page(&self, dst: *mut u8, data: &[u8]) -> io::Result<()> {
        loop {
            if self.is_removed(dst as usize) {
                debug!(addr = ?dst, "not placing page the guest removed");
                return Ok(());
            }
            // SAFETY: `data` is a whole page and `dst` the start of a page in a
            // registered range
            let copied = unsafe {
                self.uffd
                    .copy(data.as_ptr().cast(), dst.cast(), data.len(), true)
            };
            match copied {
                Ok(_) => return Ok(()),
                // The kernel refuses copies while a `remove` event is waiting
                // to be read. The weird cast is because uffd-rs reports the
                // negative errno as an unsigned byte count.
                Err(Error::PartiallyCopied(bytes_copied))
                    if bytes_copied == 0 || bytes_copied == (-libc::EAGAIN) as usize =>
                {
                    self.drain_events()?;
                    thread::yield_now();
                }
                // Someone else already placed the page
                Err(Error::CopyFailed(errno))
                    if io::Error::from(errno).raw_os_error() == Some(libc::EEXIST) =>
                {
                    return Ok(());
                }
                Err(err) => return Err(io::Error::other(err)),
            }
        }
    }
}
