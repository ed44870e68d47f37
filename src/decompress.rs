use std::num::NonZeroUsize;

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::debug;

use crate::error::DecompressError;

/// Decompresses one LZ4 block into `output`, which must come out exactly full.
pub fn decompress_page(input: &[u8], output: &mut [u8]) -> Result<(), DecompressError> {
    let got = lz4_flex::block::decompress_into(input, output)?;
    if got != output.len() {
        return Err(DecompressError::SizeMismatch {
            got,
            expected: output.len(),
        });
    }
    Ok(())
}

/// Worker threads for decompressing pages during an eager load.
///
/// Jobs are queued from inside [`DecompressPool::run`]. At most `capacity` of
/// them wait or run at once, so a fast reader can't buffer the whole snapshot.
pub struct DecompressPool {
    pool: ThreadPool,
    capacity: usize,
}

impl DecompressPool {
    pub fn new(threads: NonZeroUsize, capacity: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.get())
            .thread_name(|i| format!("snapram-unpack-{i}"))
            .build()?;
        debug!(threads = threads.get(), capacity, "started decompression pool");
        Ok(Self {
            pool,
            capacity: capacity.max(1),
        })
    }

    /// Runs `feed` on the calling thread. Every job it passes to its queue
    /// argument is handed to `work` on the pool; queueing blocks while the
    /// backlog is full. Returns once all queued jobs have finished.
    pub fn run<J, R>(&self, work: impl Fn(J) + Sync, feed: impl FnOnce(&mut dyn FnMut(J)) -> R) -> R
    where
        J: Send,
    {
        let backlog = Backlog::new(self.capacity);
        let (work, backlog) = (&work, &backlog);
        self.pool.in_place_scope(|scope| {
            let mut enqueue = |job: J| {
                let permit = backlog.acquire();
                scope.spawn(move |_| {
                    let _permit = permit;
                    work(job);
                });
            };
            feed(&mut enqueue)
        })
    }
}

/// Counts jobs that are queued or running.
struct Backlog {
    jobs: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl Backlog {
    fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(0),
            freed: Condvar::new(),
            capacity,
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut jobs = self.jobs.lock();
        while *jobs >= self.capacity {
            self.freed.wait(&mut jobs);
        }
        *jobs += 1;
        Permit(self)
    }
}

/// Releases its backlog slot on drop, also when the job panics.
struct Permit<'a>(&'a Backlog);

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.0.jobs.lock() -= 1;
        self.0.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::page::{AlignedPage, PAGE_SIZE};

    #[test]
    fn test_decompress_page() {
        let mut page = AlignedPage::default();
        page[100..200].fill(7);
        let compressed = lz4_flex::block::compress(&*page);
        assert!(compressed.len() < PAGE_SIZE);

        let mut out = AlignedPage::default();
        out.fill(1);
        decompress_page(&compressed, &mut *out).unwrap();
        assert!(out == page);
    }

    #[test]
    fn test_decompress_page_short_output() {
        let compressed = lz4_flex::block::compress(&[3u8; 100]);
        let mut out = [0u8; 200];
        let err = decompress_page(&compressed, &mut out).unwrap_err();
        assert!(matches!(
            err,
            DecompressError::SizeMismatch {
                got: 100,
                expected: 200
            }
        ));
    }

    #[test]
    fn test_decompress_page_garbage() {
        let mut out = [0u8; PAGE_SIZE];
        assert!(decompress_page(&[0xFF, 0xFF, 0xFF], &mut out).is_err());
    }

    #[test]
    fn test_pool_runs_every_job() {
        let pool = DecompressPool::new(NonZeroUsize::new(3).unwrap(), 2).unwrap();
        let sum = AtomicUsize::new(0);
        let queued = pool.run(
            |n: usize| {
                sum.fetch_add(n, Ordering::Relaxed);
            },
            |enqueue| {
                for n in 1..=100 {
                    enqueue(n);
                }
                100
            },
        );
        assert_eq!(queued, 100);
        // Every job is done by the time run returns
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn test_pool_bounds_backlog() {
        let pool = DecompressPool::new(NonZeroUsize::new(2).unwrap(), 3).unwrap();
        let finished = AtomicUsize::new(0);
        pool.run(
            |()| {
                std::thread::sleep(std::time::Duration::from_millis(1));
                finished.fetch_add(1, Ordering::SeqCst);
            },
            |enqueue| {
                for queued in 1..=40 {
                    enqueue(());
                    let waiting = queued - finished.load(Ordering::SeqCst);
                    assert!(waiting <= 3, "{waiting} jobs outstanding");
                }
            },
        );
        assert_eq!(finished.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn test_pool_on_one_thread() {
        // The feeding thread isn't a pool worker, so one worker is enough to
        // drain a full backlog
        let pool = DecompressPool::new(NonZeroUsize::MIN, 1).unwrap();
        let done = AtomicUsize::new(0);
        pool.run(
            |()| {
                done.fetch_add(1, Ordering::Relaxed);
            },
            |enqueue| {
                for _ in 0..20 {
                    enqueue(());
                }
            },
        );
        assert_eq!(done.load(Ordering::Relaxed), 20);
    }
}
