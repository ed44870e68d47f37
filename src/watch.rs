//! The page-fault trapping capability the demand-paging engine plugs into.
//!
//! A watch intercepts the first access to every registered page and calls the
//! access callback with the faulting address. Whatever loop hosts the watch
//! also calls the idle callback whenever it has nothing better to do, until
//! the callback reports [`IdleCallbackResult::AllDone`].

use std::io;

/// What the idle callback wants its driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCallbackResult {
    /// Background loading is over, stop calling.
    AllDone,
    /// More work is ready, call again as soon as pending faults are handled.
    RunAgain,
    /// Nothing to do right now, call again after a short pause.
    Wait,
}

/// Places page contents into watched memory. For trapped memory a plain write
/// would fault again, so only the watch knows how to do it.
pub trait PageFiller {
    fn fill_page(&self, dst: *mut u8, data: &[u8]) -> io::Result<()>;
}

/// Called on first access to a watched page, with the faulting address. The
/// page must be filled before this returns.
pub type AccessCallback = Box<dyn Fn(*mut u8, &dyn PageFiller) + Send + Sync>;

/// Drives background loading in small steps.
pub type IdleCallback = Box<dyn FnMut(&dyn PageFiller) -> IdleCallbackResult + Send>;

pub trait MemoryAccessWatch: Send {
    /// False when the watch could not set itself up; callers then load eagerly.
    fn valid(&self) -> bool;

    fn register_memory_range(&mut self, start: *mut u8, len: usize) -> io::Result<()>;

    /// All ranges are registered, start trapping and driving the idle callback.
    fn done_registering(&mut self) -> io::Result<()>;
}

pub trait AccessWatchFactory: Send + Sync {
    fn is_supported(&self) -> bool;

    fn create(
        &self,
        on_access: AccessCallback,
        on_idle: IdleCallback,
    ) -> Box<dyn MemoryAccessWatch>;
}
