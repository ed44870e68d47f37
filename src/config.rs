use std::{num::NonZeroUsize, thread};

use serde::Deserialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    /// Read every page up front.
    Eager,
    /// Trap first access and stream the rest in the background, when the host
    /// supports it.
    #[default]
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub load_type: LoadType,
    /// Capacity of each queue between the idle callback and the reader thread.
    pub queue_capacity: usize,
    /// Workers decompressing pages during eager loads. `Some(0)` decompresses
    /// on the loading thread; `None` uses one worker per available core.
    pub decompress_threads: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            load_type: LoadType::default(),
            queue_capacity: 32,
            decompress_threads: None,
        }
    }
}

impl LoaderConfig {
    pub(crate) fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    pub(crate) fn decompress_threads(&self) -> Option<NonZeroUsize> {
        match self.decompress_threads {
            Some(n) => NonZeroUsize::new(n),
            None => thread::available_parallelism().ok(),
        }
    }
}
