use std::{
    fs::File,
    io::{BufWriter, Write as _},
    path::{Path, PathBuf},
    ptr, slice,
    sync::Arc,
};

use clap::{Args, Parser};
use snapram::{LoadType, LoaderConfig, PAGE_SIZE, RamBlock, RamLoader, is_zero_range};
use snapram_uffd::UffdWatchFactory;
use tracing::{info, info_span};

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{
        EnvFilter,
        fmt::{self, format::FmtSpan},
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(filter)
        .init();

    match SnapramArgs::parse() {
        SnapramArgs::Restore(args) => restore(args),
    }
}

#[derive(Parser)]
enum SnapramArgs {
    /// Restore a snapshot into anonymous memory, lazily when userfaultfd allows.
    Restore(RestoreArgs),
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Eager,
    Lazy,
}

#[derive(Args)]
struct RestoreArgs {
    snapshot: PathBuf,
    /// JSON list of `{"id", "size", "page_size"}` RAM blocks.
    layout: PathBuf,
    /// JSON loader configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured load type.
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Write the restored memory of every block here, in layout order.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, serde::Deserialize)]
struct BlockLayout {
    id: String,
    size: u64,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page_size() -> u32 {
    PAGE_SIZE as u32
}

/// Private anonymous memory standing in for a guest RAM block.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn anonymous(len: usize) -> anyhow::Result<Self> {
        // SAFETY: fresh mapping, no existing memory is affected
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping stays alive and readable for as long as self
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: exactly the range mmap returned
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

#[tracing::instrument(skip_all)]
fn restore(args: RestoreArgs) -> anyhow::Result<()> {
    let layout: Vec<BlockLayout> = read_json(&args.layout)?;
    let mut config = match &args.config {
        Some(path) => read_json(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.load_type = match mode {
            Mode::Eager => LoadType::Eager,
            Mode::Lazy => LoadType::Lazy,
        };
    }

    // Declared before the loader so the memory outlives it
    let mappings = layout
        .iter()
        .map(|block| Mapping::anonymous(usize::try_from(block.size)?))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let snapshot = File::open(&args.snapshot)?;
    let mut loader = RamLoader::new(snapshot, is_zero_range)
        .with_config(config)
        .with_access_watch(Arc::new(UffdWatchFactory));
    for (block, mapping) in layout.iter().zip(&mappings) {
        // SAFETY: the mapping is ours alone and outlives the loader
        let ram_block =
            unsafe { RamBlock::new(&*block.id, mapping.ptr, block.size, block.page_size) };
        loader.register_block(ram_block)?;
    }

    loader.start_loading()?;
    info_span!("wait_for_completion").in_scope(|| loader.wait_for_completion());
    if let Some(err) = loader.error() {
        anyhow::bail!("restore failed: {err}");
    }
    let total: u64 = layout.iter().map(|b| b.size).sum();
    info!(blocks = layout.len(), bytes = total, "restored snapshot");

    if let Some(output) = &args.output {
        let _span = info_span!("write_output").entered();
        let mut writer = BufWriter::new(File::create(output)?);
        for mapping in &mappings {
            writer.write_all(mapping.as_slice())?;
        }
        writer.flush()?;
    }
    Ok(())
}
