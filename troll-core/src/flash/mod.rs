//! Flash management module.
//!
//! Handles flash erase, program, and verify operations. The algorithm is the
//! same for every target that can erase and write flash; only the wire
//! requests differ.

mod memory_map;

pub use memory_map::{flash_areas_for_range, parse_memory_map, FlashArea, MemoryKind, MemoryRegion};

use crate::diagnostics::Diagnostics;
use crate::error::{Result, TargetError};
use crate::memory::MemoryImage;
use crate::target::Target;
use std::fmt;
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Progress information for flash operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashingProgress {
    Started,
    Erasing { address: u32, size: u32 },
    Programming { total: u32 },
    Progress { bytes: u32 },
    Verifying,
    Finished,
    Failed,
    Message(String),
}

/// Receives [`FlashingProgress`] updates.
pub struct FlashProgress {
    callback: Box<dyn FnMut(FlashingProgress) + Send>,
}

impl FlashProgress {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(FlashingProgress) + Send + 'static,
    {
        Self { callback: Box::new(callback) }
    }

    /// Progress that goes nowhere.
    pub fn empty() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&mut self, event: FlashingProgress) {
        (self.callback)(event);
    }
}

impl Default for FlashProgress {
    fn default() -> Self {
        Self::empty()
    }
}

/// A progress reporter that sends updates over a channel.
pub struct MpscFlashProgress {
    sender: mpsc::Sender<FlashingProgress>,
}

impl MpscFlashProgress {
    pub fn new(sender: mpsc::Sender<FlashingProgress>) -> Self {
        Self { sender }
    }

    pub fn into_flash_progress(self) -> FlashProgress {
        FlashProgress::new(move |event| {
            let _ = self.sender.send(event);
        })
    }
}

/// How a flash synchronization ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashStatus {
    /// Target memory already matched; nothing was erased or written.
    AlreadyUpToDate,
    /// Erased, written and read back successfully.
    Programmed,
    EraseFailed { address: u32, size: u32 },
    WriteFailed { address: u32, size: u32 },
    /// Every request was acknowledged but the read-back differs.
    VerifyFailed,
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyUpToDate => write!(f, "target flash already up to date"),
            Self::Programmed => write!(f, "flash programmed and verified"),
            Self::EraseFailed { address, size } => {
                write!(f, "error erasing ${size:x} bytes of flash at address ${address:x}")
            }
            Self::WriteFailed { address, size } => {
                write!(f, "error writing ${size:x} bytes of flash at address ${address:x}")
            }
            Self::VerifyFailed => write!(f, "flash verification failed, target memory differs"),
        }
    }
}

/// Result of [`sync_flash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub status: FlashStatus,
    pub erased_bytes: u32,
    pub written_bytes: u32,
    pub erase_time: Duration,
    pub write_time: Duration,
}

impl FlashReport {
    fn new(status: FlashStatus) -> Self {
        Self {
            status,
            erased_bytes: 0,
            written_bytes: 0,
            erase_time: Duration::ZERO,
            write_time: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FlashStatus::AlreadyUpToDate | FlashStatus::Programmed)
    }

    pub fn message(&self) -> String {
        self.status.to_string()
    }
}

/// Wire-level flash primitives of a target.
pub trait FlashAccess: Target {
    /// Largest payload of a single write request.
    fn flash_chunk_size(&self) -> usize;

    fn flash_erase(&mut self, address: u32, length: u32) -> Result<bool>;

    fn flash_write(&mut self, address: u32, data: &[u8]) -> Result<bool>;

    /// Commit buffered writes.
    fn flash_done(&mut self) -> Result<bool>;
}

fn bytes_per_second(bytes: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        f64::from(bytes) / secs
    } else {
        f64::from(bytes)
    }
}

/// Bring target flash in line with `image`.
///
/// The image must hold exactly one contiguous range. The outcome is decided
/// by reading the memory back, not by the acknowledgements of the individual
/// requests.
pub fn sync_flash<T: FlashAccess + ?Sized>(
    target: &mut T,
    image: &MemoryImage,
    progress: &mut FlashProgress,
    diagnostics: &Diagnostics,
) -> Result<FlashReport> {
    image.dump(diagnostics);
    let [range] = image.ranges() else {
        return Err(TargetError::FlashPrecondition(format!(
            "image must hold exactly one contiguous range, it holds {}",
            image.ranges().len()
        )));
    };
    let length = u32::try_from(range.data.len())
        .map_err(|_| TargetError::FlashPrecondition("image larger than 4 GiB".to_string()))?;

    progress.emit(FlashingProgress::Started);
    if image.is_memory_matching(target)? {
        diagnostics.info("target memory already matches the image, nothing to flash");
        progress.emit(FlashingProgress::Finished);
        return Ok(FlashReport::new(FlashStatus::AlreadyUpToDate));
    }

    let regions = parse_memory_map(&target.memory_map()?)?;
    let areas = flash_areas_for_range(&regions, range.address, length);
    if areas.is_empty() {
        progress.emit(FlashingProgress::Failed);
        return Err(TargetError::FlashPrecondition(format!(
            "no flash area intersects ${:x} bytes at ${:x}",
            length, range.address
        )));
    }

    let mut report = FlashReport::new(FlashStatus::Programmed);
    let started = Instant::now();
    for area in &areas {
        diagnostics.info(format_args!(
            "erasing flash at start address ${:x}, size ${:x}",
            area.start, area.size
        ));
        progress.emit(FlashingProgress::Erasing { address: area.start, size: area.size });
        if !target.flash_erase(area.start, area.size)? {
            report.status = FlashStatus::EraseFailed { address: area.start, size: area.size };
            report.erase_time = started.elapsed();
            diagnostics.error(report.message());
            progress.emit(FlashingProgress::Failed);
            return Ok(report);
        }
        report.erased_bytes += area.size;
    }
    report.erase_time = started.elapsed();
    diagnostics.info(format_args!(
        "flash erase speed {:.0} bytes per second",
        bytes_per_second(report.erased_bytes, report.erase_time)
    ));

    diagnostics.info(format_args!(
        "writing ${:x} bytes to flash at start address ${:x}",
        length, range.address
    ));
    progress.emit(FlashingProgress::Programming { total: length });
    let started = Instant::now();
    let mut address = range.address;
    for chunk in range.data.chunks(target.flash_chunk_size().max(1)) {
        if !target.flash_write(address, chunk)? {
            report.status = FlashStatus::WriteFailed { address: range.address, size: length };
            report.write_time = started.elapsed();
            diagnostics.error(report.message());
            progress.emit(FlashingProgress::Failed);
            return Ok(report);
        }
        let written = chunk.len() as u32;
        report.written_bytes += written;
        address = address.wrapping_add(written);
        progress.emit(FlashingProgress::Progress { bytes: written });
    }
    if !target.flash_done()? {
        report.status = FlashStatus::WriteFailed { address: range.address, size: length };
        report.write_time = started.elapsed();
        diagnostics.error(report.message());
        progress.emit(FlashingProgress::Failed);
        return Ok(report);
    }
    report.write_time = started.elapsed();
    diagnostics.info(format_args!(
        "flash write speed {:.0} bytes per second",
        bytes_per_second(report.written_bytes, report.write_time)
    ));

    progress.emit(FlashingProgress::Verifying);
    if image.is_memory_matching(target)? {
        progress.emit(FlashingProgress::Finished);
    } else {
        report.status = FlashStatus::VerifyFailed;
        diagnostics.error(report.message());
        progress.emit(FlashingProgress::Failed);
    }
    Ok(report)
}

/// Manager for flash operations.
pub struct FlashManager;

impl FlashManager {
    pub const fn new() -> Self {
        Self
    }

    /// Flash a raw binary at a specific address.
    pub fn flash_bin(
        &self,
        target: &mut dyn Target,
        path: &Path,
        address: u32,
        progress: &mut FlashProgress,
    ) -> Result<FlashReport> {
        let image = MemoryImage::from_bin_file(path, address)?;
        target.sync_flash(&image, progress)
    }
}

impl Default for FlashManager {
    fn default() -> Self {
        Self::new()
    }
}
