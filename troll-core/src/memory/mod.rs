//! Memory image module.
//!
//! Stages the bytes that should end up in target memory. Ranges that touch
//! or overlap are coalesced on insertion, so the image never holds two
//! overlapping ranges.

use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::target::Target;
use std::path::Path;

/// A contiguous run of bytes at a target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRange {
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemoryRange {
    fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }
}

/// A set of non-overlapping memory ranges, sorted by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    ranges: Vec<MemoryRange>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a raw binary file to be placed at `address`.
    pub fn from_bin_file(path: &Path, address: u32) -> Result<Self> {
        let data = std::fs::read(path)?;
        let mut image = Self::new();
        image.add_range(address, &data);
        Ok(image)
    }

    /// Insert `data` at `address`, merging with every range it touches.
    ///
    /// Where old and new bytes overlap, the new bytes win.
    pub fn add_range(&mut self, address: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let start = u64::from(address);
        let end = start + data.len() as u64;

        let (touching, mut kept): (Vec<MemoryRange>, Vec<MemoryRange>) = self
            .ranges
            .drain(..)
            .partition(|r| u64::from(r.address) <= end && start <= r.end());

        let merged_start = touching.iter().map(|r| u64::from(r.address)).fold(start, u64::min);
        let merged_end = touching.iter().map(MemoryRange::end).fold(end, u64::max);

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for old in &touching {
            let offset = (u64::from(old.address) - merged_start) as usize;
            merged[offset..offset + old.data.len()].copy_from_slice(&old.data);
        }
        let offset = (start - merged_start) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        kept.push(MemoryRange { address: merged_start as u32, data: merged });
        kept.sort_by_key(|r| r.address);
        self.ranges = kept;
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of staged bytes.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.data.len()).sum()
    }

    /// True if the target already holds every staged byte.
    ///
    /// Unreadable memory counts as a mismatch.
    pub fn is_memory_matching<T: Target + ?Sized>(&self, target: &mut T) -> Result<bool> {
        for range in &self.ranges {
            match target.read_bytes(range.address, range.data.len(), true)? {
                Some(current) if current == range.data => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn dump(&self, diagnostics: &Diagnostics) {
        for range in &self.ranges {
            diagnostics.debug(format_args!(
                "memory range at {:#010x} size {:#x}",
                range.address,
                range.data.len()
            ));
        }
    }
}
