//! Register cache.
//!
//! Holds the current register set of one target. An empty cache means the
//! values are unknown; anything that changes execution state clears it.

use crate::error::{Result, TargetError};

/// Something that can fetch the complete register set in one go.
pub trait RegisterSource {
    fn fetch_registers(&mut self) -> Result<Vec<u32>>;
}

#[derive(Debug, Default, Clone)]
pub struct RegisterCache {
    registers: Vec<u32>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of register `index`, refetching the whole set if it is not cached.
    pub fn get<S: RegisterSource + ?Sized>(&mut self, index: u32, source: &mut S) -> Result<u32> {
        if index as usize >= self.registers.len() {
            self.registers = source.fetch_registers()?;
        }
        self.registers.get(index as usize).copied().ok_or(TargetError::RegisterOutOfRange {
            index,
            available: self.registers.len(),
        })
    }

    pub fn invalidate(&mut self) {
        self.registers.clear();
    }

    pub fn store(&mut self, registers: Vec<u32>) {
        self.registers = registers;
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn values(&self) -> &[u32] {
        &self.registers
    }
}
