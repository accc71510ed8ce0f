//! Corefile target.
//!
//! A post-mortem snapshot made of three flat dumps: ROM, RAM and the register
//! file. Only reads are meaningful; everything that would change execution
//! state fails with [`TargetError::Unsupported`].

use super::{ExecutionState, HaltReason, HaltWatch, Target, TargetEvent, TargetKind};
use crate::config::CorefileLayout;
use crate::error::{Result, TargetError};
use crate::flash::{FlashProgress, FlashReport};
use crate::memory::{MemoryImage, MemoryRange};
use crossbeam_channel::Receiver;
use std::path::Path;

#[derive(Debug)]
pub struct CorefileTarget {
    memory: Vec<MemoryRange>,
    registers: Vec<u32>,
    halt: HaltWatch,
}

impl CorefileTarget {
    /// Load the three dump files.
    pub fn open(rom: &Path, ram: &Path, registers: &Path, layout: CorefileLayout) -> Result<Self> {
        Ok(Self::from_parts(
            layout,
            std::fs::read(rom)?,
            std::fs::read(ram)?,
            &std::fs::read(registers)?,
        ))
    }

    /// Build a corefile from dumps already in memory.
    ///
    /// Trailing register bytes that do not make up a whole word are ignored.
    pub fn from_parts(layout: CorefileLayout, rom: Vec<u8>, ram: Vec<u8>, registers: &[u8]) -> Self {
        let registers = registers
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();
        Self {
            memory: vec![
                MemoryRange { address: layout.rom_base, data: rom },
                MemoryRange { address: layout.ram_base, data: ram },
            ],
            registers,
            halt: HaltWatch::new(),
        }
    }

    pub fn registers(&self) -> &[u32] {
        &self.registers
    }

    fn slice(&self, address: u32, count: usize) -> Option<&[u8]> {
        self.memory.iter().find_map(|range| {
            let offset = usize::try_from(address.checked_sub(range.address)?).ok()?;
            range.data.get(offset..offset.checked_add(count)?)
        })
    }
}

impl Target for CorefileTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Corefile
    }

    fn read_bytes(&mut self, address: u32, count: usize, allow_failure: bool) -> Result<Option<Vec<u8>>> {
        match self.slice(address, count) {
            Some(data) => Ok(Some(data.to_vec())),
            None if allow_failure => Ok(None),
            None => Err(TargetError::Unmapped { address, len: count }),
        }
    }

    fn read_raw_register(&mut self, register: u32) -> Result<u32> {
        self.registers.get(register as usize).copied().ok_or(TargetError::RegisterOutOfRange {
            index: register,
            available: self.registers.len(),
        })
    }

    fn request_single_step(&mut self) -> Result<()> {
        Err(TargetError::Unsupported("request_single_step"))
    }

    fn resume(&mut self) -> Result<()> {
        Err(TargetError::Unsupported("resume"))
    }

    fn request_halt(&mut self) -> Result<()> {
        Err(TargetError::Unsupported("request_halt"))
    }

    fn reset(&mut self) -> Result<()> {
        Err(TargetError::Unsupported("reset"))
    }

    fn breakpoint_set(&mut self, _address: u32, _length: u32) -> Result<bool> {
        Err(TargetError::Unsupported("breakpoint_set"))
    }

    fn breakpoint_clear(&mut self, _address: u32, _length: u32) -> Result<bool> {
        Err(TargetError::Unsupported("breakpoint_clear"))
    }

    fn memory_map(&mut self) -> Result<String> {
        Err(TargetError::Unsupported("memory_map"))
    }

    fn sync_flash(&mut self, _image: &MemoryImage, _progress: &mut FlashProgress) -> Result<FlashReport> {
        Err(TargetError::Unsupported("sync_flash"))
    }

    fn poll_halt(&mut self) -> Result<Option<HaltReason>> {
        Ok(None)
    }

    fn execution_state(&self) -> ExecutionState {
        self.halt.state()
    }

    fn events(&self) -> Receiver<TargetEvent> {
        self.halt.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corefile() -> CorefileTarget {
        let rom: Vec<u8> = (0..16).collect();
        let ram = vec![0xaa; 8];
        let registers: Vec<u8> = [0x2000_0400u32, 0x0800_0131, 7].iter().flat_map(|r| r.to_le_bytes()).collect();
        CorefileTarget::from_parts(CorefileLayout::default(), rom, ram, &registers)
    }

    #[test]
    fn test_reads_inside_dumps() {
        let mut core = corefile();
        assert_eq!(core.read_word(0x0800_0000).unwrap(), 0x0302_0100);
        assert_eq!(core.read_word(0x0800_000c).unwrap(), 0x0f0e_0d0c);
        assert_eq!(core.read_bytes(0x2000_0004, 4, false).unwrap(), Some(vec![0xaa; 4]));
    }

    #[test]
    fn test_reads_outside_dumps() {
        let mut core = corefile();
        assert!(matches!(core.read_word(0x0800_000d), Err(TargetError::Unmapped { .. })));
        assert!(matches!(core.read_word(0x1000_0000), Err(TargetError::Unmapped { .. })));
        assert_eq!(core.read_bytes(0x2000_0006, 4, true).unwrap(), None);
    }

    #[test]
    fn test_registers() {
        let mut core = corefile();
        assert_eq!(core.read_raw_register(1).unwrap(), 0x0800_0131);
        assert!(matches!(
            core.read_raw_register(3),
            Err(TargetError::RegisterOutOfRange { index: 3, available: 3 })
        ));
    }

    #[test]
    fn test_control_is_unsupported() {
        let mut core = corefile();
        assert!(matches!(core.resume(), Err(TargetError::Unsupported("resume"))));
        assert!(matches!(core.reset(), Err(TargetError::Unsupported(_))));
        assert!(matches!(core.breakpoint_set(0, 2), Err(TargetError::Unsupported(_))));
        assert_eq!(core.execution_state(), ExecutionState::Halted);
        assert_eq!(core.poll_halt().unwrap(), None);
    }

    #[test]
    fn test_open_missing_file() {
        let missing = Path::new("/nonexistent/troll/rom.bin");
        let err = CorefileTarget::open(missing, missing, missing, CorefileLayout::default()).unwrap_err();
        assert!(matches!(err, TargetError::Io(_)));
    }
}
