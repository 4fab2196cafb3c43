//! The CPU-facing bus contract and a flat test bus.

use thiserror::Error;

/// Typed memory-access failure. The machine loop reports these and skips a
/// halfword; they are not CPU-visible faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("unmapped {width}-bit access at {addr:#010x} (write: {write})")]
    Unmapped { addr: u32, width: u8, write: bool },
    #[error("{width}-bit access at {addr:#010x} runs past the end of {region}")]
    OutOfRange {
        addr: u32,
        width: u8,
        region: &'static str,
    },
}

/// Byte, halfword and word access. Implementations are responsible for
/// endianness (the machine is little-endian throughout); the core masks
/// halfword/word addresses down to their natural alignment before calling.
pub trait CpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, BusFault>;
    fn read_u16(&mut self, addr: u32) -> Result<u16, BusFault>;
    fn read_u32(&mut self, addr: u32) -> Result<u32, BusFault>;
    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), BusFault>;
    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), BusFault>;
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), BusFault>;
}

/// Flat little-endian memory starting at address zero, for tests.
pub struct FlatTestBus {
    mem: Vec<u8>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> FlatTestBus {
        FlatTestBus {
            mem: vec![0; size],
        }
    }

    /// Copy `bytes` into memory at `addr`.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn check(&self, addr: u32, width: u8, write: bool) -> Result<usize, BusFault> {
        let start = addr as usize;
        if start + (width / 8) as usize > self.mem.len() {
            return Err(BusFault::Unmapped { addr, width, write });
        }
        Ok(start)
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, BusFault> {
        let at = self.check(addr, 8, false)?;
        Ok(self.mem[at])
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, BusFault> {
        let at = self.check(addr, 16, false)?;
        Ok(u16::from_le_bytes(self.mem[at..at + 2].try_into().unwrap()))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, BusFault> {
        let at = self.check(addr, 32, false)?;
        Ok(u32::from_le_bytes(self.mem[at..at + 4].try_into().unwrap()))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), BusFault> {
        let at = self.check(addr, 8, true)?;
        self.mem[at] = value;
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), BusFault> {
        let at = self.check(addr, 16, true)?;
        self.mem[at..at + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), BusFault> {
        let at = self.check(addr, 32, true)?;
        self.mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
