//! Byte-addressable RAM regions with little-endian sub-word access.

use bitflags::bitflags;
use pocket_cpu::bus::BusFault;

bitflags! {
    /// Access attributes; flash regions drop `W`, peripheral windows drop
    /// `X`. Only `W` is enforced today (the executor has no MPU).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionAttrs: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

/// One contiguous RAM region.
pub struct RamRegion {
    name: &'static str,
    base: u32,
    data: Vec<u8>,
    attrs: RegionAttrs,
}

impl RamRegion {
    pub fn new(name: &'static str, base: u32, size: usize) -> RamRegion {
        RamRegion {
            name,
            base,
            data: vec![0; size],
            attrs: RegionAttrs::all(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn attrs(&self) -> RegionAttrs {
        self.attrs
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.data.len() as u32
    }

    fn offset(&self, addr: u32, width: u8) -> Result<usize, BusFault> {
        let off = addr.wrapping_sub(self.base) as usize;
        if off + (width / 8) as usize > self.data.len() {
            return Err(BusFault::OutOfRange {
                addr,
                width,
                region: self.name,
            });
        }
        Ok(off)
    }

    pub fn read8(&self, addr: u32) -> Result<u8, BusFault> {
        let off = self.offset(addr, 8)?;
        Ok(self.data[off])
    }

    pub fn read16(&self, addr: u32) -> Result<u16, BusFault> {
        let off = self.offset(addr, 16)?;
        Ok(u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap()))
    }

    pub fn read32(&self, addr: u32) -> Result<u32, BusFault> {
        let off = self.offset(addr, 32)?;
        Ok(u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap()))
    }

    pub fn write8(&mut self, addr: u32, value: u8) -> Result<(), BusFault> {
        let off = self.offset(addr, 8)?;
        self.data[off] = value;
        Ok(())
    }

    pub fn write16(&mut self, addr: u32, value: u16) -> Result<(), BusFault> {
        let off = self.offset(addr, 16)?;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<(), BusFault> {
        let off = self.offset(addr, 32)?;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`, truncating what
    /// does not fit.
    pub fn load(&mut self, offset: usize, data: &[u8]) {
        if offset >= self.data.len() {
            return;
        }
        let len = data.len().min(self.data.len() - offset);
        self.data[offset..offset + len].copy_from_slice(&data[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_sub_word_access() {
        let mut region = RamRegion::new("TEST", 0x2000_0000, 0x100);
        region.write32(0x2000_0010, 0x1234_5678).unwrap();
        assert_eq!(region.read8(0x2000_0010).unwrap(), 0x78);
        assert_eq!(region.read8(0x2000_0013).unwrap(), 0x12);
        assert_eq!(region.read16(0x2000_0010).unwrap(), 0x5678);
        assert_eq!(region.read16(0x2000_0012).unwrap(), 0x1234);
    }

    #[test]
    fn out_of_range_access_is_typed() {
        let region = RamRegion::new("TEST", 0x2000_0000, 0x100);
        let err = region.read32(0x2000_00FE).unwrap_err();
        assert!(matches!(err, BusFault::OutOfRange { region: "TEST", .. }));
    }

    #[test]
    fn load_truncates_to_region() {
        let mut region = RamRegion::new("TEST", 0, 4);
        region.load(2, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(region.read8(2).unwrap(), 0xAA);
        assert_eq!(region.read8(3).unwrap(), 0xBB);
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn write_then_read_round_trips(off in 0u32..0xFC, value: u32) {
                let mut region = RamRegion::new("TEST", 0x1000, 0x100);
                let addr = 0x1000 + off;
                region.write32(addr, value).unwrap();
                prop_assert_eq!(region.read32(addr).unwrap(), value);
                prop_assert_eq!(region.read8(addr).unwrap(), value as u8);
                prop_assert_eq!(region.read16(addr).unwrap(), value as u16);
            }
        }
    }
}
