//! Address routing: the single entry point per access width the core talks
//! to, plus the peripheral port registry and the write-stub fallback.

use std::collections::{HashMap, HashSet};

use pocket_cpu::bus::{BusFault, CpuBus};

use crate::ext_flash::ExternalFlash;
use crate::flash::{FlashBanks, BANK1_BASE};
use crate::regions::RamRegion;

/// The contract every peripheral must satisfy. Byte and halfword access on
/// 32-bit-only registers is synthesized by read-modify-write on the
/// enclosing word; peripherals with byte-granular registers override.
pub trait BusPort {
    fn read32(&mut self, addr: u32) -> u32;
    fn write32(&mut self, addr: u32, value: u32);

    fn read8(&mut self, addr: u32) -> u8 {
        let word = self.read32(addr & !3);
        (word >> ((addr & 3) * 8)) as u8
    }

    fn read16(&mut self, addr: u32) -> u16 {
        let word = self.read32(addr & !3);
        (word >> ((addr & 2) * 8)) as u16
    }

    fn write8(&mut self, addr: u32, value: u8) {
        let aligned = addr & !3;
        let shift = (addr & 3) * 8;
        let word = self.read32(aligned);
        self.write32(aligned, (word & !(0xFF << shift)) | ((value as u32) << shift));
    }

    fn write16(&mut self, addr: u32, value: u16) {
        let aligned = addr & !3;
        let shift = (addr & 2) * 8;
        let word = self.read32(aligned);
        self.write32(
            aligned,
            (word & !(0xFFFF << shift)) | ((value as u32) << shift),
        );
    }
}

const ITCM_SIZE: u32 = 0x1_0000;
const DTCM_BASE: u32 = 0x2000_0000;
const DTCM_END: u32 = 0x2002_0000;
const AXI_BASE: u32 = 0x2400_0000;
const AXI_END: u32 = 0x2410_0000;
const AHB1_BASE: u32 = 0x3000_0000;
const AHB1_END: u32 = 0x3002_0000;
const AHB2_BASE: u32 = 0x3002_0000;
const AHB2_END: u32 = 0x3002_8000;
const BACKUP_BASE: u32 = 0x3880_0000;
const BACKUP_END: u32 = 0x3880_1000;
const FLASH_BASE: u32 = 0x0800_0000;
const FLASH_END: u32 = 0x0820_0000;
const EXT_BASE: u32 = 0x9000_0000;
const EXT_END: u32 = 0x9010_0000;

enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    fn bits(&self) -> u8 {
        match self {
            Width::Byte => 8,
            Width::Half => 16,
            Width::Word => 32,
        }
    }
}

/// The STM32H7B0 system bus.
pub struct SystemBus {
    pub itcm: RamRegion,
    pub dtcm: RamRegion,
    pub axi_sram: RamRegion,
    pub ahb_sram1: RamRegion,
    pub ahb_sram2: RamRegion,
    pub backup_sram: RamRegion,
    pub flash: FlashBanks,
    pub ext_flash: ExternalFlash,
    peripherals: Vec<(u32, u32, Box<dyn BusPort>)>,
    stub: HashMap<u32, u32>,
    /// After reset the first 64 KiB alias flash bank 1 so the vector fetch
    /// sees the real table; a firmware write into ITCM retires the alias.
    boot_from_flash: bool,
    /// `itcm.bin` stashed at load time, installed only after reset.
    itcm_override: Option<Vec<u8>>,
    logged_reads: HashSet<u32>,
    logged_writes: HashSet<u32>,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    pub fn new() -> SystemBus {
        SystemBus {
            itcm: RamRegion::new("ITCM_RAM", 0x0000_0000, 64 * 1024),
            dtcm: RamRegion::new("DTCM_RAM", DTCM_BASE, 128 * 1024),
            axi_sram: RamRegion::new("AXI_SRAM", AXI_BASE, 1024 * 1024),
            ahb_sram1: RamRegion::new("AHB_SRAM1", AHB1_BASE, 128 * 1024),
            ahb_sram2: RamRegion::new("AHB_SRAM2", AHB2_BASE, 32 * 1024),
            backup_sram: RamRegion::new("BACKUP_SRAM", BACKUP_BASE, 4 * 1024),
            flash: FlashBanks::new(),
            ext_flash: ExternalFlash::new(),
            peripherals: Vec::new(),
            stub: HashMap::new(),
            boot_from_flash: true,
            itcm_override: None,
            logged_reads: HashSet::new(),
            logged_writes: HashSet::new(),
        }
    }

    /// Register a peripheral over the closed interval `[start, end]`.
    pub fn register_peripheral(&mut self, start: u32, end: u32, port: Box<dyn BusPort>) {
        self.peripherals.push((start, end, port));
        self.peripherals.sort_by_key(|(start, ..)| *start);
    }

    pub fn set_boot_from_flash(&mut self, enabled: bool) {
        self.boot_from_flash = enabled;
    }

    pub fn boot_from_flash(&self) -> bool {
        self.boot_from_flash
    }

    /// Load `internal_flash.bin` and pre-copy bank 1 into ITCM so retiring
    /// the boot alias is invisible to vector fetches.
    pub fn load_internal_flash(&mut self, data: &[u8]) -> usize {
        let loaded = self.flash.load_internal(data);
        self.itcm.load(0, self.flash.bank1.data());
        self.boot_from_flash = true;
        tracing::info!(bytes = loaded, "internal flash loaded, bank 1 aliased to ITCM");
        loaded
    }

    /// Keep `itcm.bin` aside; it must not be visible before the reset
    /// vector fetch.
    pub fn stash_itcm_override(&mut self, data: Vec<u8>) {
        tracing::info!(bytes = data.len(), "ITCM override deferred until reset");
        self.itcm_override = Some(data);
    }

    /// Install the deferred ITCM snapshot and retire the flash alias.
    /// Callers invoke this after the CPU reset sequence.
    pub fn apply_itcm_override(&mut self) {
        if let Some(data) = self.itcm_override.take() {
            self.itcm.load(0, &data);
            self.boot_from_flash = false;
            tracing::info!(bytes = data.len(), "ITCM override installed");
        }
    }

    fn find_peripheral(&mut self, addr: u32) -> Option<&mut Box<dyn BusPort>> {
        self.peripherals
            .iter_mut()
            .find(|(start, end, _)| (*start..=*end).contains(&addr))
            .map(|(.., port)| port)
    }

    /// STM32H7B0 peripheral windows served by the write-stub when no real
    /// model is registered.
    fn is_peripheral_addr(addr: u32) -> bool {
        matches!(addr,
            0x4000_0000..=0x4000_7FFF
            | 0x4001_0000..=0x4001_6FFF
            | 0x4002_0000..=0x4007_FFFF
            | 0x4802_0000..=0x4802_2FFF
            | 0x5000_0000..=0x5000_3FFF
            | 0x5100_0000..=0x5200_8FFF
            | 0x5800_0000..=0x5802_6FFF
            | 0x5C00_0000..=0x5C00_FFFF)
    }

    /// Best-effort peripheral naming for trace logs.
    fn peripheral_name(addr: u32) -> &'static str {
        match addr {
            0x5802_4400..=0x5802_47FF => "RCC",
            0x5802_0000..=0x5802_03FF => "GPIOA",
            0x5802_0400..=0x5802_07FF => "GPIOB",
            0x5802_0800..=0x5802_0BFF => "GPIOC",
            0x5802_0C00..=0x5802_0FFF => "GPIOD",
            0x5802_1000..=0x5802_13FF => "GPIOE",
            0x5000_1000..=0x5000_1FFF => "LTDC",
            0x4000_3800..=0x4000_3BFF => "SPI2",
            0x4001_5800..=0x4001_5BFF => "SAI1",
            0x5200_5000..=0x5200_53FF => "OCTOSPI1",
            0x5200_9000..=0x5200_93FF => "OCTOSPIM",
            0x5200_2000..=0x5200_23FF => "FLASH_IF",
            0x4002_0000..=0x4002_03FF => "DMA1",
            0x4002_0400..=0x4002_07FF => "DMA2",
            0x5802_5400..=0x5802_57FF => "BDMA",
            0x5802_4800..=0x5802_4BFF => "PWR",
            0x5800_0400..=0x5800_07FF => "SYSCFG",
            0x5800_0000..=0x5800_03FF => "EXTI",
            0x4000_5400..=0x4000_57FF => "I2C1",
            0x5800_4800..=0x5800_4BFF => "IWDG",
            0x4001_0000..=0x4001_03FF => "TIM1",
            0x4000_0000..=0x4000_03FF => "TIM2",
            0x4000_0400..=0x4000_07FF => "TIM3",
            0x5C00_1000..=0x5C00_13FF => "DBGMCU",
            _ => "UNKNOWN_PERIPH",
        }
    }

    fn read_region(region: &RamRegion, addr: u32, width: &Width) -> Result<u32, BusFault> {
        Ok(match width {
            Width::Byte => region.read8(addr)? as u32,
            Width::Half => region.read16(addr)? as u32,
            Width::Word => region.read32(addr)?,
        })
    }

    fn write_region(
        region: &mut RamRegion,
        addr: u32,
        value: u32,
        width: &Width,
    ) -> Result<(), BusFault> {
        match width {
            Width::Byte => region.write8(addr, value as u8),
            Width::Half => region.write16(addr, value as u16),
            Width::Word => region.write32(addr, value),
        }
    }

    fn do_read(&mut self, addr: u32, width: Width) -> Result<u32, BusFault> {
        // Boot alias / ITCM.
        if addr < ITCM_SIZE {
            if self.boot_from_flash {
                let flash_addr = BANK1_BASE + addr;
                return Ok(match width {
                    Width::Byte => self.flash.read8(flash_addr) as u32,
                    Width::Half => self.flash.read16(flash_addr) as u32,
                    Width::Word => self.flash.read32(flash_addr),
                });
            }
            return Self::read_region(&self.itcm, addr, &width);
        }

        if (FLASH_BASE..FLASH_END).contains(&addr) {
            return Ok(match width {
                Width::Byte => self.flash.read8(addr) as u32,
                Width::Half => self.flash.read16(addr) as u32,
                Width::Word => self.flash.read32(addr),
            });
        }

        if (DTCM_BASE..DTCM_END).contains(&addr) {
            return Self::read_region(&self.dtcm, addr, &width);
        }
        if (AXI_BASE..AXI_END).contains(&addr) {
            return Self::read_region(&self.axi_sram, addr, &width);
        }
        if (AHB1_BASE..AHB1_END).contains(&addr) {
            return Self::read_region(&self.ahb_sram1, addr, &width);
        }
        if (AHB2_BASE..AHB2_END).contains(&addr) {
            return Self::read_region(&self.ahb_sram2, addr, &width);
        }
        if (BACKUP_BASE..BACKUP_END).contains(&addr) {
            return Self::read_region(&self.backup_sram, addr, &width);
        }

        if (EXT_BASE..EXT_END).contains(&addr) {
            if self.ext_flash.contains(addr) {
                return Ok(match width {
                    Width::Byte => self.ext_flash.read8(addr) as u32,
                    Width::Half => self.ext_flash.read16(addr) as u32,
                    Width::Word => self.ext_flash.read32(addr),
                });
            }
            return Ok(0xFF);
        }

        if let Some(port) = self.find_peripheral(addr) {
            return Ok(match width {
                Width::Byte => port.read8(addr) as u32,
                Width::Half => port.read16(addr) as u32,
                Width::Word => port.read32(addr),
            });
        }

        if Self::is_peripheral_addr(addr) {
            let value = self.stub.get(&(addr & !3)).copied().unwrap_or(0);
            if self.logged_reads.insert(addr) {
                tracing::debug!(
                    "stub read {:#010x} ({}) -> {value:#010x}",
                    addr,
                    Self::peripheral_name(addr)
                );
            }
            return Ok(match width {
                Width::Byte => (value >> ((addr & 3) * 8)) & 0xFF,
                Width::Half => (value >> ((addr & 2) * 8)) & 0xFFFF,
                Width::Word => value,
            });
        }

        Err(BusFault::Unmapped {
            addr,
            width: width.bits(),
            write: false,
        })
    }

    fn do_write(&mut self, addr: u32, value: u32, width: Width) -> Result<(), BusFault> {
        // ITCM is always writable; the first firmware write also retires
        // the flash boot alias (the same bytes were pre-copied at load).
        if addr < ITCM_SIZE {
            Self::write_region(&mut self.itcm, addr, value, &width)?;
            self.boot_from_flash = false;
            return Ok(());
        }

        // Flash programming is a peripheral affair; plain stores are
        // ignored.
        if (FLASH_BASE..FLASH_END).contains(&addr) || (EXT_BASE..EXT_END).contains(&addr) {
            return Ok(());
        }

        if (DTCM_BASE..DTCM_END).contains(&addr) {
            return Self::write_region(&mut self.dtcm, addr, value, &width);
        }
        if (AXI_BASE..AXI_END).contains(&addr) {
            return Self::write_region(&mut self.axi_sram, addr, value, &width);
        }
        if (AHB1_BASE..AHB1_END).contains(&addr) {
            return Self::write_region(&mut self.ahb_sram1, addr, value, &width);
        }
        if (AHB2_BASE..AHB2_END).contains(&addr) {
            return Self::write_region(&mut self.ahb_sram2, addr, value, &width);
        }
        if (BACKUP_BASE..BACKUP_END).contains(&addr) {
            return Self::write_region(&mut self.backup_sram, addr, value, &width);
        }

        if let Some(port) = self.find_peripheral(addr) {
            match width {
                Width::Byte => port.write8(addr, value as u8),
                Width::Half => port.write16(addr, value as u16),
                Width::Word => port.write32(addr, value),
            }
            return Ok(());
        }

        if Self::is_peripheral_addr(addr) {
            // The stub retains the last value written per word address.
            let aligned = addr & !3;
            let old = self.stub.get(&aligned).copied().unwrap_or(0);
            let new = match width {
                Width::Byte => {
                    let shift = (addr & 3) * 8;
                    (old & !(0xFF << shift)) | ((value & 0xFF) << shift)
                }
                Width::Half => {
                    let shift = (addr & 2) * 8;
                    (old & !(0xFFFF << shift)) | ((value & 0xFFFF) << shift)
                }
                Width::Word => value,
            };
            self.stub.insert(aligned, new);
            if self.logged_writes.insert(addr) {
                tracing::debug!(
                    "stub write {:#010x} ({}) = {value:#010x}",
                    addr,
                    Self::peripheral_name(addr)
                );
            }
            return Ok(());
        }

        Err(BusFault::Unmapped {
            addr,
            width: width.bits(),
            write: true,
        })
    }
}

impl CpuBus for SystemBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, BusFault> {
        Ok(self.do_read(addr, Width::Byte)? as u8)
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, BusFault> {
        Ok(self.do_read(addr & !1, Width::Half)? as u16)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, BusFault> {
        self.do_read(addr & !3, Width::Word)
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), BusFault> {
        self.do_write(addr, value as u32, Width::Byte)
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), BusFault> {
        self.do_write(addr & !1, value as u32, Width::Half)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), BusFault> {
        self.do_write(addr & !3, value, Width::Word)
    }
}

// Keep the external flash module's base visible for tests and loaders.
pub use crate::ext_flash::BASE as EXT_FLASH_BASE;
