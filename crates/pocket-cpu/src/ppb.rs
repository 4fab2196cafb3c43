//! Core-private peripheral block (0xE000E000..0xE000EFFF): SysTick and the
//! FPU/MPU/debug register shims. The NVIC/SCB half of this space lives in
//! `pocket-interrupts`; routing across the two happens in the executor.

use std::collections::HashMap;

use bitflags::bitflags;

/// True when the address belongs to the private peripheral bus and must not
/// reach the system bus.
pub fn contains(addr: u32) -> bool {
    (0xE000_E000..=0xE000_EFFF).contains(&addr)
}

const SYST_CSR: u32 = 0xE000_E010;
const SYST_RVR: u32 = 0xE000_E014;
const SYST_CVR: u32 = 0xE000_E018;
const SYST_CALIB: u32 = 0xE000_E01C;

bitflags! {
    /// SysTick control/status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SystCsr: u32 {
        const ENABLE = 1 << 0;
        const TICKINT = 1 << 1;
        const CLKSOURCE = 1 << 2;
        const COUNTFLAG = 1 << 16;
    }
}

/// The 24-bit down-counter. `tick` reports whether a reload happened with
/// TICKINT set, in which case the caller pends exception 15.
pub struct SysTick {
    csr: SystCsr,
    reload: u32,
    current: u32,
}

impl Default for SysTick {
    fn default() -> Self {
        Self::new()
    }
}

impl SysTick {
    pub fn new() -> SysTick {
        SysTick {
            csr: SystCsr::CLKSOURCE,
            reload: 0,
            current: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = SysTick::new();
    }

    /// Advance by `cycles` processor cycles.
    pub fn tick(&mut self, cycles: u32) -> bool {
        if !self.csr.contains(SystCsr::ENABLE) {
            return false;
        }
        let mut fired = false;
        let mut remaining = cycles;
        while remaining > 0 {
            if self.current >= remaining {
                self.current -= remaining;
                break;
            }
            remaining -= self.current + 1;
            self.current = self.reload;
            self.csr |= SystCsr::COUNTFLAG;
            fired = self.csr.contains(SystCsr::TICKINT);
        }
        fired
    }

    pub fn handles(addr: u32) -> bool {
        (SYST_CSR..=SYST_CALIB).contains(&addr)
    }

    pub fn mmio_read(&mut self, addr: u32) -> u32 {
        match addr {
            SYST_CSR => {
                let value = self.csr.bits();
                // COUNTFLAG clears on read.
                self.csr -= SystCsr::COUNTFLAG;
                value
            }
            SYST_RVR => self.reload,
            SYST_CVR => self.current,
            // NOREF: no external reference clock, calibration unknown.
            SYST_CALIB => 0x8000_0000,
            _ => 0,
        }
    }

    pub fn mmio_write(&mut self, addr: u32, value: u32) {
        match addr {
            SYST_CSR => {
                self.csr = SystCsr::from_bits_truncate(
                    (value & 0x7) | (self.csr.bits() & SystCsr::COUNTFLAG.bits()),
                );
            }
            SYST_RVR => self.reload = value & 0x00FF_FFFF,
            SYST_CVR => {
                // Any write clears the counter and COUNTFLAG.
                self.current = 0;
                self.csr -= SystCsr::COUNTFLAG;
            }
            _ => {}
        }
    }
}

const CPACR: u32 = 0xE000_ED88;
const FPCCR: u32 = 0xE000_EF34;
const FPCAR: u32 = 0xE000_EF38;
const FPDSCR: u32 = 0xE000_EF3C;
const MPU_TYPE: u32 = 0xE000_ED90;

/// Write-latching shims for the FPU, MPU and debug registers: firmware
/// probes these during init and only needs its writes to read back.
pub struct PpbShims {
    cpacr: u32,
    fpccr: u32,
    fpcar: u32,
    fpdscr: u32,
    mpu: HashMap<u32, u32>,
}

impl Default for PpbShims {
    fn default() -> Self {
        Self::new()
    }
}

impl PpbShims {
    pub fn new() -> PpbShims {
        PpbShims {
            cpacr: 0,
            fpccr: 0xC000_0000,
            fpcar: 0,
            fpdscr: 0,
            mpu: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = PpbShims::new();
    }

    pub fn read(&self, addr: u32) -> u32 {
        match addr {
            CPACR => self.cpacr,
            FPCCR => self.fpccr,
            FPCAR => self.fpcar,
            FPDSCR => self.fpdscr,
            // 8 unified MPU regions, no separate instruction map.
            MPU_TYPE => 0x0000_0800,
            a if (0xE000_ED94..=0xE000_EDB8).contains(&a) => {
                self.mpu.get(&a).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn write(&mut self, addr: u32, value: u32) {
        match addr {
            CPACR => self.cpacr = value,
            FPCCR => self.fpccr = value,
            FPCAR => self.fpcar = value,
            FPDSCR => self.fpdscr = value,
            a if (0xE000_ED94..=0xE000_EDB8).contains(&a) => {
                self.mpu.insert(a, value);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systick_counts_down_and_reloads() {
        let mut st = SysTick::new();
        st.mmio_write(SYST_RVR, 9);
        st.mmio_write(SYST_CVR, 0);
        st.mmio_write(SYST_CSR, (SystCsr::ENABLE | SystCsr::TICKINT).bits());
        // current == 0: first tick wraps immediately and reloads.
        assert!(st.tick(1));
        assert_eq!(st.mmio_read(SYST_CVR), 9);
        // Nine more cycles bring it to zero without wrapping.
        assert!(!st.tick(9));
        assert_eq!(st.mmio_read(SYST_CVR), 0);
        assert!(st.tick(1));
    }

    #[test]
    fn systick_countflag_clears_on_csr_read() {
        let mut st = SysTick::new();
        st.mmio_write(SYST_RVR, 0);
        st.mmio_write(SYST_CSR, SystCsr::ENABLE.bits());
        st.tick(1);
        let csr = st.mmio_read(SYST_CSR);
        assert_ne!(csr & SystCsr::COUNTFLAG.bits(), 0);
        assert_eq!(st.mmio_read(SYST_CSR) & SystCsr::COUNTFLAG.bits(), 0);
    }

    #[test]
    fn systick_disabled_does_not_fire() {
        let mut st = SysTick::new();
        st.mmio_write(SYST_RVR, 1);
        assert!(!st.tick(100));
    }

    #[test]
    fn shims_latch_writes() {
        let mut shims = PpbShims::new();
        assert_eq!(shims.read(MPU_TYPE), 0x800);
        shims.write(CPACR, 0x00F0_0000);
        assert_eq!(shims.read(CPACR), 0x00F0_0000);
        shims.write(0xE000_ED9C, 0x1234_5678); // MPU_RBAR
        assert_eq!(shims.read(0xE000_ED9C), 0x1234_5678);
        assert_eq!(shims.read(0xE000_EDF0), 0); // debug space
    }
}
