//! The assembled machine: CPU core, system bus, device stubs, and the
//! host-side step loop with its recovery policy.
//!
//! Scheduling is single-threaded and cooperative; `run_slice` executes up
//! to a cycle budget and returns early on BKPT, a breakpoint hit, a halted
//! core, or the consecutive-fault limit.

pub mod devices;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use firmware::{RomError, RomSet};
use memory::SystemBus;
use pocket_cpu::bus::BusFault;
use pocket_cpu::{Cpu, StepExit};

use crate::devices::{
    Button, FlashIf, GpioPort, PinState, Pwr, Rcc, SharedPins, FLASH_IF_BASE, FLASH_IF_END,
    GPIOA_BASE, GPIO_PORT_SIZE, PWR_BASE, PWR_END, RCC_BASE, RCC_END,
};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Rom(#[from] RomError),
    #[error("reset failed: {0}")]
    Reset(BusFault),
}

/// Host-tunable knobs.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Cycle budget per `run_frame` call.
    pub cycles_per_frame: u64,
    /// Consecutive decode/execute faults tolerated before giving up.
    pub max_consecutive_faults: u32,
    /// Register the RCC/PWR/FLASH-IF/GPIO stubs on the bus.
    pub default_devices: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            cycles_per_frame: 1_000_000,
            max_consecutive_faults: 100,
            default_devices: true,
        }
    }
}

/// Why `run_slice` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The cycle budget was consumed.
    Completed { cycles: u64 },
    /// The core executed WFI and nothing is pending.
    Halted { cycles: u64 },
    /// BKPT retired: a debug stop, not a fault.
    Bkpt { pc: u32, comment: u8 },
    /// The PC landed on a host breakpoint.
    Breakpoint { pc: u32 },
    /// Too many consecutive faults; the machine has been halted.
    FaultLimit { pc: u32 },
}

pub struct Machine {
    pub cpu: Cpu,
    pub bus: SystemBus,
    config: MachineConfig,
    breakpoints: BTreeSet<u32>,
    consecutive_faults: u32,
    pins: SharedPins,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Machine {
        let mut bus = SystemBus::new();
        let pins: SharedPins = Rc::new(RefCell::new(PinState::default()));
        if config.default_devices {
            bus.register_peripheral(RCC_BASE, RCC_END, Box::new(Rcc::new()));
            bus.register_peripheral(PWR_BASE, PWR_END, Box::new(Pwr::new()));
            bus.register_peripheral(FLASH_IF_BASE, FLASH_IF_END, Box::new(FlashIf::new()));
            for port in 0..5usize {
                let base = GPIOA_BASE + port as u32 * GPIO_PORT_SIZE;
                bus.register_peripheral(
                    base,
                    base + GPIO_PORT_SIZE - 1,
                    Box::new(GpioPort::new(port, pins.clone())),
                );
            }
        }
        Machine {
            cpu: Cpu::new(),
            bus,
            config,
            breakpoints: BTreeSet::new(),
            consecutive_faults: 0,
            pins,
        }
    }

    /// Load a ROM directory (or a bare image file) and reset.
    pub fn boot_rom_path(&mut self, path: &Path) -> Result<(), MachineError> {
        let set = RomSet::load(path)?;
        self.install_rom_set(&set);
        self.reset()
    }

    /// Install an in-memory ROM set without resetting.
    pub fn install_rom_set(&mut self, set: &RomSet) {
        set.install(&mut self.bus);
    }

    /// Architectural reset, then install any deferred ITCM snapshot. The
    /// order matters: the vector fetch must see the flash boot alias.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        self.bus.set_boot_from_flash(true);
        self.consecutive_faults = 0;
        self.cpu.reset(&mut self.bus).map_err(MachineError::Reset)?;
        self.bus.apply_itcm_override();
        tracing::info!(
            "machine reset: pc={:#010x} sp={:#010x}",
            self.cpu.state.pc(),
            self.cpu.state.sp()
        );
        Ok(())
    }

    pub fn add_breakpoint(&mut self, addr: u32) {
        self.breakpoints.insert(addr & !1);
    }

    pub fn remove_breakpoint(&mut self, addr: u32) {
        self.breakpoints.remove(&(addr & !1));
    }

    /// Press or release a front-panel button (active-low wiring).
    pub fn set_button(&mut self, button: Button, pressed: bool) {
        let (port, pin) = button.wiring();
        self.pins.borrow_mut().set_pin(port, pin, !pressed);
    }

    pub fn cycles(&self) -> u64 {
        self.cpu.cycles
    }

    /// Run up to `max_cycles` cycles.
    pub fn run_slice(&mut self, max_cycles: u64) -> RunExit {
        let start = self.cpu.cycles;
        while self.cpu.cycles.wrapping_sub(start) < max_cycles {
            let pc = self.cpu.state.pc();
            if self.breakpoints.contains(&pc) {
                return RunExit::Breakpoint { pc };
            }
            match self.cpu.step(&mut self.bus) {
                Ok(StepExit::Continue) => {
                    self.consecutive_faults = 0;
                }
                Ok(StepExit::Halted) => {
                    // A halted core burns its budget one cycle at a time
                    // and re-checks pending exceptions each step; the timer
                    // keeps ticking, so a SysTick wake-up happens in-loop.
                    self.consecutive_faults = 0;
                }
                Ok(StepExit::Bkpt(comment)) => {
                    self.consecutive_faults = 0;
                    return RunExit::Bkpt {
                        pc: self.cpu.last_pc(),
                        comment,
                    };
                }
                Err(fault) => {
                    if self.recover_from_fault(fault) {
                        return RunExit::FaultLimit {
                            pc: self.cpu.state.pc(),
                        };
                    }
                }
            }
        }
        let cycles = self.cpu.cycles - start;
        if self.cpu.state.halted {
            RunExit::Halted { cycles }
        } else {
            RunExit::Completed { cycles }
        }
    }

    /// One display frame's worth of cycles.
    pub fn run_frame(&mut self) -> RunExit {
        self.run_slice(self.config.cycles_per_frame)
    }

    /// Host-side recovery: report, skip one halfword, and give up after the
    /// configured number of consecutive faults. Returns true at the limit.
    fn recover_from_fault(&mut self, fault: BusFault) -> bool {
        self.consecutive_faults += 1;
        tracing::warn!(
            "execution fault near {:#010x} ({} consecutive): {fault}",
            self.cpu.last_pc(),
            self.consecutive_faults
        );
        let pc = self.cpu.state.pc();
        self.cpu.state.set_pc_sequential(pc.wrapping_add(2));
        if self.consecutive_faults >= self.config.max_consecutive_faults {
            tracing::error!(
                "fault limit reached, halting machine\n{}",
                self.cpu.state.dump()
            );
            self.cpu.state.halted = true;
            return true;
        }
        false
    }
}
