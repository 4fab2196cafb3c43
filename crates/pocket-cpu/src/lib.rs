//! Cortex-M7 core: architectural state, the instruction executor, and the
//! core-private peripheral block (SysTick, NVIC/SCB via `pocket-interrupts`,
//! FPU/MPU shims).
//!
//! The core talks to the outside world through the [`bus::CpuBus`] trait;
//! `memory::SystemBus` is the production implementation and
//! [`bus::FlatTestBus`] serves tests. Accesses to the private peripheral
//! bus (0xE000E000..0xE000EFFF) never reach the system bus.

pub mod bus;
pub mod exec;
pub mod ppb;
pub mod state;

pub use bus::{BusFault, CpuBus, FlatTestBus};
pub use exec::{Cpu, StepExit};
pub use state::CpuState;
