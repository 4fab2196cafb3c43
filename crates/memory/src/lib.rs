//! The STM32H7B0 memory and bus fabric: RAM banks, the two internal flash
//! banks with the boot-time alias at address zero, the memory-mapped
//! external SPI flash with on-the-fly decryption, a peripheral port
//! registry, and a write-stub fallback for unmodeled peripheral space.
//!
//! [`SystemBus`] implements `pocket_cpu::bus::CpuBus`; the private
//! peripheral bus never reaches it (the core services that range itself).

pub mod bus;
pub mod ext_flash;
pub mod flash;
pub mod otfdec;
pub mod regions;

pub use bus::{BusPort, SystemBus};
pub use ext_flash::{ExternalFlash, GcmConfig, OtfConfig};
pub use flash::FlashBanks;
pub use pocket_cpu::bus::{BusFault, CpuBus};
pub use regions::{RamRegion, RegionAttrs};
