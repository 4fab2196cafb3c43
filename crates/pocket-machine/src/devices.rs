//! Minimal device models registered on the system bus.
//!
//! These exist so firmware bring-up loops make progress: the clock tree
//! reports ready as soon as an oscillator or PLL is switched on, power
//! voltage scaling is always ready, the flash interface is never busy, and
//! the GPIO ports expose button pins as inputs. Everything else falls
//! through to the bus write-stub.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use memory::BusPort;

pub const RCC_BASE: u32 = 0x5802_4400;
pub const RCC_END: u32 = 0x5802_47FF;
pub const PWR_BASE: u32 = 0x5802_4800;
pub const PWR_END: u32 = 0x5802_4BFF;
pub const FLASH_IF_BASE: u32 = 0x5200_2000;
pub const FLASH_IF_END: u32 = 0x5200_23FF;
pub const GPIOA_BASE: u32 = 0x5802_0000;
pub const GPIO_PORT_SIZE: u32 = 0x400;
pub const GPIO_END: u32 = 0x5802_13FF; // ports A..E

/// Reset and clock control. Registers latch writes; CR and CFGR reads fold
/// in the ready/status bits the firmware spins on.
pub struct Rcc {
    regs: HashMap<u32, u32>,
}

const RCC_CR: u32 = 0x00;
const RCC_CFGR: u32 = 0x10;

impl Default for Rcc {
    fn default() -> Self {
        Self::new()
    }
}

impl Rcc {
    pub fn new() -> Rcc {
        let mut regs = HashMap::new();
        // HSION | HSIRDY out of reset.
        regs.insert(RCC_CR, 0x0000_0005);
        regs.insert(0x28, 0x0202_0200); // PLLCKSELR
        regs.insert(0x2C, 0x01FF_0000); // PLLCFGR
        Rcc { regs }
    }

    fn offset(addr: u32) -> u32 {
        addr - RCC_BASE
    }
}

impl BusPort for Rcc {
    fn read32(&mut self, addr: u32) -> u32 {
        let off = Self::offset(addr);
        let value = self.regs.get(&off).copied().unwrap_or(0);
        match off {
            RCC_CR => {
                // Every oscillator/PLL that is ON reads back READY:
                // HSI(0->2), CSI(7->8), HSE(16->17), PLL1..3 (24/26/28 ->
                // +1).
                let mut ready = 0;
                for (on, rdy) in [(0, 2), (7, 8), (16, 17), (24, 25), (26, 27), (28, 29)] {
                    if value & (1 << on) != 0 {
                        ready |= 1 << rdy;
                    }
                }
                value | ready
            }
            // SWS mirrors SW: the selected system clock is always granted.
            RCC_CFGR => (value & !0x38) | ((value & 0x7) << 3),
            _ => value,
        }
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.regs.insert(Self::offset(addr), value);
    }
}

/// Power control: voltage scaling is always ready.
pub struct Pwr {
    regs: HashMap<u32, u32>,
}

impl Default for Pwr {
    fn default() -> Self {
        Self::new()
    }
}

impl Pwr {
    pub fn new() -> Pwr {
        let mut regs = HashMap::new();
        regs.insert(0x00, 0x0000_F000); // CR1: VOS scale 3
        regs.insert(0x04, 0x0000_4000); // CSR1: ACTVOSRDY
        regs.insert(0x0C, 0x0000_0006); // CR3: LDOEN | SCUEN
        regs.insert(0x18, 0x0000_4000); // SRDCR: VOSRDY
        Pwr { regs }
    }
}

impl BusPort for Pwr {
    fn read32(&mut self, addr: u32) -> u32 {
        let off = addr - PWR_BASE;
        let value = self.regs.get(&off).copied().unwrap_or(0);
        match off {
            // CSR1/SRDCR keep their ready bits regardless of what firmware
            // wrote.
            0x04 => value | 0x0000_4000,
            0x18 => value | 0x0000_4000,
            _ => value,
        }
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.regs.insert(addr - PWR_BASE, value);
    }
}

/// Embedded flash interface: latency reads back, status is never busy.
pub struct FlashIf {
    regs: HashMap<u32, u32>,
}

impl Default for FlashIf {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashIf {
    pub fn new() -> FlashIf {
        let mut regs = HashMap::new();
        regs.insert(0x00, 0x0000_0037); // ACR: reset latency
        regs.insert(0x0C, 0x0000_0031); // CR1: LOCK
        regs.insert(0x10C, 0x0000_0031); // CR2: LOCK
        FlashIf { regs }
    }
}

impl BusPort for FlashIf {
    fn read32(&mut self, addr: u32) -> u32 {
        let off = addr - FLASH_IF_BASE;
        match off {
            // SR1/SR2: no errors, not busy.
            0x10 | 0x110 => 0,
            _ => self.regs.get(&off).copied().unwrap_or(0),
        }
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.regs.insert(addr - FLASH_IF_BASE, value);
    }
}

/// Shared button state: pin levels per GPIO port (buttons are active-low
/// with pull-ups, so idle pins read high).
#[derive(Debug)]
pub struct PinState {
    levels: [u16; 5], // ports A..E
}

impl Default for PinState {
    fn default() -> Self {
        PinState {
            levels: [0xFFFF; 5],
        }
    }
}

impl PinState {
    pub fn set_pin(&mut self, port: usize, pin: u8, high: bool) {
        if high {
            self.levels[port] |= 1 << pin;
        } else {
            self.levels[port] &= !(1 << pin);
        }
    }

    pub fn port_levels(&self, port: usize) -> u16 {
        self.levels[port]
    }
}

pub type SharedPins = Rc<RefCell<PinState>>;

const GPIO_MODER: u32 = 0x00;
const GPIO_IDR: u32 = 0x10;
const GPIO_ODR: u32 = 0x14;
const GPIO_BSRR: u32 = 0x18;

/// One GPIO port. Input pins sample the shared pin state; output pins read
/// their ODR back through IDR.
pub struct GpioPort {
    index: usize,
    base: u32,
    regs: HashMap<u32, u32>,
    pins: SharedPins,
}

impl GpioPort {
    pub fn new(index: usize, pins: SharedPins) -> GpioPort {
        GpioPort {
            index,
            base: GPIOA_BASE + index as u32 * GPIO_PORT_SIZE,
            regs: HashMap::new(),
            pins,
        }
    }

    fn idr(&self) -> u32 {
        let moder = self.regs.get(&GPIO_MODER).copied().unwrap_or(0);
        let odr = self.regs.get(&GPIO_ODR).copied().unwrap_or(0);
        let external = self.pins.borrow().port_levels(self.index) as u32;
        let mut idr = 0;
        for pin in 0..16 {
            let mode = (moder >> (pin * 2)) & 0x3;
            let level = match mode {
                0b01 => odr >> pin, // output reads back ODR
                _ => external >> pin,
            };
            idr |= (level & 1) << pin;
        }
        idr
    }
}

impl BusPort for GpioPort {
    fn read32(&mut self, addr: u32) -> u32 {
        let off = addr - self.base;
        match off {
            GPIO_IDR => self.idr(),
            GPIO_BSRR => 0, // write-only
            _ => self.regs.get(&off).copied().unwrap_or(0),
        }
    }

    fn write32(&mut self, addr: u32, value: u32) {
        let off = addr - self.base;
        match off {
            GPIO_IDR => {}
            GPIO_BSRR => {
                let odr = self.regs.entry(GPIO_ODR).or_insert(0);
                *odr |= value & 0xFFFF;
                *odr &= !(value >> 16);
            }
            _ => {
                self.regs.insert(off, value);
            }
        }
    }
}

/// The console's button matrix (active-low).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Up,
    Down,
    Right,
    A,
    B,
    Game,
    Time,
    PauseSet,
    Power,
}

impl Button {
    /// (GPIO port index, pin) per the board wiring.
    pub fn wiring(self) -> (usize, u8) {
        match self {
            Button::Left => (3, 11),
            Button::Up => (3, 0),
            Button::Down => (3, 14),
            Button::Right => (3, 15),
            Button::A => (3, 9),
            Button::B => (3, 5),
            Button::Game => (2, 1),
            Button::Time => (2, 4),
            Button::PauseSet => (2, 13),
            Button::Power => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcc_grants_ready_bits() {
        let mut rcc = Rcc::new();
        assert_eq!(rcc.read32(RCC_BASE) & 0x5, 0x5);
        // Turn PLL1 on: ready follows immediately.
        rcc.write32(RCC_BASE, 0x0100_0001);
        let cr = rcc.read32(RCC_BASE);
        assert_ne!(cr & (1 << 25), 0);
        // Select PLL1 as sysclk (SW=3): SWS mirrors it.
        rcc.write32(RCC_BASE + RCC_CFGR, 0x3);
        assert_eq!(rcc.read32(RCC_BASE + RCC_CFGR) & 0x3F, 0x1B);
    }

    #[test]
    fn pwr_is_always_ready() {
        let mut pwr = Pwr::new();
        assert_ne!(pwr.read32(PWR_BASE + 0x04) & 0x4000, 0);
        pwr.write32(PWR_BASE + 0x18, 0);
        assert_ne!(pwr.read32(PWR_BASE + 0x18) & 0x4000, 0);
    }

    #[test]
    fn flash_if_is_never_busy() {
        let mut flash = FlashIf::new();
        assert_eq!(flash.read32(FLASH_IF_BASE + 0x10), 0);
        assert_eq!(flash.read32(FLASH_IF_BASE) & 0xF, 0x7);
        flash.write32(FLASH_IF_BASE, 0x12);
        assert_eq!(flash.read32(FLASH_IF_BASE), 0x12);
    }

    #[test]
    fn gpio_inputs_follow_shared_pins() {
        let pins: SharedPins = Rc::new(RefCell::new(PinState::default()));
        let mut port_d = GpioPort::new(3, pins.clone());
        let idr_addr = port_d.base + GPIO_IDR;
        // Idle: all pins high (pull-up).
        assert_eq!(port_d.read32(idr_addr) & 0xFFFF, 0xFFFF);
        // Press A (PD9, active low).
        let (port, pin) = Button::A.wiring();
        pins.borrow_mut().set_pin(port, pin, false);
        assert_eq!(port_d.read32(idr_addr) & (1 << 9), 0);
    }

    #[test]
    fn gpio_bsrr_sets_and_clears_outputs() {
        let pins: SharedPins = Rc::new(RefCell::new(PinState::default()));
        let mut port = GpioPort::new(0, pins);
        // Pin 3 as output.
        port.write32(port.base + GPIO_MODER, 0b01 << 6);
        port.write32(port.base + GPIO_BSRR, 1 << 3);
        assert_ne!(port.read32(port.base + GPIO_ODR) & (1 << 3), 0);
        assert_ne!(port.read32(port.base + GPIO_IDR) & (1 << 3), 0);
        port.write32(port.base + GPIO_BSRR, 1 << (16 + 3));
        assert_eq!(port.read32(port.base + GPIO_ODR) & (1 << 3), 0);
    }
}
