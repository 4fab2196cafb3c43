//! Cortex-M exception and NVIC model.
//!
//! Exceptions 1..=15 are system exceptions, 16.. are external interrupts
//! (IRQ0 maps to exception 16). Priorities are signed; smaller numbers
//! preempt. Reset/NMI/HardFault have fixed negative priorities and can
//! never be disabled.
//!
//! The entry/return sequences run against [`InterruptContext`], a narrow
//! capability view of the CPU (registers, banked stack pointers, xPSR,
//! word-sized memory access, exclusive-monitor clear), so this crate never
//! depends on the CPU type.

pub mod exception {
    pub const RESET: u16 = 1;
    pub const NMI: u16 = 2;
    pub const HARD_FAULT: u16 = 3;
    pub const MEM_MANAGE: u16 = 4;
    pub const BUS_FAULT: u16 = 5;
    pub const USAGE_FAULT: u16 = 6;
    pub const SVCALL: u16 = 11;
    pub const DEBUG_MONITOR: u16 = 12;
    pub const PENDSV: u16 = 14;
    pub const SYSTICK: u16 = 15;

    /// External interrupt line -> exception number.
    pub fn from_irq(irq: u16) -> u16 {
        irq + 16
    }
}

/// STM32H7B0-class external interrupt count.
pub const MAX_IRQS: u16 = 150;
pub const MAX_EXCEPTIONS: u16 = 16 + MAX_IRQS;

/// EXC_RETURN values written into LR on exception entry.
pub const EXC_RETURN_HANDLER_MSP: u32 = 0xFFFF_FFF1;
pub const EXC_RETURN_THREAD_MSP: u32 = 0xFFFF_FFF9;
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Priority used when nothing is active: lower than any configurable value.
const PRIORITY_NONE: i16 = 256;

/// The CONTROL.SPSEL bit as seen through [`InterruptContext::control`].
const CONTROL_SPSEL: u32 = 0x2;

/// Capability view of the CPU needed by entry/return. Frame pushes and pops
/// are infallible at this seam; the implementation maps bus faults to
/// zero reads and dropped writes.
pub trait InterruptContext {
    fn reg(&self, index: usize) -> u32;
    fn set_reg(&mut self, index: usize, value: u32);
    fn xpsr(&self) -> u32;
    fn set_xpsr(&mut self, value: u32);
    fn ipsr(&self) -> u16;
    fn set_ipsr(&mut self, value: u16);
    fn msp(&self) -> u32;
    fn set_msp(&mut self, value: u32);
    fn psp(&self) -> u32;
    fn set_psp(&mut self, value: u32);
    fn control(&self) -> u32;
    fn lr(&self) -> u32;
    fn set_lr(&mut self, value: u32);
    /// Current PC (already advanced past the faulting/interrupted point).
    fn pc(&self) -> u32;
    /// Branch without EXC_RETURN interception; bit 0 selects Thumb state.
    fn branch(&mut self, target: u32);
    fn read_word(&mut self, addr: u32) -> u32;
    fn write_word(&mut self, addr: u32, value: u32);
    /// The exclusive monitor is cleared by any exception entry or return.
    fn clear_exclusive(&mut self);
}

/// PRIMASK/FAULTMASK/BASEPRI snapshot for priority decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityMasks {
    pub primask: bool,
    pub faultmask: bool,
    pub basepri: u8,
}

/// One exception's state.
#[derive(Debug, Clone)]
pub struct ExceptionState {
    pub enabled: bool,
    pub pending: bool,
    pub active: bool,
    pub priority: i16,
}

fn fixed_priority(number: u16) -> Option<i16> {
    match number {
        exception::RESET => Some(-3),
        exception::NMI => Some(-2),
        exception::HARD_FAULT => Some(-1),
        _ => None,
    }
}

impl ExceptionState {
    fn new(number: u16) -> ExceptionState {
        match fixed_priority(number) {
            Some(priority) => ExceptionState {
                enabled: true,
                pending: false,
                active: false,
                priority,
            },
            None => ExceptionState {
                // System exceptions other than the SHCSR-gated faults are
                // always eligible; external interrupts start disabled.
                enabled: (1..=15).contains(&number)
                    && !matches!(
                        number,
                        exception::MEM_MANAGE | exception::BUS_FAULT | exception::USAGE_FAULT
                    ),
                pending: false,
                active: false,
                priority: 0,
            },
        }
    }
}

/// The NVIC plus the system-control-block registers it serves.
pub struct ExceptionManager {
    states: Vec<ExceptionState>,
    /// LIFO of active exception numbers; the top is what IPSR restores to.
    active_stack: Vec<u16>,
    pub vtor: u32,
    pub scr: u32,
    pub ccr: u32,
    pub shcsr: u32,
    pub cfsr: u32,
    pub hfsr: u32,
    pub prigroup: u8,
}

// SCB register addresses.
const SCB_CPUID: u32 = 0xE000_ED00;
const SCB_ICSR: u32 = 0xE000_ED04;
const SCB_VTOR: u32 = 0xE000_ED08;
const SCB_AIRCR: u32 = 0xE000_ED0C;
const SCB_SCR: u32 = 0xE000_ED10;
const SCB_CCR: u32 = 0xE000_ED14;
const SCB_SHPR1: u32 = 0xE000_ED18;
const SCB_SHPR2: u32 = 0xE000_ED1C;
const SCB_SHPR3: u32 = 0xE000_ED20;
const SCB_SHCSR: u32 = 0xE000_ED24;
const SCB_CFSR: u32 = 0xE000_ED28;
const SCB_HFSR: u32 = 0xE000_ED2C;

// NVIC register banks; five 32-bit words cover the 150 IRQ lines.
const NVIC_ISER: u32 = 0xE000_E100;
const NVIC_ICER: u32 = 0xE000_E180;
const NVIC_ISPR: u32 = 0xE000_E200;
const NVIC_ICPR: u32 = 0xE000_E280;
const NVIC_IABR: u32 = 0xE000_E300;
const NVIC_IPR: u32 = 0xE000_E400;

const CPUID_CORTEX_M7_R1P1: u32 = 0x411F_C271;
const AIRCR_VECTKEY: u32 = 0x05FA;

/// CCR.STKALIGN, set out of reset: exception frames are 8-byte aligned.
const CCR_STKALIGN: u32 = 0x200;

impl Default for ExceptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionManager {
    pub fn new() -> ExceptionManager {
        let states = (0..MAX_EXCEPTIONS)
            .map(|n| ExceptionState::new(n))
            .collect();
        ExceptionManager {
            states,
            active_stack: Vec::new(),
            vtor: 0,
            scr: 0,
            ccr: CCR_STKALIGN,
            shcsr: 0,
            cfsr: 0,
            hfsr: 0,
            prigroup: 0,
        }
    }

    pub fn reset(&mut self) {
        for (n, state) in self.states.iter_mut().enumerate() {
            *state = ExceptionState::new(n as u16);
        }
        self.active_stack.clear();
        self.vtor = 0;
        self.scr = 0;
        self.ccr = CCR_STKALIGN;
        self.shcsr = 0;
        self.cfsr = 0;
        self.hfsr = 0;
        self.prigroup = 0;
    }

    fn state(&self, number: u16) -> Option<&ExceptionState> {
        self.states.get(number as usize).filter(|_| number >= 1)
    }

    fn state_mut(&mut self, number: u16) -> Option<&mut ExceptionState> {
        if number < 1 {
            return None;
        }
        self.states.get_mut(number as usize)
    }

    pub fn set_pending(&mut self, number: u16) {
        if let Some(state) = self.state_mut(number) {
            state.pending = true;
        }
    }

    pub fn clear_pending(&mut self, number: u16) {
        if let Some(state) = self.state_mut(number) {
            state.pending = false;
        }
    }

    pub fn is_pending(&self, number: u16) -> bool {
        self.state(number).map_or(false, |s| s.pending)
    }

    pub fn is_active(&self, number: u16) -> bool {
        self.state(number).map_or(false, |s| s.active)
    }

    pub fn set_enabled(&mut self, number: u16, enabled: bool) {
        if fixed_priority(number).is_some() {
            return;
        }
        if let Some(state) = self.state_mut(number) {
            state.enabled = enabled;
        }
    }

    pub fn is_enabled(&self, number: u16) -> bool {
        self.state(number).map_or(false, |s| s.enabled)
    }

    /// Only the top four bits of an 8-bit priority are significant on this
    /// part; fixed-priority exceptions ignore writes.
    pub fn set_priority(&mut self, number: u16, priority: u8) {
        if fixed_priority(number).is_some() {
            return;
        }
        if let Some(state) = self.state_mut(number) {
            state.priority = (priority & 0xF0) as i16;
        }
    }

    pub fn priority(&self, number: u16) -> i16 {
        self.state(number).map_or(PRIORITY_NONE, |s| s.priority)
    }

    /// Current execution priority: the minimum over active exceptions,
    /// further clamped by PRIMASK (0), FAULTMASK (-1) and BASEPRI.
    pub fn execution_priority(&self, masks: &PriorityMasks) -> i16 {
        let mut current = PRIORITY_NONE;
        for state in &self.states {
            if state.active && state.priority < current {
                current = state.priority;
            }
        }
        if masks.primask && current > 0 {
            current = 0;
        }
        if masks.faultmask && current > -1 {
            current = -1;
        }
        if masks.basepri != 0 && current > masks.basepri as i16 {
            current = masks.basepri as i16;
        }
        current
    }

    /// Highest-priority pending+enabled exception that would preempt the
    /// current execution priority, if any.
    pub fn pending_exception(&self, masks: &PriorityMasks) -> Option<u16> {
        let mut best = None;
        let mut best_priority = self.execution_priority(masks);
        for (n, state) in self.states.iter().enumerate().skip(1) {
            if state.pending && state.enabled && state.priority < best_priority {
                best_priority = state.priority;
                best = Some(n as u16);
            }
        }
        best
    }

    /// WFI wake-up test: like [`pending_exception`] but with PRIMASK and
    /// FAULTMASK ignored (the ARM rule; BASEPRI and active priorities still
    /// gate the wake-up).
    pub fn wakeup_pending(&self, masks: &PriorityMasks) -> bool {
        let unmasked = PriorityMasks {
            primask: false,
            faultmask: false,
            basepri: masks.basepri,
        };
        self.pending_exception(&unmasked).is_some()
    }

    /// Number the ICSR VECTACTIVE field reports (top of the active stack).
    pub fn current_exception(&self) -> u16 {
        self.active_stack.last().copied().unwrap_or(0)
    }

    // ---------------------------------------------------------------
    // Entry / return
    // ---------------------------------------------------------------

    /// Exception entry: stack the eight-word frame, bank the SP, set
    /// EXC_RETURN in LR, mark the exception active and branch to its vector.
    pub fn enter(&mut self, ctx: &mut dyn InterruptContext, number: u16) {
        ctx.clear_exclusive();

        // Thread mode with CONTROL.SPSEL uses PSP for the frame.
        let use_psp = ctx.ipsr() == 0 && ctx.control() & CONTROL_SPSEL != 0;
        let mut frame_sp = if use_psp { ctx.psp() } else { ctx.msp() };

        // STKALIGN: force 8-byte alignment, remembering it in bit 9 of the
        // stacked xPSR.
        let realign = self.ccr & CCR_STKALIGN != 0 && frame_sp & 0x4 != 0;
        if realign {
            frame_sp -= 4;
        }
        frame_sp = frame_sp.wrapping_sub(32);

        let mut xpsr = ctx.xpsr();
        if realign {
            xpsr |= 1 << 9;
        }

        let frame = [
            ctx.reg(0),
            ctx.reg(1),
            ctx.reg(2),
            ctx.reg(3),
            ctx.reg(12),
            ctx.lr(),
            ctx.pc(),
            xpsr,
        ];
        for (i, &word) in frame.iter().enumerate() {
            ctx.write_word(frame_sp + 4 * i as u32, word);
        }

        if use_psp {
            ctx.set_psp(frame_sp);
        } else {
            ctx.set_msp(frame_sp);
        }

        let exc_return = if ctx.ipsr() != 0 {
            EXC_RETURN_HANDLER_MSP
        } else if use_psp {
            EXC_RETURN_THREAD_PSP
        } else {
            EXC_RETURN_THREAD_MSP
        };
        ctx.set_lr(exc_return);

        if let Some(state) = self.state_mut(number) {
            state.pending = false;
            state.active = true;
        }
        self.active_stack.push(number);
        ctx.set_ipsr(number);

        let handler = ctx.read_word(self.vtor + 4 * number as u32);
        ctx.branch(handler);
    }

    /// Exception return, triggered by an EXC_RETURN value reaching the PC:
    /// unstack the frame, restore xPSR/IPSR from the active stack, branch.
    pub fn exc_return(&mut self, ctx: &mut dyn InterruptContext, exc_return: u32) {
        ctx.clear_exclusive();

        let use_psp = exc_return & 0x4 != 0;
        let frame_sp = if use_psp { ctx.psp() } else { ctx.msp() };

        let r0 = ctx.read_word(frame_sp);
        let r1 = ctx.read_word(frame_sp + 4);
        let r2 = ctx.read_word(frame_sp + 8);
        let r3 = ctx.read_word(frame_sp + 12);
        let r12 = ctx.read_word(frame_sp + 16);
        let lr = ctx.read_word(frame_sp + 20);
        let return_addr = ctx.read_word(frame_sp + 24);
        let xpsr = ctx.read_word(frame_sp + 28);

        ctx.set_reg(0, r0);
        ctx.set_reg(1, r1);
        ctx.set_reg(2, r2);
        ctx.set_reg(3, r3);
        ctx.set_reg(12, r12);
        ctx.set_lr(lr);

        let mut new_sp = frame_sp.wrapping_add(32);
        if xpsr & (1 << 9) != 0 {
            new_sp += 4;
        }
        if use_psp {
            ctx.set_psp(new_sp);
        } else {
            ctx.set_msp(new_sp);
        }

        if let Some(number) = self.active_stack.pop() {
            if let Some(state) = self.state_mut(number) {
                state.active = false;
            }
        }

        ctx.set_xpsr(xpsr & !(1 << 9));
        ctx.set_ipsr(self.current_exception());
        ctx.branch(return_addr);
    }

    /// Any PC value with the top 24 bits set is an EXC_RETURN.
    pub fn is_exc_return(value: u32) -> bool {
        value & 0xFFFF_FF00 == 0xFFFF_FF00
    }

    // ---------------------------------------------------------------
    // Memory-mapped registers
    // ---------------------------------------------------------------

    /// True when this address belongs to the NVIC/SCB register file.
    pub fn handles(addr: u32) -> bool {
        (0xE000_E100..=0xE000_E4FF).contains(&addr) || (0xE000_ED00..=0xE000_ED3F).contains(&addr)
    }

    pub fn mmio_read(&self, addr: u32) -> u32 {
        match addr {
            NVIC_ISER..=0xE000_E113 | NVIC_ICER..=0xE000_E193 => {
                self.read_irq_bits(bank_index(addr), |s| s.enabled)
            }
            NVIC_ISPR..=0xE000_E213 | NVIC_ICPR..=0xE000_E293 => {
                self.read_irq_bits(bank_index(addr), |s| s.pending)
            }
            NVIC_IABR..=0xE000_E313 => self.read_irq_bits(bank_index(addr), |s| s.active),
            NVIC_IPR..=0xE000_E4EF => {
                let irq_base = (addr - NVIC_IPR) & !3;
                let mut value = 0;
                for i in 0..4 {
                    let number = exception::from_irq(irq_base as u16 + i as u16);
                    let priority = self.priority(number) as u32 & 0xF0;
                    value |= priority << (i * 8);
                }
                value
            }
            SCB_CPUID => CPUID_CORTEX_M7_R1P1,
            SCB_ICSR => self.read_icsr(),
            SCB_VTOR => self.vtor,
            SCB_AIRCR => (AIRCR_VECTKEY ^ 0xFFFF) << 16 | (self.prigroup as u32) << 8,
            SCB_SCR => self.scr,
            SCB_CCR => self.ccr,
            SCB_SHPR1 => self.read_shpr(4),
            SCB_SHPR2 => self.read_shpr(8),
            SCB_SHPR3 => self.read_shpr(12),
            SCB_SHCSR => self.shcsr,
            SCB_CFSR => self.cfsr,
            SCB_HFSR => self.hfsr,
            _ => 0,
        }
    }

    pub fn mmio_write(&mut self, addr: u32, value: u32) {
        match addr {
            NVIC_ISER..=0xE000_E113 => self.write_irq_bits(bank_index(addr), value, |s| {
                s.enabled = true;
            }),
            NVIC_ICER..=0xE000_E193 => self.write_irq_bits(bank_index(addr), value, |s| {
                s.enabled = false;
            }),
            NVIC_ISPR..=0xE000_E213 => self.write_irq_bits(bank_index(addr), value, |s| {
                s.pending = true;
            }),
            NVIC_ICPR..=0xE000_E293 => self.write_irq_bits(bank_index(addr), value, |s| {
                s.pending = false;
            }),
            NVIC_IPR..=0xE000_E4EF => {
                let irq_base = (addr - NVIC_IPR) & !3;
                for i in 0..4 {
                    let number = exception::from_irq(irq_base as u16 + i as u16);
                    self.set_priority(number, (value >> (i * 8)) as u8);
                }
            }
            SCB_ICSR => self.write_icsr(value),
            SCB_VTOR => self.vtor = value & 0xFFFF_FF80,
            SCB_AIRCR => {
                if value >> 16 == AIRCR_VECTKEY {
                    self.prigroup = ((value >> 8) & 0x7) as u8;
                }
            }
            SCB_SCR => self.scr = value & 0x1E,
            SCB_CCR => self.ccr = value,
            SCB_SHPR1 => self.write_shpr(4, value),
            SCB_SHPR2 => self.write_shpr(8, value),
            SCB_SHPR3 => self.write_shpr(12, value),
            SCB_SHCSR => {
                self.shcsr = value;
                self.set_enabled(exception::MEM_MANAGE, value & (1 << 16) != 0);
                self.set_enabled(exception::BUS_FAULT, value & (1 << 17) != 0);
                self.set_enabled(exception::USAGE_FAULT, value & (1 << 18) != 0);
            }
            SCB_CFSR => self.cfsr &= !value,
            SCB_HFSR => self.hfsr &= !value,
            _ => {}
        }
    }

    fn read_irq_bits(&self, bank: u32, f: impl Fn(&ExceptionState) -> bool) -> u32 {
        let mut value = 0;
        for bit in 0..32u32 {
            let number = exception::from_irq((bank * 32 + bit) as u16);
            if self.state(number).map_or(false, &f) {
                value |= 1 << bit;
            }
        }
        value
    }

    fn write_irq_bits(&mut self, bank: u32, value: u32, f: impl Fn(&mut ExceptionState)) {
        for bit in 0..32u32 {
            if value & (1 << bit) != 0 {
                let number = exception::from_irq((bank * 32 + bit) as u16);
                if fixed_priority(number).is_some() {
                    continue;
                }
                if let Some(state) = self.state_mut(number) {
                    f(state);
                }
            }
        }
    }

    fn read_icsr(&self) -> u32 {
        let mut value = self.current_exception() as u32 & 0x1FF;
        // VECTPENDING: highest-priority pending+enabled, ignoring masking.
        let mut best = 0u16;
        let mut best_priority = PRIORITY_NONE;
        for (n, state) in self.states.iter().enumerate().skip(1) {
            if state.pending && state.enabled && state.priority < best_priority {
                best_priority = state.priority;
                best = n as u16;
            }
        }
        value |= (best as u32 & 0x1FF) << 12;
        if best != 0 {
            value |= 1 << 22; // ISRPENDING
        }
        value
    }

    fn write_icsr(&mut self, value: u32) {
        if value & (1 << 26) != 0 {
            self.set_pending(exception::SYSTICK);
        }
        if value & (1 << 25) != 0 {
            self.clear_pending(exception::SYSTICK);
        }
        if value & (1 << 28) != 0 {
            self.set_pending(exception::PENDSV);
        }
        if value & (1 << 27) != 0 {
            self.clear_pending(exception::PENDSV);
        }
        if value & (1 << 31) != 0 {
            self.set_pending(exception::NMI);
        }
    }

    fn read_shpr(&self, base: u16) -> u32 {
        let mut value = 0;
        for i in 0..4u32 {
            value |= (self.priority(base + i as u16) as u32 & 0xFF) << (i * 8);
        }
        value
    }

    fn write_shpr(&mut self, base: u16, value: u32) {
        for i in 0..4u32 {
            self.set_priority(base + i as u16, (value >> (i * 8)) as u8);
        }
    }
}

fn bank_index(addr: u32) -> u32 {
    (addr & 0xFF) / 4 % 32
}
