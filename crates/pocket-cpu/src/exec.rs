//! The instruction executor.
//!
//! One `step`: check pending exceptions, fetch, decode, apply the IT-block
//! condition override, advance the PC by the instruction size (so R15 reads
//! observe address + size), test the condition, dispatch, advance ITSTATE.
//! Every PC write funnels through `write_pc_branch`, which diverts
//! EXC_RETURN values into the exception-return sequence.

use pocket_interrupts::{exception, ExceptionManager, InterruptContext};
use pocket_thumb::alu::{
    add_with_carry, apply_shift, bit_field_clear, bit_field_extract_signed,
    bit_field_extract_unsigned, bit_field_insert, extend_byte_signed, extend_byte_unsigned,
    extend_halfword_signed, extend_halfword_unsigned, reverse_bytes_16, reverse_bytes_signed_16,
    sdiv, shift_asr, shift_lsl, shift_lsr, shift_ror, sign_extend, signed_saturate, smull,
    thumb_expand_imm, udiv, umull, unsigned_saturate,
};
use pocket_thumb::{decode, is_thumb32, Cond, Instruction, Op, Operand2, Operands};
use pocket_thumb::inst::MemOff;

use crate::bus::{BusFault, CpuBus};
use crate::ppb::{self, PpbShims, SysTick};
use crate::state::CpuState;

/// Why a `step` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// Instruction retired (or its condition failed).
    Continue,
    /// The core is halted in WFI; one cycle was accounted.
    Halted,
    /// BKPT executed: a debug stop, not a fault.
    Bkpt(u8),
}

/// The Cortex-M7 core: architectural state plus the core-private
/// peripherals (NVIC/SCB, SysTick, FPU/MPU shims).
pub struct Cpu {
    pub state: CpuState,
    pub exc: ExceptionManager,
    pub systick: SysTick,
    shims: PpbShims,
    pub cycles: u64,
    last_pc: u32,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            state: CpuState::new(),
            exc: ExceptionManager::new(),
            systick: SysTick::new(),
            shims: PpbShims::new(),
            cycles: 0,
            last_pc: 0,
        }
    }

    /// Architectural reset: load the initial MSP and reset vector through
    /// the bus (the flash boot alias must be live).
    pub fn reset(&mut self, bus: &mut impl CpuBus) -> Result<(), BusFault> {
        self.exc.reset();
        self.systick.reset();
        self.shims.reset();
        self.cycles = 0;
        self.last_pc = 0;
        let initial_sp = self.read_mem_u32(bus, 0x0000_0000)?;
        let reset_vector = self.read_mem_u32(bus, 0x0000_0004)?;
        self.state.reset(initial_sp, reset_vector);
        Ok(())
    }

    /// Address of the most recently fetched instruction.
    pub fn last_pc(&self) -> u32 {
        self.last_pc
    }

    // ---------------------------------------------------------------
    // Memory access with PPB interception
    // ---------------------------------------------------------------

    fn ppb_read32(&mut self, addr: u32) -> u32 {
        if SysTick::handles(addr) {
            self.systick.mmio_read(addr)
        } else if ExceptionManager::handles(addr) {
            self.exc.mmio_read(addr)
        } else {
            self.shims.read(addr)
        }
    }

    fn ppb_write32(&mut self, addr: u32, value: u32) {
        if SysTick::handles(addr) {
            self.systick.mmio_write(addr, value);
        } else if ExceptionManager::handles(addr) {
            self.exc.mmio_write(addr, value);
        } else {
            self.shims.write(addr, value);
        }
    }

    pub fn read_mem_u8(&mut self, bus: &mut impl CpuBus, addr: u32) -> Result<u8, BusFault> {
        if ppb::contains(addr) {
            let word = self.ppb_read32(addr & !3);
            return Ok((word >> ((addr & 3) * 8)) as u8);
        }
        bus.read_u8(addr)
    }

    pub fn read_mem_u16(&mut self, bus: &mut impl CpuBus, addr: u32) -> Result<u16, BusFault> {
        let addr = addr & !1;
        if ppb::contains(addr) {
            let word = self.ppb_read32(addr & !3);
            return Ok((word >> ((addr & 2) * 8)) as u16);
        }
        bus.read_u16(addr)
    }

    pub fn read_mem_u32(&mut self, bus: &mut impl CpuBus, addr: u32) -> Result<u32, BusFault> {
        let addr = addr & !3;
        if ppb::contains(addr) {
            return Ok(self.ppb_read32(addr));
        }
        bus.read_u32(addr)
    }

    pub fn write_mem_u8(
        &mut self,
        bus: &mut impl CpuBus,
        addr: u32,
        value: u8,
    ) -> Result<(), BusFault> {
        if ppb::contains(addr) {
            // Byte lanes on 32-bit-only registers: read-modify-write the
            // enclosing word (the NVIC IPR bytes rely on this).
            let aligned = addr & !3;
            let shift = (addr & 3) * 8;
            let word = self.ppb_read32(aligned);
            let word = (word & !(0xFF << shift)) | ((value as u32) << shift);
            self.ppb_write32(aligned, word);
            return Ok(());
        }
        bus.write_u8(addr, value)
    }

    pub fn write_mem_u16(
        &mut self,
        bus: &mut impl CpuBus,
        addr: u32,
        value: u16,
    ) -> Result<(), BusFault> {
        let addr = addr & !1;
        if ppb::contains(addr) {
            let aligned = addr & !3;
            let shift = (addr & 2) * 8;
            let word = self.ppb_read32(aligned);
            let word = (word & !(0xFFFF << shift)) | ((value as u32) << shift);
            self.ppb_write32(aligned, word);
            return Ok(());
        }
        bus.write_u16(addr, value)
    }

    pub fn write_mem_u32(
        &mut self,
        bus: &mut impl CpuBus,
        addr: u32,
        value: u32,
    ) -> Result<(), BusFault> {
        let addr = addr & !3;
        if ppb::contains(addr) {
            self.ppb_write32(addr, value);
            return Ok(());
        }
        bus.write_u32(addr, value)
    }

    // ---------------------------------------------------------------
    // Exceptions
    // ---------------------------------------------------------------

    fn enter_exception(&mut self, bus: &mut impl CpuBus, number: u16) {
        let mut ctx = CpuContext {
            state: &mut self.state,
            bus,
        };
        self.exc.enter(&mut ctx, number);
    }

    fn exception_return(&mut self, bus: &mut impl CpuBus, exc_return: u32) {
        let mut ctx = CpuContext {
            state: &mut self.state,
            bus,
        };
        self.exc.exc_return(&mut ctx, exc_return);
    }

    /// All PC writes from register values come through here so EXC_RETURN
    /// magic values divert into the return sequence.
    fn write_pc_branch(&mut self, bus: &mut impl CpuBus, value: u32) {
        if ExceptionManager::is_exc_return(value) {
            self.exception_return(bus, value);
        } else {
            self.state.branch(value);
        }
    }

    // ---------------------------------------------------------------
    // IT block
    // ---------------------------------------------------------------

    fn in_it_block(&self) -> bool {
        self.state.it_state & 0xF != 0
    }

    fn it_condition(&self) -> Cond {
        Cond::from_bits((self.state.it_state >> 4) as u32)
    }

    /// ITSTATE[4:0] shifts left each slot; the block ends when the mask
    /// reaches its terminal bit.
    fn advance_it_state(&mut self) {
        let state = self.state.it_state;
        if state & 0xF == 0b1000 {
            self.state.it_state = 0;
        } else {
            self.state.it_state = (state & 0xE0) | ((state << 1) & 0x1F);
        }
    }

    fn condition_passed(&self, cond: Cond) -> bool {
        let s = &self.state;
        match cond {
            Cond::Eq => s.z(),
            Cond::Ne => !s.z(),
            Cond::Cs => s.c(),
            Cond::Cc => !s.c(),
            Cond::Mi => s.n(),
            Cond::Pl => !s.n(),
            Cond::Vs => s.v(),
            Cond::Vc => !s.v(),
            Cond::Hi => s.c() && !s.z(),
            Cond::Ls => !s.c() || s.z(),
            Cond::Ge => s.n() == s.v(),
            Cond::Lt => s.n() != s.v(),
            Cond::Gt => !s.z() && s.n() == s.v(),
            Cond::Le => s.z() || s.n() != s.v(),
            Cond::Al | Cond::None => true,
        }
    }

    // ---------------------------------------------------------------
    // Step
    // ---------------------------------------------------------------

    /// Execute one instruction (or account one halted cycle). Pending
    /// exceptions are checked once, before fetch.
    pub fn step(&mut self, bus: &mut impl CpuBus) -> Result<StepExit, BusFault> {
        if !self.state.halted {
            if let Some(number) = self.exc.pending_exception(&self.state.masks()) {
                self.enter_exception(bus, number);
            }
        } else {
            // WFI wake-up ignores PRIMASK/FAULTMASK; entry still requires
            // the full masked check, otherwise the interrupt stays pending.
            if self.exc.wakeup_pending(&self.state.masks()) {
                self.state.halted = false;
                if let Some(number) = self.exc.pending_exception(&self.state.masks()) {
                    self.enter_exception(bus, number);
                }
            } else {
                self.cycles += 1;
                if self.systick.tick(1) {
                    self.exc.set_pending(exception::SYSTICK);
                }
                return Ok(StepExit::Halted);
            }
        }

        let pc = self.state.pc();
        self.last_pc = pc;

        let hw1 = self.read_mem_u16(bus, pc)?;
        let hw2 = if is_thumb32(hw1) {
            self.read_mem_u16(bus, pc.wrapping_add(2))?
        } else {
            0
        };
        let mut inst = decode(hw1, hw2, pc);

        if self.in_it_block() && inst.op != Op::It {
            inst.cond = self.it_condition();
            // 16-bit data-processing encodings only set flags outside an IT
            // block; compare/test ops (no Rd) always do.
            if inst.size == 2 {
                match &mut inst.operands {
                    Operands::Dp {
                        rd: Some(_),
                        setflags,
                        ..
                    } => *setflags = false,
                    Operands::Mul { setflags, .. } => *setflags = false,
                    _ => {}
                }
            }
        }

        // Advance before execution: R15 reads observe address + size.
        self.state.set_pc_sequential(pc.wrapping_add(inst.size as u32));

        let (cycles, exit) = if self.condition_passed(inst.cond) {
            self.execute(bus, &inst)?
        } else {
            (1, StepExit::Continue)
        };

        if self.in_it_block() && inst.op != Op::It {
            self.advance_it_state();
        }

        self.cycles += cycles as u64;
        if self.systick.tick(cycles) {
            self.exc.set_pending(exception::SYSTICK);
        }
        Ok(exit)
    }

    // ---------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------

    fn execute(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<(u32, StepExit), BusFault> {
        let cont = |cycles| Ok((cycles, StepExit::Continue));
        match inst.op {
            Op::Mov | Op::Mvn | Op::Add | Op::Adc | Op::Sub | Op::Sbc | Op::Rsb | Op::And
            | Op::Orr | Op::Eor | Op::Orn | Op::Bic | Op::Tst | Op::Teq | Op::Cmp | Op::Cmn
            | Op::Lsl | Op::Lsr | Op::Asr | Op::Ror => {
                self.exec_dp(bus, inst)?;
                cont(1)
            }
            Op::Movw | Op::Movt => {
                self.exec_mov16(inst);
                cont(1)
            }
            Op::Mul | Op::Mla | Op::Mls => {
                self.exec_mul(inst);
                cont(3)
            }
            Op::Sdiv | Op::Udiv => {
                self.exec_div(inst);
                cont(12)
            }
            Op::Smull | Op::Umull | Op::Smlal | Op::Umlal => {
                self.exec_mul_long(inst);
                cont(4)
            }
            Op::Ldr | Op::Ldrb | Op::Ldrh | Op::Ldrsb | Op::Ldrsh => {
                self.exec_load(bus, inst)?;
                cont(2)
            }
            Op::LdrLit => {
                self.exec_load_literal(bus, inst)?;
                cont(2)
            }
            Op::Str | Op::Strb | Op::Strh => {
                self.exec_store(bus, inst)?;
                cont(2)
            }
            Op::Ldrd | Op::Strd => {
                self.exec_mem_dual(bus, inst)?;
                cont(3)
            }
            Op::Ldm | Op::Ldmdb | Op::Pop => {
                let n = self.exec_load_multi(bus, inst)?;
                cont(1 + n)
            }
            Op::Stm | Op::Stmdb | Op::Push => {
                let n = self.exec_store_multi(bus, inst)?;
                cont(1 + n)
            }
            Op::B | Op::Bl => {
                self.exec_branch(inst);
                cont(1)
            }
            Op::Bx | Op::Blx => {
                self.exec_branch_reg(bus, inst);
                cont(1)
            }
            Op::Cbz | Op::Cbnz => {
                self.exec_cmp_branch(inst);
                cont(1)
            }
            Op::Tbb | Op::Tbh => {
                self.exec_table_branch(bus, inst)?;
                cont(2)
            }
            Op::It => {
                if let Operands::It { firstcond, mask } = inst.operands {
                    self.state.it_state = (firstcond << 4) | mask;
                }
                cont(1)
            }
            Op::Sxtb | Op::Sxth | Op::Uxtb | Op::Uxth | Op::Sxtab | Op::Sxtah | Op::Uxtab
            | Op::Uxtah => {
                self.exec_extend(inst);
                cont(1)
            }
            Op::Clz | Op::Rbit | Op::Rev | Op::Rev16 | Op::Revsh => {
                self.exec_reg_pair(inst);
                cont(1)
            }
            Op::Bfi | Op::Bfc | Op::Ubfx | Op::Sbfx => {
                self.exec_bit_field(inst);
                cont(1)
            }
            Op::Ssat | Op::Usat => {
                self.exec_saturate(inst);
                cont(1)
            }
            Op::Msr => {
                self.exec_msr(inst);
                cont(2)
            }
            Op::Mrs => {
                self.exec_mrs(inst);
                cont(2)
            }
            Op::Svc => {
                self.exc.set_pending(exception::SVCALL);
                cont(1)
            }
            Op::Bkpt => {
                let imm = match inst.operands {
                    Operands::Imm { imm } => imm as u8,
                    _ => 0,
                };
                Ok((1, StepExit::Bkpt(imm)))
            }
            Op::Cpsie | Op::Cpsid => {
                if let Operands::Imm { imm } = inst.operands {
                    let set = inst.op == Op::Cpsid;
                    if imm & 0x2 != 0 {
                        self.state.primask = set;
                    }
                    if imm & 0x1 != 0 {
                        self.state.faultmask = set;
                    }
                }
                cont(1)
            }
            Op::Ldrex | Op::Ldrexb | Op::Ldrexh => {
                self.exec_load_exclusive(bus, inst)?;
                cont(2)
            }
            Op::Strex | Op::Strexb | Op::Strexh => {
                self.exec_store_exclusive(bus, inst)?;
                cont(2)
            }
            Op::Clrex => {
                self.state.exclusive = None;
                cont(1)
            }
            Op::Wfi => {
                self.state.halted = true;
                cont(1)
            }
            Op::Nop | Op::Yield | Op::Wfe | Op::Sev | Op::Dmb | Op::Dsb | Op::Isb => cont(1),
            Op::Unknown => {
                tracing::debug!(
                    "unknown encoding {:#010x} at {:#010x}, pending HardFault\n{}",
                    inst.raw,
                    inst.address,
                    self.state.dump()
                );
                self.exc.set_pending(exception::HARD_FAULT);
                cont(1)
            }
            Op::Undefined => {
                self.exc.set_pending(exception::USAGE_FAULT);
                cont(1)
            }
        }
    }

    // ---------------------------------------------------------------
    // Data processing
    // ---------------------------------------------------------------

    fn exec_dp(&mut self, bus: &mut impl CpuBus, inst: &Instruction) -> Result<(), BusFault> {
        let Operands::Dp {
            rd,
            rn,
            op2,
            setflags,
        } = inst.operands
        else {
            return Ok(());
        };
        let carry_in = self.state.c();

        // Shift-by-register: the value comes from Rn, the amount from the
        // low byte of Rs; encoded-zero remapping does not apply.
        if let Operand2::RegShift { rs } = op2 {
            let value = rn.map_or(0, |r| self.state.reg(r));
            let amount = self.state.reg(rs) & 0xFF;
            let (result, carry) = match inst.op {
                Op::Lsl => shift_lsl(value, amount, carry_in),
                Op::Lsr => shift_lsr(value, amount, carry_in),
                Op::Asr => shift_asr(value, amount, carry_in),
                _ => shift_ror(value, amount, carry_in),
            };
            if let Some(rd) = rd {
                self.state.set_reg(rd, result);
            }
            if setflags {
                self.state.update_nz(result);
                self.state.set_c(carry);
            }
            return Ok(());
        }

        let (b, shifter_carry) = match op2 {
            Operand2::Imm(value) => (value, carry_in),
            Operand2::ModImm(raw) => thumb_expand_imm(raw as u32, carry_in),
            Operand2::Reg { rm, shift, amount } => {
                apply_shift(self.state.reg(rm), shift, amount as u32, carry_in)
            }
            Operand2::RegShift { .. } => unreachable!(),
        };

        // PC-relative forms (ADR and friends) use the aligned base.
        let a = match rn {
            Some(15) => self.last_pc.wrapping_add(4) & !3,
            Some(r) => self.state.reg(r),
            None => 0,
        };

        enum Out {
            Move(u32),
            Logic(u32),
            Arith(u32, bool, bool),
        }
        let out = match inst.op {
            // Immediate-shift forms of LSL/LSR/ASR/ROR land here and behave
            // as a move through the shifter.
            Op::Mov | Op::Lsl | Op::Lsr | Op::Asr | Op::Ror => Out::Move(b),
            Op::Mvn => Out::Move(!b),
            Op::And | Op::Tst => Out::Logic(a & b),
            Op::Orr => Out::Logic(a | b),
            Op::Eor | Op::Teq => Out::Logic(a ^ b),
            Op::Orn => Out::Logic(a | !b),
            Op::Bic => Out::Logic(a & !b),
            Op::Add | Op::Cmn => {
                let (r, c, v) = add_with_carry(a, b, false);
                Out::Arith(r, c, v)
            }
            Op::Adc => {
                let (r, c, v) = add_with_carry(a, b, carry_in);
                Out::Arith(r, c, v)
            }
            Op::Sub | Op::Cmp => {
                let (r, c, v) = add_with_carry(a, !b, true);
                Out::Arith(r, c, v)
            }
            Op::Sbc => {
                let (r, c, v) = add_with_carry(a, !b, carry_in);
                Out::Arith(r, c, v)
            }
            Op::Rsb => {
                let (r, c, v) = add_with_carry(!a, b, true);
                Out::Arith(r, c, v)
            }
            _ => unreachable!(),
        };

        match out {
            Out::Move(result) | Out::Logic(result) => {
                if let Some(rd) = rd {
                    if rd == 15 {
                        self.write_pc_branch(bus, result);
                    } else {
                        self.state.set_reg(rd, result);
                    }
                }
                if setflags {
                    self.state.update_nz(result);
                    self.state.set_c(shifter_carry);
                }
            }
            Out::Arith(result, carry, overflow) => {
                if let Some(rd) = rd {
                    if rd == 15 {
                        self.write_pc_branch(bus, result);
                    } else {
                        self.state.set_reg(rd, result);
                    }
                }
                if setflags {
                    self.state.update_nzcv(result, carry, overflow);
                }
            }
        }
        Ok(())
    }

    fn exec_mov16(&mut self, inst: &Instruction) {
        let Operands::MovImm16 { rd, imm } = inst.operands else {
            return;
        };
        let value = match inst.op {
            Op::Movw => imm as u32,
            _ => (self.state.reg(rd) & 0x0000_FFFF) | ((imm as u32) << 16),
        };
        self.state.set_reg(rd, value);
    }

    // ---------------------------------------------------------------
    // Multiply / divide
    // ---------------------------------------------------------------

    fn exec_mul(&mut self, inst: &Instruction) {
        let Operands::Mul {
            rd,
            rn,
            rm,
            ra,
            setflags,
        } = inst.operands
        else {
            return;
        };
        let product = self.state.reg(rn).wrapping_mul(self.state.reg(rm));
        let result = match inst.op {
            Op::Mla => self.state.reg(ra.unwrap_or(0)).wrapping_add(product),
            Op::Mls => self.state.reg(ra.unwrap_or(0)).wrapping_sub(product),
            _ => product,
        };
        self.state.set_reg(rd, result);
        if setflags {
            self.state.update_nz(result);
        }
    }

    fn exec_div(&mut self, inst: &Instruction) {
        let Operands::Mul { rd, rn, rm, .. } = inst.operands else {
            return;
        };
        let a = self.state.reg(rn);
        let b = self.state.reg(rm);
        let result = if inst.op == Op::Sdiv {
            sdiv(a, b)
        } else {
            udiv(a, b)
        };
        self.state.set_reg(rd, result);
    }

    fn exec_mul_long(&mut self, inst: &Instruction) {
        let Operands::MulLong { rdlo, rdhi, rn, rm } = inst.operands else {
            return;
        };
        let a = self.state.reg(rn);
        let b = self.state.reg(rm);
        let (lo, hi) = if matches!(inst.op, Op::Smull | Op::Smlal) {
            smull(a, b)
        } else {
            umull(a, b)
        };
        let product = ((hi as u64) << 32) | lo as u64;
        let result = if matches!(inst.op, Op::Smlal | Op::Umlal) {
            let acc =
                ((self.state.reg(rdhi) as u64) << 32) | self.state.reg(rdlo) as u64;
            acc.wrapping_add(product)
        } else {
            product
        };
        self.state.set_reg(rdlo, result as u32);
        self.state.set_reg(rdhi, (result >> 32) as u32);
    }

    // ---------------------------------------------------------------
    // Loads / stores
    // ---------------------------------------------------------------

    /// The shared addressing discipline: `offset_addr = base ± offset`,
    /// transfer address per `index`, writeback after the address forms.
    fn resolve_mem(&mut self, rn: u8, off: MemOff, index: bool, add: bool, wback: bool) -> u32 {
        let base = if rn == 15 {
            self.last_pc.wrapping_add(4) & !3
        } else {
            self.state.reg(rn)
        };
        let offset = match off {
            MemOff::Imm(value) => value,
            MemOff::Reg { rm, shift, amount } => {
                apply_shift(self.state.reg(rm), shift, amount as u32, false).0
            }
        };
        let offset_addr = if add {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if index { offset_addr } else { base };
        if wback && rn != 15 {
            self.state.set_reg(rn, offset_addr);
        }
        addr
    }

    fn exec_load(&mut self, bus: &mut impl CpuBus, inst: &Instruction) -> Result<(), BusFault> {
        let Operands::Mem {
            rt,
            rn,
            off,
            index,
            add,
            wback,
        } = inst.operands
        else {
            return Ok(());
        };
        let addr = self.resolve_mem(rn, off, index, add, wback);
        let value = match inst.op {
            Op::Ldr => self.read_mem_u32(bus, addr)?,
            Op::Ldrb => self.read_mem_u8(bus, addr)? as u32,
            Op::Ldrh => self.read_mem_u16(bus, addr)? as u32,
            Op::Ldrsb => sign_extend(self.read_mem_u8(bus, addr)? as u32, 8),
            _ => sign_extend(self.read_mem_u16(bus, addr)? as u32, 16),
        };
        if rt == 15 && inst.op == Op::Ldr {
            self.write_pc_branch(bus, value);
        } else {
            self.state.set_reg(rt, value);
        }
        Ok(())
    }

    fn exec_load_literal(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<(), BusFault> {
        let Operands::MemLit { rt, imm, add } = inst.operands else {
            return Ok(());
        };
        let base = self.last_pc.wrapping_add(4) & !3;
        let addr = if add {
            base.wrapping_add(imm)
        } else {
            base.wrapping_sub(imm)
        };
        let value = self.read_mem_u32(bus, addr)?;
        if rt == 15 {
            self.write_pc_branch(bus, value);
        } else {
            self.state.set_reg(rt, value);
        }
        Ok(())
    }

    fn exec_store(&mut self, bus: &mut impl CpuBus, inst: &Instruction) -> Result<(), BusFault> {
        let Operands::Mem {
            rt,
            rn,
            off,
            index,
            add,
            wback,
        } = inst.operands
        else {
            return Ok(());
        };
        let addr = self.resolve_mem(rn, off, index, add, wback);
        let value = self.state.reg(rt);
        match inst.op {
            Op::Str => self.write_mem_u32(bus, addr, value)?,
            Op::Strb => self.write_mem_u8(bus, addr, value as u8)?,
            _ => self.write_mem_u16(bus, addr, value as u16)?,
        }
        Ok(())
    }

    fn exec_mem_dual(&mut self, bus: &mut impl CpuBus, inst: &Instruction) -> Result<(), BusFault> {
        let Operands::MemDual {
            rt,
            rt2,
            rn,
            imm,
            index,
            add,
            wback,
        } = inst.operands
        else {
            return Ok(());
        };
        let base = self.state.reg(rn);
        let offset_addr = if add {
            base.wrapping_add(imm)
        } else {
            base.wrapping_sub(imm)
        };
        let addr = if index { offset_addr } else { base };
        if inst.op == Op::Ldrd {
            let lo = self.read_mem_u32(bus, addr)?;
            let hi = self.read_mem_u32(bus, addr.wrapping_add(4))?;
            self.state.set_reg(rt, lo);
            self.state.set_reg(rt2, hi);
        } else {
            self.write_mem_u32(bus, addr, self.state.reg(rt))?;
            self.write_mem_u32(bus, addr.wrapping_add(4), self.state.reg(rt2))?;
        }
        if wback {
            self.state.set_reg(rn, offset_addr);
        }
        Ok(())
    }

    /// LDM/LDMDB/POP. Returns the register count for cycle accounting.
    fn exec_load_multi(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<u32, BusFault> {
        let Operands::MemMulti { rn, list, wback } = inst.operands else {
            return Ok(0);
        };
        let count = list.count_ones();
        let start = match inst.op {
            Op::Ldmdb => self.state.reg(rn).wrapping_sub(4 * count),
            _ => self.state.reg(rn),
        };

        let mut addr = start;
        let mut pc_value = None;
        for i in 0..16u8 {
            if list & (1u16 << i) == 0 {
                continue;
            }
            let value = self.read_mem_u32(bus, addr)?;
            if i == 15 {
                pc_value = Some(value);
            } else {
                self.state.set_reg(i, value);
            }
            addr = addr.wrapping_add(4);
        }

        // Writeback before any PC branch: an EXC_RETURN popped into the PC
        // unstacks from the post-pop stack pointer.
        if wback && list & (1u16 << rn) == 0 {
            let new_base = match inst.op {
                Op::Ldmdb => start,
                _ => addr,
            };
            self.state.set_reg(rn, new_base);
        }
        if let Some(value) = pc_value {
            self.write_pc_branch(bus, value);
        }
        Ok(count)
    }

    /// STM/STMDB/PUSH. Returns the register count for cycle accounting.
    fn exec_store_multi(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<u32, BusFault> {
        let Operands::MemMulti { rn, list, wback } = inst.operands else {
            return Ok(0);
        };
        let count = list.count_ones();
        let descending = matches!(inst.op, Op::Stmdb | Op::Push);
        let start = if descending {
            self.state.reg(rn).wrapping_sub(4 * count)
        } else {
            self.state.reg(rn)
        };

        let mut addr = start;
        for i in 0..16u8 {
            if list & (1u16 << i) == 0 {
                continue;
            }
            self.write_mem_u32(bus, addr, self.state.reg(i))?;
            addr = addr.wrapping_add(4);
        }

        if wback {
            let new_base = if descending { start } else { addr };
            self.state.set_reg(rn, new_base);
        }
        Ok(count)
    }

    // ---------------------------------------------------------------
    // Branches
    // ---------------------------------------------------------------

    fn exec_branch(&mut self, inst: &Instruction) {
        let Operands::Branch { offset } = inst.operands else {
            return;
        };
        let target = self
            .last_pc
            .wrapping_add(4)
            .wrapping_add(offset as u32);
        if inst.op == Op::Bl {
            // The advanced PC is the return address; bit 0 keeps Thumb.
            let lr = self.state.pc() | 1;
            self.state.set_lr(lr);
        }
        self.state.set_pc_sequential(target);
    }

    fn exec_branch_reg(&mut self, bus: &mut impl CpuBus, inst: &Instruction) {
        let Operands::BranchReg { rm } = inst.operands else {
            return;
        };
        let target = self.state.reg(rm);
        if inst.op == Op::Blx {
            let lr = self.state.pc() | 1;
            self.state.set_lr(lr);
            self.state.branch(target);
        } else {
            self.write_pc_branch(bus, target);
        }
    }

    fn exec_cmp_branch(&mut self, inst: &Instruction) {
        let Operands::CmpBranch { rn, offset } = inst.operands else {
            return;
        };
        let value = self.state.reg(rn);
        let taken = if inst.op == Op::Cbz {
            value == 0
        } else {
            value != 0
        };
        if taken {
            let target = self.last_pc.wrapping_add(4).wrapping_add(offset);
            self.state.set_pc_sequential(target);
        }
    }

    fn exec_table_branch(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<(), BusFault> {
        let Operands::TblBranch { rn, rm } = inst.operands else {
            return Ok(());
        };
        let base = if rn == 15 {
            self.last_pc.wrapping_add(4)
        } else {
            self.state.reg(rn)
        };
        let index = self.state.reg(rm);
        let halfwords = if inst.op == Op::Tbb {
            self.read_mem_u8(bus, base.wrapping_add(index))? as u32
        } else {
            self.read_mem_u16(bus, base.wrapping_add(index.wrapping_mul(2)))? as u32
        };
        let target = self.last_pc.wrapping_add(4).wrapping_add(halfwords * 2);
        self.state.set_pc_sequential(target);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Extend / bit / saturate
    // ---------------------------------------------------------------

    fn exec_extend(&mut self, inst: &Instruction) {
        let Operands::Extend { rd, rn, rm, rotation } = inst.operands else {
            return;
        };
        let value = self.state.reg(rm);
        let rotation = rotation as u32;
        let extended = match inst.op {
            Op::Sxtb | Op::Sxtab => extend_byte_signed(value, rotation),
            Op::Sxth | Op::Sxtah => extend_halfword_signed(value, rotation),
            Op::Uxtb | Op::Uxtab => extend_byte_unsigned(value, rotation),
            _ => extend_halfword_unsigned(value, rotation),
        };
        let result = match rn {
            Some(rn) => self.state.reg(rn).wrapping_add(extended),
            None => extended,
        };
        self.state.set_reg(rd, result);
    }

    fn exec_reg_pair(&mut self, inst: &Instruction) {
        let Operands::RegPair { rd, rm } = inst.operands else {
            return;
        };
        let value = self.state.reg(rm);
        let result = match inst.op {
            Op::Clz => value.leading_zeros(),
            Op::Rbit => value.reverse_bits(),
            Op::Rev => value.swap_bytes(),
            Op::Rev16 => reverse_bytes_16(value),
            _ => reverse_bytes_signed_16(value),
        };
        self.state.set_reg(rd, result);
    }

    fn exec_bit_field(&mut self, inst: &Instruction) {
        let Operands::BitField { rd, rn, lsb, width } = inst.operands else {
            return;
        };
        let lsb = lsb as u32;
        let width = width as u32;
        let result = match inst.op {
            Op::Bfi => bit_field_insert(
                self.state.reg(rd),
                self.state.reg(rn.unwrap_or(0)),
                lsb,
                width,
            ),
            Op::Bfc => bit_field_clear(self.state.reg(rd), lsb, width),
            Op::Ubfx => bit_field_extract_unsigned(self.state.reg(rn.unwrap_or(0)), lsb, width),
            _ => bit_field_extract_signed(self.state.reg(rn.unwrap_or(0)), lsb, width),
        };
        self.state.set_reg(rd, result);
    }

    fn exec_saturate(&mut self, inst: &Instruction) {
        let Operands::Sat {
            rd,
            rn,
            sat_imm,
            shift,
            amount,
        } = inst.operands
        else {
            return;
        };
        let value = apply_shift(self.state.reg(rn), shift, amount as u32, false).0;
        let (result, saturated) = if inst.op == Op::Ssat {
            signed_saturate(value, sat_imm as u32)
        } else {
            unsigned_saturate(value, sat_imm as u32)
        };
        self.state.set_reg(rd, result);
        if saturated {
            self.state.set_q(true);
        }
    }

    // ---------------------------------------------------------------
    // System registers
    // ---------------------------------------------------------------

    fn exec_msr(&mut self, inst: &Instruction) {
        let Operands::SysReg { reg, sysm } = inst.operands else {
            return;
        };
        let value = self.state.reg(reg);
        match sysm {
            0..=3 => {
                // APSR projections: only the flag bits are writable.
                let mask = 0xF800_0000;
                let xpsr = (self.state.xpsr() & !mask) | (value & mask);
                self.state.set_xpsr(xpsr);
            }
            8 => self.state.set_msp(value),
            9 => self.state.set_psp(value),
            16 => self.state.primask = value & 1 != 0,
            17 => self.state.basepri = value as u8,
            18 => {
                // BASEPRI_MAX only raises the masking priority.
                let new = value as u8;
                if new != 0 && (self.state.basepri == 0 || new < self.state.basepri) {
                    self.state.basepri = new;
                }
            }
            19 => self.state.faultmask = value & 1 != 0,
            20 => self.state.control = value & 0x3,
            _ => {}
        }
    }

    fn exec_mrs(&mut self, inst: &Instruction) {
        let Operands::SysReg { reg, sysm } = inst.operands else {
            return;
        };
        let xpsr = self.state.xpsr();
        let value = match sysm {
            0 => xpsr & 0xF800_0000,
            1 => xpsr & 0xF800_01FF,
            2 => xpsr & 0xFE00_FC00,
            3 => xpsr,
            5 => xpsr & 0x1FF,
            6 => xpsr & 0x0700_FC00,
            7 => xpsr & 0x0700_FDFF,
            8 => self.state.msp(),
            9 => self.state.psp(),
            16 => self.state.primask as u32,
            17 | 18 => self.state.basepri as u32,
            19 => self.state.faultmask as u32,
            20 => self.state.control,
            _ => 0,
        };
        self.state.set_reg(reg, value);
    }

    // ---------------------------------------------------------------
    // Exclusive access
    // ---------------------------------------------------------------

    fn exec_load_exclusive(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<(), BusFault> {
        let Operands::Excl { rt, rn, imm, .. } = inst.operands else {
            return Ok(());
        };
        let addr = self.state.reg(rn).wrapping_add(imm);
        let value = match inst.op {
            Op::Ldrex => self.read_mem_u32(bus, addr)?,
            Op::Ldrexb => self.read_mem_u8(bus, addr)? as u32,
            _ => self.read_mem_u16(bus, addr)? as u32,
        };
        self.state.set_reg(rt, value);
        self.state.exclusive = Some(addr);
        Ok(())
    }

    fn exec_store_exclusive(
        &mut self,
        bus: &mut impl CpuBus,
        inst: &Instruction,
    ) -> Result<(), BusFault> {
        let Operands::Excl { rd, rt, rn, imm } = inst.operands else {
            return Ok(());
        };
        let addr = self.state.reg(rn).wrapping_add(imm);
        let success = self.state.exclusive == Some(addr);
        if success {
            let value = self.state.reg(rt);
            match inst.op {
                Op::Strex => self.write_mem_u32(bus, addr, value)?,
                Op::Strexb => self.write_mem_u8(bus, addr, value as u8)?,
                _ => self.write_mem_u16(bus, addr, value as u16)?,
            }
        }
        // Either outcome clears the monitor.
        self.state.exclusive = None;
        if let Some(rd) = rd {
            self.state.set_reg(rd, if success { 0 } else { 1 });
        }
        Ok(())
    }
}

/// The narrow capability view handed to the exception manager. Frame
/// traffic maps bus faults to zero reads / dropped writes, as the stacking
/// sequence is not a fault source in this model.
struct CpuContext<'a, B: CpuBus> {
    state: &'a mut CpuState,
    bus: &'a mut B,
}

impl<B: CpuBus> InterruptContext for CpuContext<'_, B> {
    fn reg(&self, index: usize) -> u32 {
        self.state.reg(index as u8)
    }

    fn set_reg(&mut self, index: usize, value: u32) {
        self.state.set_reg(index as u8, value);
    }

    fn xpsr(&self) -> u32 {
        self.state.xpsr()
    }

    fn set_xpsr(&mut self, value: u32) {
        // EPSR.T survives any restore; there is no ARM state to enter.
        self.state.set_xpsr(value);
        self.state.set_t(true);
    }

    fn ipsr(&self) -> u16 {
        self.state.ipsr()
    }

    fn set_ipsr(&mut self, value: u16) {
        self.state.set_ipsr(value);
    }

    fn msp(&self) -> u32 {
        self.state.msp()
    }

    fn set_msp(&mut self, value: u32) {
        self.state.set_msp(value);
    }

    fn psp(&self) -> u32 {
        self.state.psp()
    }

    fn set_psp(&mut self, value: u32) {
        self.state.set_psp(value);
    }

    fn control(&self) -> u32 {
        self.state.control
    }

    fn lr(&self) -> u32 {
        self.state.lr()
    }

    fn set_lr(&mut self, value: u32) {
        self.state.set_lr(value);
    }

    fn pc(&self) -> u32 {
        self.state.pc()
    }

    fn branch(&mut self, target: u32) {
        self.state.branch(target);
    }

    fn read_word(&mut self, addr: u32) -> u32 {
        self.bus.read_u32(addr & !3).unwrap_or(0)
    }

    fn write_word(&mut self, addr: u32, value: u32) {
        let _ = self.bus.write_u32(addr & !3, value);
    }

    fn clear_exclusive(&mut self) {
        self.state.exclusive = None;
    }
}
