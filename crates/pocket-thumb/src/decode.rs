//! Two-stage Thumb / Thumb-2 decoder.
//!
//! `decode` is a pure function `(hw1, hw2, pc) -> Instruction`. 16-bit
//! encodings dispatch on the top three bits; 32-bit encodings walk the
//! structural tree (load/store multiple, dual/exclusive/table-branch,
//! data-processing, branch-and-misc, single load/store, multiplies).
//! Coprocessor space and unimplemented holes come back as `Op::Unknown`;
//! the architectural UDF encoding comes back as `Op::Undefined`.

use crate::alu::sign_extend;
use crate::inst::{Cond, Instruction, MemOff, Op, Operand2, Operands, Shift};

/// True when `hw1` is the first half of a 32-bit encoding: the top five
/// bits are one of the three escape prefixes (>= 0b11101).
pub fn is_thumb32(hw1: u16) -> bool {
    (hw1 >> 11) >= 0x1D
}

/// Decode one instruction. `hw2` is ignored for 16-bit encodings.
pub fn decode(hw1: u16, hw2: u16, address: u32) -> Instruction {
    if is_thumb32(hw1) {
        let raw = ((hw1 as u32) << 16) | hw2 as u32;
        let mut inst = Instruction {
            op: Op::Unknown,
            cond: Cond::Al,
            size: 4,
            operands: Operands::None,
            raw,
            address,
        };
        decode_thumb32(hw1, hw2, &mut inst);
        inst
    } else {
        let mut inst = Instruction {
            op: Op::Unknown,
            cond: Cond::Al,
            size: 2,
            operands: Operands::None,
            raw: hw1 as u32,
            address,
        };
        decode_thumb16(hw1, &mut inst);
        inst
    }
}

fn reg_op2(rm: u32) -> Operand2 {
    Operand2::Reg {
        rm: rm as u8,
        shift: Shift::Lsl,
        amount: 0,
    }
}

// ===================================================================
// 16-bit Thumb
// ===================================================================

fn decode_thumb16(hw: u16, inst: &mut Instruction) {
    let hw = hw as u32;
    match (hw >> 13) & 0x7 {
        0b000 => decode_t16_shift_add_sub(hw, inst),
        0b001 => decode_t16_data_imm(hw, inst),
        0b010 => match (hw >> 10) & 0x7 {
            0b000 => decode_t16_data_proc(hw, inst),
            0b001 => decode_t16_special_branch(hw, inst),
            0b010 | 0b011 => {
                // LDR Rt, [PC, #imm8*4]
                inst.op = Op::LdrLit;
                inst.operands = Operands::MemLit {
                    rt: ((hw >> 8) & 0x7) as u8,
                    imm: (hw & 0xFF) * 4,
                    add: true,
                };
            }
            _ => decode_t16_load_store_reg(hw, inst),
        },
        0b011 => decode_t16_load_store_imm(hw, inst),
        0b100 => {
            if hw & (1 << 12) != 0 {
                decode_t16_load_store_sp(hw, inst);
            } else {
                decode_t16_load_store_half(hw, inst);
            }
        }
        0b101 => {
            if hw & (1 << 12) != 0 {
                decode_t16_misc(hw, inst);
            } else {
                decode_t16_adr_add_sp(hw, inst);
            }
        }
        0b110 => {
            if hw & (1 << 12) != 0 {
                decode_t16_cond_branch_svc(hw, inst);
            } else {
                decode_t16_ldm_stm(hw, inst);
            }
        }
        _ => {
            // 11100: unconditional branch (the escape prefixes never reach
            // here; `is_thumb32` already routed them).
            let offset = sign_extend((hw & 0x7FF) << 1, 12) as i32;
            inst.op = Op::B;
            inst.operands = Operands::Branch { offset };
        }
    }
}

/// 000xx: LSL/LSR/ASR immediate, ADD/SUB register or 3-bit immediate.
fn decode_t16_shift_add_sub(hw: u32, inst: &mut Instruction) {
    let imm5 = (hw >> 6) & 0x1F;
    let rm = ((hw >> 3) & 0x7) as u8;
    let rd = (hw & 0x7) as u8;
    match (hw >> 11) & 0x3 {
        0b00 => {
            // LSL #0 is MOVS Rd, Rm.
            inst.op = if imm5 == 0 { Op::Mov } else { Op::Lsl };
            inst.operands = Operands::Dp {
                rd: Some(rd),
                rn: None,
                op2: Operand2::Reg {
                    rm,
                    shift: Shift::Lsl,
                    amount: imm5 as u8,
                },
                setflags: true,
            };
        }
        0b01 | 0b10 => {
            let shift = if (hw >> 11) & 0x3 == 0b01 {
                inst.op = Op::Lsr;
                Shift::Lsr
            } else {
                inst.op = Op::Asr;
                Shift::Asr
            };
            // An encoded amount of 0 means shift-by-32 here.
            inst.operands = Operands::Dp {
                rd: Some(rd),
                rn: None,
                op2: Operand2::Reg {
                    rm,
                    shift,
                    amount: if imm5 == 0 { 32 } else { imm5 as u8 },
                },
                setflags: true,
            };
        }
        _ => {
            let rn = ((hw >> 3) & 0x7) as u8;
            let rd = (hw & 0x7) as u8;
            let (op, op2) = match (hw >> 9) & 0x3 {
                0b00 => (Op::Add, reg_op2((hw >> 6) & 0x7)),
                0b01 => (Op::Sub, reg_op2((hw >> 6) & 0x7)),
                0b10 => (Op::Add, Operand2::Imm((hw >> 6) & 0x7)),
                _ => (Op::Sub, Operand2::Imm((hw >> 6) & 0x7)),
            };
            inst.op = op;
            inst.operands = Operands::Dp {
                rd: Some(rd),
                rn: Some(rn),
                op2,
                setflags: true,
            };
        }
    }
}

/// 001xx: MOVS/CMP/ADDS/SUBS Rd, #imm8.
fn decode_t16_data_imm(hw: u32, inst: &mut Instruction) {
    let rd = ((hw >> 8) & 0x7) as u8;
    let imm8 = Operand2::Imm(hw & 0xFF);
    match (hw >> 11) & 0x3 {
        0b00 => {
            inst.op = Op::Mov;
            inst.operands = Operands::Dp {
                rd: Some(rd),
                rn: None,
                op2: imm8,
                setflags: true,
            };
        }
        0b01 => {
            inst.op = Op::Cmp;
            inst.operands = Operands::Dp {
                rd: None,
                rn: Some(rd),
                op2: imm8,
                setflags: true,
            };
        }
        op => {
            inst.op = if op == 0b10 { Op::Add } else { Op::Sub };
            inst.operands = Operands::Dp {
                rd: Some(rd),
                rn: Some(rd),
                op2: imm8,
                setflags: true,
            };
        }
    }
}

/// 010000xxxx: data processing (register), all flag-setting.
fn decode_t16_data_proc(hw: u32, inst: &mut Instruction) {
    let rm = ((hw >> 3) & 0x7) as u8;
    let rdn = (hw & 0x7) as u8;
    let dp = |op: Op, rd: Option<u8>, rn: Option<u8>, op2: Operand2| {
        (
            op,
            Operands::Dp {
                rd,
                rn,
                op2,
                setflags: true,
            },
        )
    };
    let (op, operands) = match (hw >> 6) & 0xF {
        0x0 => dp(Op::And, Some(rdn), Some(rdn), reg_op2(rm as u32)),
        0x1 => dp(Op::Eor, Some(rdn), Some(rdn), reg_op2(rm as u32)),
        0x2 => dp(Op::Lsl, Some(rdn), Some(rdn), Operand2::RegShift { rs: rm }),
        0x3 => dp(Op::Lsr, Some(rdn), Some(rdn), Operand2::RegShift { rs: rm }),
        0x4 => dp(Op::Asr, Some(rdn), Some(rdn), Operand2::RegShift { rs: rm }),
        0x5 => dp(Op::Adc, Some(rdn), Some(rdn), reg_op2(rm as u32)),
        0x6 => dp(Op::Sbc, Some(rdn), Some(rdn), reg_op2(rm as u32)),
        0x7 => dp(Op::Ror, Some(rdn), Some(rdn), Operand2::RegShift { rs: rm }),
        0x8 => dp(Op::Tst, None, Some(rdn), reg_op2(rm as u32)),
        // NEG Rd, Rm encodes as RSB Rd, Rm, #0.
        0x9 => dp(Op::Rsb, Some(rdn), Some(rm), Operand2::Imm(0)),
        0xA => dp(Op::Cmp, None, Some(rdn), reg_op2(rm as u32)),
        0xB => dp(Op::Cmn, None, Some(rdn), reg_op2(rm as u32)),
        0xC => dp(Op::Orr, Some(rdn), Some(rdn), reg_op2(rm as u32)),
        0xD => (
            Op::Mul,
            Operands::Mul {
                rd: rdn,
                rn: rdn,
                rm,
                ra: None,
                setflags: true,
            },
        ),
        0xE => dp(Op::Bic, Some(rdn), Some(rdn), reg_op2(rm as u32)),
        _ => dp(Op::Mvn, Some(rdn), None, reg_op2(rm as u32)),
    };
    inst.op = op;
    inst.operands = operands;
}

/// 010001xx: high-register ADD/CMP/MOV and BX/BLX.
fn decode_t16_special_branch(hw: u32, inst: &mut Instruction) {
    let rm = ((hw >> 3) & 0xF) as u8;
    let rdn = (((hw >> 4) & 0x8) | (hw & 0x7)) as u8;
    match (hw >> 8) & 0x3 {
        0b00 => {
            inst.op = Op::Add;
            inst.operands = Operands::Dp {
                rd: Some(rdn),
                rn: Some(rdn),
                op2: reg_op2(rm as u32),
                setflags: false,
            };
        }
        0b01 => {
            inst.op = Op::Cmp;
            inst.operands = Operands::Dp {
                rd: None,
                rn: Some(rdn),
                op2: reg_op2(rm as u32),
                setflags: true,
            };
        }
        0b10 => {
            inst.op = Op::Mov;
            inst.operands = Operands::Dp {
                rd: Some(rdn),
                rn: None,
                op2: reg_op2(rm as u32),
                setflags: false,
            };
        }
        _ => {
            inst.op = if hw & (1 << 7) != 0 { Op::Blx } else { Op::Bx };
            inst.operands = Operands::BranchReg { rm };
        }
    }
}

/// 0101xxx: load/store with register offset.
fn decode_t16_load_store_reg(hw: u32, inst: &mut Instruction) {
    let rm = ((hw >> 6) & 0x7) as u8;
    let rn = ((hw >> 3) & 0x7) as u8;
    let rt = (hw & 0x7) as u8;
    inst.op = match (hw >> 9) & 0x7 {
        0b000 => Op::Str,
        0b001 => Op::Strh,
        0b010 => Op::Strb,
        0b011 => Op::Ldrsb,
        0b100 => Op::Ldr,
        0b101 => Op::Ldrh,
        0b110 => Op::Ldrb,
        _ => Op::Ldrsh,
    };
    inst.operands = Operands::Mem {
        rt,
        rn,
        off: MemOff::Reg {
            rm,
            shift: Shift::Lsl,
            amount: 0,
        },
        index: true,
        add: true,
        wback: false,
    };
}

/// 011xx: LDR/STR word and byte with 5-bit immediate.
fn decode_t16_load_store_imm(hw: u32, inst: &mut Instruction) {
    let imm5 = (hw >> 6) & 0x1F;
    let rn = ((hw >> 3) & 0x7) as u8;
    let rt = (hw & 0x7) as u8;
    let (op, imm) = match (hw >> 11) & 0x3 {
        0b00 => (Op::Str, imm5 * 4),
        0b01 => (Op::Ldr, imm5 * 4),
        0b10 => (Op::Strb, imm5),
        _ => (Op::Ldrb, imm5),
    };
    inst.op = op;
    inst.operands = Operands::Mem {
        rt,
        rn,
        off: MemOff::Imm(imm),
        index: true,
        add: true,
        wback: false,
    };
}

/// 1000x: LDRH/STRH with 5-bit immediate.
fn decode_t16_load_store_half(hw: u32, inst: &mut Instruction) {
    let imm5 = (hw >> 6) & 0x1F;
    inst.op = if hw & (1 << 11) != 0 {
        Op::Ldrh
    } else {
        Op::Strh
    };
    inst.operands = Operands::Mem {
        rt: (hw & 0x7) as u8,
        rn: ((hw >> 3) & 0x7) as u8,
        off: MemOff::Imm(imm5 * 2),
        index: true,
        add: true,
        wback: false,
    };
}

/// 1001x: LDR/STR Rt, [SP, #imm8*4].
fn decode_t16_load_store_sp(hw: u32, inst: &mut Instruction) {
    inst.op = if hw & (1 << 11) != 0 { Op::Ldr } else { Op::Str };
    inst.operands = Operands::Mem {
        rt: ((hw >> 8) & 0x7) as u8,
        rn: 13,
        off: MemOff::Imm((hw & 0xFF) * 4),
        index: true,
        add: true,
        wback: false,
    };
}

/// 1010x: ADR (PC-relative ADD) / ADD Rd, SP, #imm8*4.
fn decode_t16_adr_add_sp(hw: u32, inst: &mut Instruction) {
    let rn = if hw & (1 << 11) != 0 { 13 } else { 15 };
    inst.op = Op::Add;
    inst.operands = Operands::Dp {
        rd: Some(((hw >> 8) & 0x7) as u8),
        rn: Some(rn),
        op2: Operand2::Imm((hw & 0xFF) * 4),
        setflags: false,
    };
}

/// 1011xxxx: the miscellaneous 16-bit group.
fn decode_t16_misc(hw: u32, inst: &mut Instruction) {
    let sub_op = (hw >> 8) & 0xF;

    // CBZ/CBNZ claim the 0bx0x1 slots.
    if sub_op & 0b0101 == 0b0001 {
        let imm = (((hw >> 9) & 1) << 5) | ((hw >> 3) & 0x1F);
        inst.op = if sub_op & 0b1000 != 0 {
            Op::Cbnz
        } else {
            Op::Cbz
        };
        inst.operands = Operands::CmpBranch {
            rn: (hw & 0x7) as u8,
            offset: imm * 2,
        };
        return;
    }

    match sub_op {
        0b0000 => {
            // ADD/SUB SP, SP, #imm7*4
            inst.op = if hw & (1 << 7) != 0 { Op::Sub } else { Op::Add };
            inst.operands = Operands::Dp {
                rd: Some(13),
                rn: Some(13),
                op2: Operand2::Imm((hw & 0x7F) * 4),
                setflags: false,
            };
        }
        0b0010 => {
            // SXTH/SXTB/UXTH/UXTB
            inst.op = match (hw >> 6) & 0x3 {
                0 => Op::Sxth,
                1 => Op::Sxtb,
                2 => Op::Uxth,
                _ => Op::Uxtb,
            };
            inst.operands = Operands::Extend {
                rd: (hw & 0x7) as u8,
                rn: None,
                rm: ((hw >> 3) & 0x7) as u8,
                rotation: 0,
            };
        }
        0b0100 | 0b0101 => {
            // PUSH {…, LR}
            let mut list = (hw & 0xFF) as u16;
            if hw & (1 << 8) != 0 {
                list |= 1 << 14;
            }
            inst.op = Op::Push;
            inst.operands = Operands::MemMulti {
                rn: 13,
                list,
                wback: true,
            };
        }
        0b0110 => {
            inst.op = if hw & (1 << 4) != 0 {
                Op::Cpsid
            } else {
                Op::Cpsie
            };
            inst.operands = Operands::Imm { imm: hw & 0x7 };
        }
        0b1010 => {
            let op = match (hw >> 6) & 0x3 {
                0 => Op::Rev,
                1 => Op::Rev16,
                3 => Op::Revsh,
                _ => Op::Unknown,
            };
            inst.op = op;
            if op != Op::Unknown {
                inst.operands = Operands::RegPair {
                    rd: (hw & 0x7) as u8,
                    rm: ((hw >> 3) & 0x7) as u8,
                };
            }
        }
        0b1100 | 0b1101 => {
            // POP {…, PC}
            let mut list = (hw & 0xFF) as u16;
            if hw & (1 << 8) != 0 {
                list |= 1 << 15;
            }
            inst.op = Op::Pop;
            inst.operands = Operands::MemMulti {
                rn: 13,
                list,
                wback: true,
            };
        }
        0b1110 => {
            inst.op = Op::Bkpt;
            inst.operands = Operands::Imm { imm: hw & 0xFF };
        }
        0b1111 => {
            if hw & 0xF != 0 {
                inst.op = Op::It;
                inst.operands = Operands::It {
                    firstcond: ((hw >> 4) & 0xF) as u8,
                    mask: (hw & 0xF) as u8,
                };
            } else {
                inst.op = match (hw >> 4) & 0xF {
                    0 => Op::Nop,
                    1 => Op::Yield,
                    2 => Op::Wfe,
                    3 => Op::Wfi,
                    4 => Op::Sev,
                    _ => Op::Nop,
                };
            }
        }
        _ => {}
    }
}

/// 1100x: LDM/STM with an 8-bit register list.
fn decode_t16_ldm_stm(hw: u32, inst: &mut Instruction) {
    let is_load = hw & (1 << 11) != 0;
    let rn = ((hw >> 8) & 0x7) as u8;
    let list = (hw & 0xFF) as u16;
    inst.op = if is_load { Op::Ldm } else { Op::Stm };
    // STM always writes back; LDM only when Rn is not in the list.
    let wback = !(is_load && list & (1u16 << rn) != 0);
    inst.operands = Operands::MemMulti { rn, list, wback };
}

/// 1101xxxx: conditional branch, UDF (cond 0xE), SVC (cond 0xF).
fn decode_t16_cond_branch_svc(hw: u32, inst: &mut Instruction) {
    let cond = (hw >> 8) & 0xF;
    match cond {
        0xE => inst.op = Op::Undefined,
        0xF => {
            inst.op = Op::Svc;
            inst.operands = Operands::Imm { imm: hw & 0xFF };
        }
        _ => {
            inst.op = Op::B;
            inst.cond = Cond::from_bits(cond);
            inst.operands = Operands::Branch {
                offset: sign_extend((hw & 0xFF) << 1, 9) as i32,
            };
        }
    }
}

// ===================================================================
// 32-bit Thumb-2
// ===================================================================

fn decode_thumb32(hw1: u16, hw2: u16, inst: &mut Instruction) {
    let hw1 = hw1 as u32;
    let hw2 = hw2 as u32;
    let op1 = (hw1 >> 11) & 0x3;
    let op2 = (hw1 >> 4) & 0x7F;
    let op = (hw2 >> 15) & 0x1;

    match op1 {
        0b01 => {
            if op2 & 0x64 == 0x00 {
                decode_t32_load_store_multiple(hw1, hw2, inst);
            } else if op2 & 0x64 == 0x04 {
                decode_t32_dual_excl_table(hw1, hw2, inst);
            } else if op2 & 0x60 == 0x20 {
                decode_t32_dp_shifted_reg(hw1, hw2, inst);
            }
            // else: coprocessor space, left Unknown.
        }
        0b10 => {
            if op == 1 {
                decode_t32_branch_misc(hw1, hw2, inst);
            } else if op2 & 0x20 == 0 {
                decode_t32_dp_modified_imm(hw1, hw2, inst);
            } else {
                decode_t32_dp_plain_imm(hw1, hw2, inst);
            }
        }
        0b11 => {
            if op2 & 0x71 == 0x00 {
                decode_t32_store_single(hw1, hw2, inst);
            } else if op2 & 0x67 == 0x01 {
                decode_t32_load(hw1, hw2, inst, Width::Byte);
            } else if op2 & 0x67 == 0x03 {
                decode_t32_load(hw1, hw2, inst, Width::Half);
            } else if op2 & 0x67 == 0x05 {
                decode_t32_load(hw1, hw2, inst, Width::Word);
            } else if op2 & 0x67 == 0x07 {
                inst.op = Op::Undefined;
            } else if op2 & 0x70 == 0x20 {
                decode_t32_dp_reg(hw1, hw2, inst);
            } else if op2 & 0x78 == 0x30 {
                decode_t32_multiply(hw1, hw2, inst);
            } else if op2 & 0x78 == 0x38 {
                decode_t32_long_multiply(hw1, hw2, inst);
            }
            // else: coprocessor space, left Unknown.
        }
        _ => {}
    }
}

/// LDM/STM/LDMDB/STMDB with a 16-bit register list.
fn decode_t32_load_store_multiple(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let is_load = hw1 & (1 << 4) != 0;
    let wback = hw1 & (1 << 5) != 0;
    let rn = (hw1 & 0xF) as u8;
    let list = (hw2 & 0xDFFF) as u16; // bit 13 is reserved

    inst.op = match ((hw1 >> 7) & 0x3, is_load) {
        (0b01, true) => Op::Ldm,
        (0b01, false) => Op::Stm,
        (0b10, true) => Op::Ldmdb,
        (0b10, false) => Op::Stmdb,
        _ => return,
    };
    inst.operands = Operands::MemMulti { rn, list, wback };
}

/// Load/store dual, load/store exclusive, table branch.
fn decode_t32_dual_excl_table(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let rn = (hw1 & 0xF) as u8;
    let rt = ((hw2 >> 12) & 0xF) as u8;
    let rt2 = ((hw2 >> 8) & 0xF) as u8;
    let imm8 = hw2 & 0xFF;

    match hw1 & 0x1F0 {
        0x040 => {
            // STREX Rd, Rt, [Rn, #imm8*4]
            inst.op = Op::Strex;
            inst.operands = Operands::Excl {
                rd: Some(((hw2 >> 8) & 0xF) as u8),
                rt,
                rn,
                imm: imm8 * 4,
            };
            return;
        }
        0x050 => {
            inst.op = Op::Ldrex;
            inst.operands = Operands::Excl {
                rd: None,
                rt,
                rn,
                imm: imm8 * 4,
            };
            return;
        }
        0x0C0 => {
            // STREXB/STREXH with the status register in hw2[3:0].
            let op = match (hw2 >> 4) & 0xF {
                0x4 => Op::Strexb,
                0x5 => Op::Strexh,
                _ => return,
            };
            inst.op = op;
            inst.operands = Operands::Excl {
                rd: Some((hw2 & 0xF) as u8),
                rt,
                rn,
                imm: 0,
            };
            return;
        }
        0x0D0 => {
            match (hw2 >> 4) & 0xF {
                0x0 => {
                    inst.op = Op::Tbb;
                    inst.operands = Operands::TblBranch {
                        rn,
                        rm: (hw2 & 0xF) as u8,
                    };
                }
                0x1 => {
                    inst.op = Op::Tbh;
                    inst.operands = Operands::TblBranch {
                        rn,
                        rm: (hw2 & 0xF) as u8,
                    };
                }
                0x4 => {
                    inst.op = Op::Ldrexb;
                    inst.operands = Operands::Excl {
                        rd: None,
                        rt,
                        rn,
                        imm: 0,
                    };
                }
                0x5 => {
                    inst.op = Op::Ldrexh;
                    inst.operands = Operands::Excl {
                        rd: None,
                        rt,
                        rn,
                        imm: 0,
                    };
                }
                _ => {}
            }
            return;
        }
        _ => {}
    }

    // LDRD/STRD. P=0,W=0 belongs to the exclusive slots handled above.
    let p = hw1 & (1 << 8) != 0;
    let u = hw1 & (1 << 7) != 0;
    let w = hw1 & (1 << 5) != 0;
    let is_load = hw1 & (1 << 4) != 0;
    if !p && !w {
        return;
    }
    inst.op = if is_load { Op::Ldrd } else { Op::Strd };
    inst.operands = Operands::MemDual {
        rt,
        rt2,
        rn,
        imm: imm8 * 4,
        index: p,
        add: u,
        wback: w,
    };
}

/// Data processing (shifted register).
fn decode_t32_dp_shifted_reg(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op = (hw1 >> 5) & 0xF;
    let s = hw1 & (1 << 4) != 0;
    let rn = (hw1 & 0xF) as u8;
    let rd = ((hw2 >> 8) & 0xF) as u8;
    let rm = (hw2 & 0xF) as u8;
    let amount = (((hw2 >> 12) & 0x7) << 2) | ((hw2 >> 6) & 0x3);
    let shift = Shift::from_bits((hw2 >> 4) & 0x3);
    let op2 = Operand2::Reg {
        rm,
        shift,
        amount: amount as u8,
    };

    let mapped = match op {
        0x0 => Op::And,
        0x1 => Op::Bic,
        0x2 => Op::Orr,
        0x3 => Op::Orn,
        0x4 => Op::Eor,
        0x8 => Op::Add,
        0xA => Op::Adc,
        0xB => Op::Sbc,
        0xD => Op::Sub,
        0xE => Op::Rsb,
        _ => return,
    };
    assign_dp(inst, mapped, rd, rn, s, op2);
}

/// Data processing (modified immediate); the raw imm12 rides along for the
/// executor to expand with the live carry.
fn decode_t32_dp_modified_imm(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op = (hw1 >> 5) & 0xF;
    let s = hw1 & (1 << 4) != 0;
    let rn = (hw1 & 0xF) as u8;
    let rd = ((hw2 >> 8) & 0xF) as u8;
    let i = (hw1 >> 10) & 0x1;
    let imm12 = (i << 11) | (((hw2 >> 12) & 0x7) << 8) | (hw2 & 0xFF);
    let op2 = Operand2::ModImm(imm12 as u16);

    let mapped = match op {
        0x0 => Op::And,
        0x1 => Op::Bic,
        0x2 => Op::Orr,
        0x3 => Op::Orn,
        0x4 => Op::Eor,
        0x8 => Op::Add,
        0xA => Op::Adc,
        0xB => Op::Sbc,
        0xD => Op::Sub,
        0xE => Op::Rsb,
        _ => return,
    };
    assign_dp(inst, mapped, rd, rn, s, op2);
}

/// Shared Rd==15/Rn==15 aliasing for the two data-processing groups:
/// AND/EOR/ADD/SUB with S and Rd==PC are TST/TEQ/CMN/CMP; ORR/ORN with
/// Rn==PC are MOV/MVN.
fn assign_dp(inst: &mut Instruction, op: Op, rd: u8, rn: u8, s: bool, op2: Operand2) {
    let (op, rd, rn) = match op {
        Op::And if rd == 15 && s => (Op::Tst, None, Some(rn)),
        Op::Eor if rd == 15 && s => (Op::Teq, None, Some(rn)),
        Op::Add if rd == 15 && s => (Op::Cmn, None, Some(rn)),
        Op::Sub if rd == 15 && s => (Op::Cmp, None, Some(rn)),
        Op::Orr if rn == 15 => (Op::Mov, Some(rd), None),
        Op::Orn if rn == 15 => (Op::Mvn, Some(rd), None),
        other => (other, Some(rd), Some(rn)),
    };
    inst.op = op;
    inst.operands = Operands::Dp {
        rd,
        rn,
        op2,
        setflags: s,
    };
}

/// Data processing (plain binary immediate): ADDW/SUBW/ADR, MOVW/MOVT,
/// SSAT/USAT, SBFX/UBFX, BFI/BFC.
fn decode_t32_dp_plain_imm(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op = (hw1 >> 4) & 0x1F;
    let rn = (hw1 & 0xF) as u8;
    let rd = ((hw2 >> 8) & 0xF) as u8;
    let i = (hw1 >> 10) & 1;
    let imm3 = (hw2 >> 12) & 0x7;
    let imm8 = hw2 & 0xFF;
    let imm12 = (i << 11) | (imm3 << 8) | imm8;

    match op {
        0x00 | 0x0A => {
            // ADDW/SUBW, or ADR when Rn is the PC.
            inst.op = if op == 0x00 { Op::Add } else { Op::Sub };
            inst.operands = Operands::Dp {
                rd: Some(rd),
                rn: Some(rn),
                op2: Operand2::Imm(imm12),
                setflags: false,
            };
        }
        0x04 | 0x0C => {
            let imm16 = ((hw1 & 0xF) << 12) | imm12;
            inst.op = if op == 0x04 { Op::Movw } else { Op::Movt };
            inst.operands = Operands::MovImm16 {
                rd,
                imm: imm16 as u16,
            };
        }
        0x10 | 0x18 => {
            let sh = (hw1 >> 5) & 1;
            let amount = ((imm3 << 2) | ((hw2 >> 6) & 0x3)) as u8;
            let (op_mapped, sat_imm) = if op == 0x10 {
                (Op::Ssat, ((hw2 & 0x1F) + 1) as u8)
            } else {
                (Op::Usat, (hw2 & 0x1F) as u8)
            };
            inst.op = op_mapped;
            inst.operands = Operands::Sat {
                rd,
                rn,
                sat_imm,
                shift: if sh != 0 { Shift::Asr } else { Shift::Lsl },
                amount,
            };
        }
        0x14 | 0x1C => {
            // SBFX/UBFX: widthm1 encoding.
            inst.op = if op == 0x1C { Op::Ubfx } else { Op::Sbfx };
            inst.operands = Operands::BitField {
                rd,
                rn: Some(rn),
                lsb: ((imm3 << 2) | ((hw2 >> 6) & 0x3)) as u8,
                width: ((hw2 & 0x1F) + 1) as u8,
            };
        }
        0x16 => {
            // BFI, or BFC when Rn is the PC. msb encoding.
            let lsb = (imm3 << 2) | ((hw2 >> 6) & 0x3);
            let msb = hw2 & 0x1F;
            let width = msb.wrapping_sub(lsb).wrapping_add(1);
            inst.op = if rn == 15 { Op::Bfc } else { Op::Bfi };
            inst.operands = Operands::BitField {
                rd,
                rn: if rn == 15 { None } else { Some(rn) },
                lsb: lsb as u8,
                width: width as u8,
            };
        }
        _ => {}
    }
}

/// Branches and miscellaneous control.
fn decode_t32_branch_misc(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op = (hw1 >> 4) & 0x7F;
    let op2 = (hw2 >> 12) & 0x7;
    let s = (hw1 >> 10) & 1;
    let j1 = (hw2 >> 13) & 1;
    let j2 = (hw2 >> 11) & 1;
    let imm11 = hw2 & 0x7FF;

    match op2 & 0x5 {
        0x0 => {
            if op & 0x38 != 0x38 {
                // B<cond>.W, T3: offset is S:J2:J1:imm6:imm11:0.
                let imm6 = hw1 & 0x3F;
                let imm =
                    (s << 20) | (j2 << 19) | (j1 << 18) | (imm6 << 12) | (imm11 << 1);
                inst.op = Op::B;
                inst.cond = Cond::from_bits((hw1 >> 6) & 0xF);
                inst.operands = Operands::Branch {
                    offset: sign_extend(imm, 21) as i32,
                };
            } else {
                decode_t32_misc_control(hw1, hw2, inst);
            }
        }
        0x1 | 0x5 => {
            // B.W (T4) / BL: offset is S:I1:I2:imm10:imm11:0 with
            // I1 = NOT(J1 XOR S), I2 = NOT(J2 XOR S).
            let imm10 = hw1 & 0x3FF;
            let i1 = !(j1 ^ s) & 1;
            let i2 = !(j2 ^ s) & 1;
            let imm = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1);
            inst.op = if op2 & 0x5 == 0x1 { Op::B } else { Op::Bl };
            inst.operands = Operands::Branch {
                offset: sign_extend(imm, 25) as i32,
            };
        }
        _ => {
            // BLX (to ARM state): no ARM state on Cortex-M.
        }
    }
}

/// MSR/MRS, hints and barriers inside the branch-and-misc region.
fn decode_t32_misc_control(hw1: u32, hw2: u32, inst: &mut Instruction) {
    match (hw1 >> 4) & 0x7F {
        0x38 | 0x39 => {
            inst.op = Op::Msr;
            inst.operands = Operands::SysReg {
                reg: (hw1 & 0xF) as u8,
                sysm: (hw2 & 0xFF) as u8,
            };
        }
        0x3A => {
            // Hint space (NOP.W, WFI.W, …): nothing here has a side effect
            // beyond WFI, which firmware only uses in the 16-bit form.
            inst.op = Op::Nop;
        }
        0x3B => {
            inst.op = match (hw2 >> 4) & 0xF {
                0x2 => Op::Clrex,
                0x4 => Op::Dsb,
                0x5 => Op::Dmb,
                0x6 => Op::Isb,
                _ => Op::Nop,
            };
            inst.operands = Operands::Imm { imm: hw2 & 0xF };
        }
        0x3E | 0x3F => {
            inst.op = Op::Mrs;
            inst.operands = Operands::SysReg {
                reg: ((hw2 >> 8) & 0xF) as u8,
                sysm: (hw2 & 0xFF) as u8,
            };
        }
        _ => {}
    }
}

/// Store single data item (STR/STRH/STRB, all addressing modes).
fn decode_t32_store_single(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op1 = (hw1 >> 5) & 0x7;
    let rn = (hw1 & 0xF) as u8;
    let rt = ((hw2 >> 12) & 0xF) as u8;
    let op = match op1 & 0x3 {
        0 => Op::Strb,
        1 => Op::Strh,
        2 => Op::Str,
        _ => return,
    };

    if op1 & 0x4 != 0 {
        inst.op = op;
        inst.operands = Operands::Mem {
            rt,
            rn,
            off: MemOff::Imm(hw2 & 0xFFF),
            index: true,
            add: true,
            wback: false,
        };
    } else if hw2 & 0x800 != 0 {
        inst.op = op;
        inst.operands = Operands::Mem {
            rt,
            rn,
            off: MemOff::Imm(hw2 & 0xFF),
            index: hw2 & (1 << 10) != 0,
            add: hw2 & (1 << 9) != 0,
            wback: hw2 & (1 << 8) != 0,
        };
    } else if hw2 & 0xFC0 == 0 {
        inst.op = op;
        inst.operands = Operands::Mem {
            rt,
            rn,
            off: MemOff::Reg {
                rm: (hw2 & 0xF) as u8,
                shift: Shift::Lsl,
                amount: ((hw2 >> 4) & 0x3) as u8,
            },
            index: true,
            add: true,
            wback: false,
        };
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Width {
    Byte,
    Half,
    Word,
}

/// Load byte/halfword/word. The sign bit lives in hw1[8], the 12-bit
/// immediate form in hw1[7]; Rn==15 selects the literal form with the add
/// direction in hw1[7].
fn decode_t32_load(hw1: u32, hw2: u32, inst: &mut Instruction, width: Width) {
    let rn = (hw1 & 0xF) as u8;
    let rt = ((hw2 >> 12) & 0xF) as u8;
    let signed = hw1 & (1 << 8) != 0;
    let imm12_form = hw1 & (1 << 7) != 0;

    let op = match (width, signed) {
        (Width::Byte, false) => Op::Ldrb,
        (Width::Byte, true) => Op::Ldrsb,
        (Width::Half, false) => Op::Ldrh,
        (Width::Half, true) => Op::Ldrsh,
        (Width::Word, false) => Op::Ldr,
        (Width::Word, true) => return, // no signed word load
    };

    if rn == 15 {
        if width == Width::Word {
            inst.op = Op::LdrLit;
            inst.operands = Operands::MemLit {
                rt,
                imm: hw2 & 0xFFF,
                add: imm12_form,
            };
        } else {
            // Byte/halfword literals reuse the Mem family with Rn = PC; the
            // executor aligns the base like any other PC-relative access.
            inst.op = op;
            inst.operands = Operands::Mem {
                rt,
                rn: 15,
                off: MemOff::Imm(hw2 & 0xFFF),
                index: true,
                add: imm12_form,
                wback: false,
            };
        }
        return;
    }

    if imm12_form {
        inst.op = op;
        inst.operands = Operands::Mem {
            rt,
            rn,
            off: MemOff::Imm(hw2 & 0xFFF),
            index: true,
            add: true,
            wback: false,
        };
    } else if hw2 & 0x800 != 0 {
        inst.op = op;
        inst.operands = Operands::Mem {
            rt,
            rn,
            off: MemOff::Imm(hw2 & 0xFF),
            index: hw2 & (1 << 10) != 0,
            add: hw2 & (1 << 9) != 0,
            wback: hw2 & (1 << 8) != 0,
        };
    } else if hw2 & 0xFC0 == 0 {
        inst.op = op;
        inst.operands = Operands::Mem {
            rt,
            rn,
            off: MemOff::Reg {
                rm: (hw2 & 0xF) as u8,
                shift: Shift::Lsl,
                amount: ((hw2 >> 4) & 0x3) as u8,
            },
            index: true,
            add: true,
            wback: false,
        };
    }
}

/// Data processing (register): register shifts, extends, misc ops.
fn decode_t32_dp_reg(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op1 = (hw1 >> 4) & 0xF;
    let op2 = (hw2 >> 4) & 0xF;
    let rn = (hw1 & 0xF) as u8;
    let rd = ((hw2 >> 8) & 0xF) as u8;
    let rm = (hw2 & 0xF) as u8;
    let s = hw1 & (1 << 4) != 0;

    if op2 == 0 && op1 & 0x8 == 0 {
        // LSL/LSR/ASR/ROR by register: value in Rn, amount in Rm.
        let op = match op1 >> 1 {
            0x0 => Op::Lsl,
            0x1 => Op::Lsr,
            0x2 => Op::Asr,
            _ => Op::Ror,
        };
        inst.op = op;
        inst.operands = Operands::Dp {
            rd: Some(rd),
            rn: Some(rn),
            op2: Operand2::RegShift { rs: rm },
            setflags: s,
        };
        return;
    }

    if op2 & 0x8 != 0 && op1 <= 0x5 {
        // Extend, with accumulate when Rn is a real register.
        let rotation = (((hw2 >> 4) & 0x3) * 8) as u8;
        let acc = rn != 15;
        let op = match op1 {
            0x0 => {
                if acc {
                    Op::Sxtah
                } else {
                    Op::Sxth
                }
            }
            0x1 => {
                if acc {
                    Op::Uxtah
                } else {
                    Op::Uxth
                }
            }
            0x4 => {
                if acc {
                    Op::Sxtab
                } else {
                    Op::Sxtb
                }
            }
            0x5 => {
                if acc {
                    Op::Uxtab
                } else {
                    Op::Uxtb
                }
            }
            _ => return,
        };
        inst.op = op;
        inst.operands = Operands::Extend {
            rd,
            rn: if acc { Some(rn) } else { None },
            rm,
            rotation,
        };
        return;
    }

    if op1 & 0xC == 0x8 {
        // Miscellaneous operations.
        let op = match (op1, op2 & 0x3) {
            (0x9, 0x0) => Op::Rev,
            (0x9, 0x1) => Op::Rev16,
            (0x9, 0x2) => Op::Rbit,
            (0x9, 0x3) => Op::Revsh,
            (0xB, 0x0) => Op::Clz,
            _ => return,
        };
        inst.op = op;
        inst.operands = Operands::RegPair { rd, rm };
    }
}

/// Multiply with 32-bit result: MUL/MLA/MLS.
fn decode_t32_multiply(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op1 = (hw1 >> 4) & 0x7;
    let op2 = (hw2 >> 4) & 0x3;
    let rn = (hw1 & 0xF) as u8;
    let rd = ((hw2 >> 8) & 0xF) as u8;
    let rm = (hw2 & 0xF) as u8;
    let ra = ((hw2 >> 12) & 0xF) as u8;

    if op1 != 0 {
        return;
    }
    match op2 {
        0x0 => {
            inst.op = if ra == 15 { Op::Mul } else { Op::Mla };
            inst.operands = Operands::Mul {
                rd,
                rn,
                rm,
                ra: if ra == 15 { None } else { Some(ra) },
                setflags: false,
            };
        }
        0x1 => {
            inst.op = Op::Mls;
            inst.operands = Operands::Mul {
                rd,
                rn,
                rm,
                ra: Some(ra),
                setflags: false,
            };
        }
        _ => {}
    }
}

/// Long multiply (64-bit result) and the divides, which share the group.
fn decode_t32_long_multiply(hw1: u32, hw2: u32, inst: &mut Instruction) {
    let op1 = (hw1 >> 4) & 0x7;
    let op2 = (hw2 >> 4) & 0xF;
    let rn = (hw1 & 0xF) as u8;
    let rdlo = ((hw2 >> 12) & 0xF) as u8;
    let rdhi = ((hw2 >> 8) & 0xF) as u8;
    let rm = (hw2 & 0xF) as u8;

    let long = |inst: &mut Instruction, op: Op| {
        inst.op = op;
        inst.operands = Operands::MulLong { rdlo, rdhi, rn, rm };
    };
    match (op1, op2) {
        (0x0, 0x0) => long(inst, Op::Smull),
        (0x2, 0x0) => long(inst, Op::Umull),
        (0x4, 0x0) => long(inst, Op::Smlal),
        (0x6, 0x0) => long(inst, Op::Umlal),
        (0x1, 0xF) | (0x3, 0xF) => {
            inst.op = if op1 == 0x1 { Op::Sdiv } else { Op::Udiv };
            inst.operands = Operands::Mul {
                rd: rdhi,
                rn,
                rm,
                ra: None,
                setflags: false,
            };
        }
        _ => {}
    }
}
