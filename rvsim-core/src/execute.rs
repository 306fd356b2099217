//! Instruction semantics (component C5): one handler family per major opcode.
//!
//! Grounded directly on the `Executor` methods in the teacher's `core/execute.rs`:
//! the generic `reg_imm_op`/`reg_reg_op`/`amo_op`/`jump_op`/`cond_branch`/`load_op`/
//! `store_op`/`csr_*_op` helper shapes are reused near-verbatim, and the DIV/DIVU/
//! REM/REMU edge-case formulas are carried over unchanged -- they already match this
//! engine's spec wording exactly (RISC-V "M" extension, chapter on division by zero
//! and signed overflow).

use log::trace;

use crate::decode::{self, Decoded};
use crate::engine::Engine;
use crate::registers::Specifier;
use crate::trap::{Exception, TrapRequest};

fn reg(n: u32) -> Specifier {
    Specifier::from_u5(n as u8)
}

const OP_IMM: u32 = 0b0010011;
const OP: u32 = 0b0110011;
const LOAD: u32 = 0b0000011;
const STORE: u32 = 0b0100011;
const BRANCH: u32 = 0b1100011;
const JAL: u32 = 0b1101111;
const JALR: u32 = 0b1100111;
const LUI: u32 = 0b0110111;
const AUIPC: u32 = 0b0010111;
const AMO: u32 = 0b0101111;
const SYSTEM: u32 = 0b1110011;
const MISC_MEM: u32 = 0b0001111;

pub fn execute(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    match d.opcode {
        OP => reg_reg(engine, d),
        OP_IMM => reg_imm(engine, d),
        LOAD => load(engine, d),
        STORE => store(engine, d),
        BRANCH => branch(engine, d),
        JAL => jal(engine, d),
        JALR => jalr(engine, d),
        LUI => {
            let imm = decode::u_imm(d.expanded) as u32;
            engine.set_x(reg(d.rd), imm);
            trace!("lui x{}, {:#x}", d.rd, imm);
            Ok(())
        }
        AUIPC => {
            let imm = decode::u_imm(d.expanded) as u32;
            engine.set_x(reg(d.rd), engine.pc().wrapping_add(imm));
            trace!("auipc x{}, {:#x}", d.rd, imm);
            Ok(())
        }
        AMO => amo(engine, d),
        SYSTEM => system(engine, d),
        MISC_MEM => {
            // FENCE / FENCE.I: NOPs under the single-threaded, content-addressed
            // decode-cache model (§5).
            Ok(())
        }
        _ => Err(Exception::IllegalInstruction.req(d.expanded)),
    }
}

fn reg_reg(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let s1 = engine.x(reg(d.rs1));
    let s2 = engine.x(reg(d.rs2));
    let result = match (d.funct3, d.funct7) {
        (0x0, 0x00) => s1.wrapping_add(s2), // ADD
        (0x0, 0x20) => s1.wrapping_sub(s2), // SUB
        (0x0, 0x01) => (s1 as i32).wrapping_mul(s2 as i32) as u32, // MUL
        (0x1, 0x00) => s1 << (s2 & 0x1F), // SLL
        (0x1, 0x01) => (((s1 as i32 as i64) * (s2 as i32 as i64)) >> 32) as u32, // MULH
        (0x2, 0x00) => ((s1 as i32) < (s2 as i32)) as u32, // SLT
        (0x2, 0x01) => (((s1 as i32 as i64) * (s2 as u64 as i64)) >> 32) as u32, // MULHSU
        (0x3, 0x00) => (s1 < s2) as u32, // SLTU
        (0x3, 0x01) => (((s1 as u64) * (s2 as u64)) >> 32) as u32, // MULHU
        (0x4, 0x00) => s1 ^ s2, // XOR
        (0x4, 0x01) => div(s1, s2), // DIV
        (0x5, 0x00) => s1 >> (s2 & 0x1F), // SRL
        (0x5, 0x20) => ((s1 as i32) >> (s2 & 0x1F)) as u32, // SRA
        (0x5, 0x01) => divu(s1, s2), // DIVU
        (0x6, 0x00) => s1 | s2, // OR
        (0x6, 0x01) => rem(s1, s2), // REM
        (0x7, 0x00) => s1 & s2, // AND
        (0x7, 0x01) => remu(s1, s2), // REMU
        _ => return Err(Exception::IllegalInstruction.req(d.expanded)),
    };
    engine.set_x(reg(d.rd), result);
    trace!("op x{}, x{}, x{} -> {:#x}", d.rd, d.rs1, d.rs2, result);
    Ok(())
}

/// `DIV`: truncating signed division. Divisor 0 -> `0xFFFFFFFF`; `i32::MIN / -1` ->
/// `i32::MIN` (the one case where signed division overflows; RISC-V defines the wrap).
fn div(s1: u32, s2: u32) -> u32 {
    if s2 == 0 {
        0xFFFF_FFFF
    } else {
        (s1 as i32).overflowing_div(s2 as i32).0 as u32
    }
}

fn divu(s1: u32, s2: u32) -> u32 {
    s1.checked_div(s2).unwrap_or(0xFFFF_FFFF)
}

/// `REM`: divisor 0 -> dividend; `i32::MIN % -1` -> `0`.
fn rem(s1: u32, s2: u32) -> u32 {
    if s2 == 0 {
        s1
    } else {
        (s1 as i32).overflowing_rem(s2 as i32).0 as u32
    }
}

fn remu(s1: u32, s2: u32) -> u32 {
    s1.checked_rem(s2).unwrap_or(s1)
}

fn reg_imm(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let s1 = engine.x(reg(d.rs1));
    let imm = decode::i_imm(d.expanded) as u32;
    let result = match d.funct3 {
        0x0 => s1.wrapping_add(imm), // ADDI
        0x1 => {
            // SLLI: funct7 must be 0x00, shamt in bits 24:20.
            if d.funct7 != 0x00 {
                return Err(Exception::IllegalInstruction.req(d.expanded));
            }
            s1 << decode::shamt(d.expanded)
        }
        0x2 => ((s1 as i32) < (imm as i32)) as u32, // SLTI
        0x3 => (s1 < imm) as u32,                   // SLTIU
        0x4 => s1 ^ imm,                             // XORI
        0x5 => match d.funct7 {
            0x00 => s1 >> decode::shamt(d.expanded), // SRLI
            0x20 => ((s1 as i32) >> decode::shamt(d.expanded)) as u32, // SRAI
            _ => return Err(Exception::IllegalInstruction.req(d.expanded)),
        },
        0x6 => s1 | imm, // ORI
        0x7 => s1 & imm, // ANDI
        _ => unreachable!("funct3 is only 3 bits"),
    };
    engine.set_x(reg(d.rd), result);
    trace!("op-imm x{}, x{}, {:#x} -> {:#x}", d.rd, d.rs1, imm, result);
    Ok(())
}

fn addr(engine: &Engine, d: &Decoded) -> u32 {
    engine
        .x(reg(d.rs1))
        .wrapping_add(decode::i_imm(d.expanded) as u32)
}

fn load(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let address = addr(engine, d);
    let to_fault = |_| Exception::LoadAccessFault.req(address);
    let value = match d.funct3 {
        0x0 => engine.mem_load_u8(address).map(|v| v as i8 as u32).map_err(to_fault)?, // LB
        0x1 => engine.mem_load_u16(address).map(|v| v as i16 as u32).map_err(to_fault)?, // LH
        0x2 => engine.mem_load_u32(address).map_err(to_fault)?, // LW
        0x4 => engine.mem_load_u8(address).map(|v| v as u32).map_err(to_fault)?, // LBU
        0x5 => engine.mem_load_u16(address).map(|v| v as u32).map_err(to_fault)?, // LHU
        _ => return Err(Exception::IllegalInstruction.req(d.expanded)),
    };
    engine.set_x(reg(d.rd), value);
    trace!("load x{}, {:#x} -> {:#x}", d.rd, address, value);
    Ok(())
}

fn store(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let base = engine.x(reg(d.rs1));
    let imm = decode::s_imm(d.expanded) as u32;
    let address = base.wrapping_add(imm);
    let value = engine.x(reg(d.rs2));
    let to_fault = |_| Exception::StoreAccessFault.req(address);
    match d.funct3 {
        0x0 => engine.mem_store_u8(address, value as u8).map_err(to_fault)?,
        0x1 => engine.mem_store_u16(address, value as u16).map_err(to_fault)?,
        0x2 => engine.mem_store_u32(address, value).map_err(to_fault)?,
        _ => return Err(Exception::IllegalInstruction.req(d.expanded)),
    }
    engine.clear_reservation();
    trace!("store {:#x}, {:#x}", address, value);
    Ok(())
}

fn check_branch_target(engine: &Engine, target: u32) -> Result<(), TrapRequest> {
    if target & engine.alignment_mask() != 0 {
        Err(Exception::InstructionAddressMisaligned.req(target))
    } else {
        Ok(())
    }
}

fn branch(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let s1 = engine.x(reg(d.rs1));
    let s2 = engine.x(reg(d.rs2));
    let taken = match d.funct3 {
        0x0 => s1 == s2,                 // BEQ
        0x1 => s1 != s2,                 // BNE
        0x4 => (s1 as i32) < (s2 as i32), // BLT
        0x5 => (s1 as i32) >= (s2 as i32), // BGE
        0x6 => s1 < s2,                  // BLTU
        0x7 => s1 >= s2,                 // BGEU
        _ => return Err(Exception::IllegalInstruction.req(d.expanded)),
    };
    if taken {
        let target = engine.pc().wrapping_add(decode::b_imm(d.expanded) as u32);
        check_branch_target(engine, target)?;
        engine.set_next_pc(target);
    }
    Ok(())
}

fn jal(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let target = engine.pc().wrapping_add(decode::j_imm(d.expanded) as u32);
    check_branch_target(engine, target)?;
    let link = engine.pc().wrapping_add(engine.inst_size());
    engine.set_x(reg(d.rd), link);
    engine.set_next_pc(target);
    Ok(())
}

fn jalr(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let base = engine.x(reg(d.rs1));
    let target = base.wrapping_add(decode::i_imm(d.expanded) as u32) & !0b1;
    check_branch_target(engine, target)?;
    let link = engine.pc().wrapping_add(engine.inst_size());
    engine.set_x(reg(d.rd), link);
    engine.set_next_pc(target);
    Ok(())
}

fn amo(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    if d.funct3 != 0x2 {
        return Err(Exception::IllegalInstruction.req(d.expanded));
    }
    let funct5 = d.funct7 >> 2;
    let address = engine.x(reg(d.rs1));
    if address & 0b11 != 0 {
        return Err(Exception::StoreAddressMisaligned.req(address));
    }
    let to_fault = |_| Exception::StoreAccessFault.req(address);
    let to_load_fault = |_| Exception::LoadAccessFault.req(address);

    if funct5 == 0b00010 {
        // LR.W
        let value = engine.mem_load_u32(address).map_err(to_load_fault)?;
        engine.set_reservation(Some(address));
        engine.set_x(reg(d.rd), value);
        trace!("lr.w x{}, {:#x}", d.rd, address);
        return Ok(());
    }
    if funct5 == 0b00011 {
        // SC.W
        let success = engine.reservation() == Some(address);
        if success {
            let value = engine.x(reg(d.rs2));
            engine.mem_store_u32(address, value).map_err(to_fault)?;
        }
        engine.clear_reservation();
        engine.set_x(reg(d.rd), if success { 0 } else { 1 });
        trace!("sc.w x{}, {:#x} -> {}", d.rd, address, !success as u32);
        return Ok(());
    }

    let old = engine.mem_load_u32(address).map_err(to_fault)?;
    let rs2 = engine.x(reg(d.rs2));
    let new = match funct5 {
        0b00001 => rs2,                                     // AMOSWAP
        0b00000 => old.wrapping_add(rs2),                   // AMOADD
        0b00100 => old ^ rs2,                                // AMOXOR
        0b01100 => old & rs2,                                // AMOAND
        0b01000 => old | rs2,                                // AMOOR
        0b10000 => ((old as i32).min(rs2 as i32)) as u32,    // AMOMIN
        0b10100 => ((old as i32).max(rs2 as i32)) as u32,    // AMOMAX
        0b11000 => old.min(rs2),                             // AMOMINU
        0b11100 => old.max(rs2),                             // AMOMAXU
        _ => return Err(Exception::IllegalInstruction.req(d.expanded)),
    };
    engine.mem_store_u32(address, new).map_err(to_fault)?;
    engine.clear_reservation();
    engine.set_x(reg(d.rd), old);
    trace!("amo x{}, {:#x} -> old {:#x} new {:#x}", d.rd, address, old, new);
    Ok(())
}

const MRET_FUNCT12: u32 = 0b0011000_00010;

fn system(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    match d.funct3 {
        0x0 => {
            let funct12 = decode::funct12(d.expanded);
            match funct12 {
                0 => Err(Exception::EnvironmentCallFromMMode.req(0)), // ECALL
                1 => Err(Exception::Breakpoint.req(0)),               // EBREAK
                MRET_FUNCT12 => {
                    let next_pc = crate::trap::mret(engine.csr_mut(), engine.alignment_mask());
                    engine.set_next_pc(next_pc);
                    Ok(())
                }
                0b0001_0000_0101 => Ok(()), // WFI: treated as NOP.
                _ => Err(Exception::IllegalInstruction.req(d.expanded)),
            }
        }
        0x1 | 0x2 | 0x3 | 0x5 | 0x6 | 0x7 => csr_op(engine, d),
        _ => Err(Exception::IllegalInstruction.req(d.expanded)),
    }
}

fn csr_op(engine: &mut Engine, d: &Decoded) -> Result<(), TrapRequest> {
    let csr = decode::funct12(d.expanded) as u16;
    let is_immediate = d.funct3 & 0x4 != 0;
    let op = d.funct3 & 0x3;
    let operand = if is_immediate {
        d.rs1
    } else {
        engine.x(reg(d.rs1))
    };
    let rd_is_zero = d.rd == 0;
    let rs1_is_zero = d.rs1 == 0;

    // CSRRS/CSRRC(I) with rs1==x0 skip the write, per the ISA (reads have no
    // side effect in that case); CSRRW(I) with rd==x0 skips the read.
    let skip_read = op == 0b01 && rd_is_zero;
    let old = if skip_read {
        0
    } else {
        engine
            .csr_read(csr)
            .map_err(|_| Exception::IllegalInstruction.req(d.expanded))?
    };

    let skip_write = (op == 0b10 || op == 0b11) && rs1_is_zero;
    if !skip_write {
        let (value, mask) = match op {
            0b01 => (operand, 0xFFFF_FFFF), // CSRRW(I)
            0b10 => (operand, operand),     // CSRRS(I): set bits
            0b11 => (0, operand),           // CSRRC(I): clear bits
            _ => unreachable!(),
        };
        engine
            .csr_write(csr, value, mask)
            .map_err(|_| Exception::IllegalInstruction.req(d.expanded))?;
    }

    if !rd_is_zero {
        engine.set_x(reg(d.rd), old);
    }
    trace!("csr {:#x} op{} -> old {:#x}", csr, op, old);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Config, Engine};

    fn new_engine() -> Engine {
        Engine::new(Config {
            reset_vector: 0,
            ram_size: 4096,
            misa_c: true,
        })
    }

    #[test]
    fn test_div_by_zero() {
        assert_eq!(div(10, 0), 0xFFFF_FFFF);
    }

    #[test]
    fn test_div_overflow() {
        assert_eq!(div(0x8000_0000, 0xFFFF_FFFF), 0x8000_0000);
    }

    #[test]
    fn test_divu_by_zero() {
        assert_eq!(divu(10, 0), 0xFFFF_FFFF);
    }

    #[test]
    fn test_rem_overflow() {
        assert_eq!(rem(0x8000_0000, 0xFFFF_FFFF), 0);
    }

    #[test]
    fn test_remu_by_zero() {
        assert_eq!(remu(42, 0), 42);
    }

    #[test]
    fn test_addi_and_add() {
        let mut engine = new_engine();
        // addi x1, x0, 5
        let d = engine.decode_for_test(0x00500093);
        execute(&mut engine, &d).unwrap();
        assert_eq!(engine.x(reg(1)), 5);
    }

    #[test]
    fn test_lui() {
        let mut engine = new_engine();
        // lui x1, 0x12345
        let d = engine.decode_for_test(0x123450B7);
        execute(&mut engine, &d).unwrap();
        assert_eq!(engine.x(reg(1)), 0x1234_5000);
    }

    #[test]
    fn test_lr_sc_round_trip() {
        let mut engine = new_engine();
        engine.mem_store_u32(0x100, 0xDEAD_BEEF).unwrap();
        // lr.w x1, (x2) with x2 = 0x100
        engine.set_x(reg(2), 0x100);
        let lr_w = (0b00010_0_0 << 25) | (0 << 20) | (2 << 15) | (0b010 << 12) | (1 << 7) | 0b0101111;
        let d = engine.decode_for_test(lr_w);
        execute(&mut engine, &d).unwrap();
        assert_eq!(engine.x(reg(1)), 0xDEAD_BEEF);
        assert_eq!(engine.reservation(), Some(0x100));

        // An intervening store clears the reservation.
        engine.mem_store_u32(0x100, 0).unwrap();
        engine.clear_reservation();

        engine.set_x(reg(3), 0x1234_5678);
        let sc_w = (0b00011_0_0 << 25) | (3 << 20) | (2 << 15) | (0b010 << 12) | (4 << 7) | 0b0101111;
        let d = engine.decode_for_test(sc_w);
        execute(&mut engine, &d).unwrap();
        assert_eq!(engine.x(reg(4)), 1); // failure
        assert_eq!(engine.mem_load_u32(0x100).unwrap(), 0);
    }

    #[test]
    fn test_lr_w_out_of_bounds_is_load_fault() {
        let mut engine = new_engine();
        engine.set_x(reg(2), 0xFFFF_FFF0);
        let lr_w = (0b00010_0_0 << 25) | (0 << 20) | (2 << 15) | (0b010 << 12) | (1 << 7) | 0b0101111;
        let d = engine.decode_for_test(lr_w);
        let err = execute(&mut engine, &d).unwrap_err();
        assert_eq!(err.exception, Exception::LoadAccessFault);
    }
}
