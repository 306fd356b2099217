//! The fetch/execute loop and top-level engine state (component C9).
//!
//! Grounded on the teacher's `Core::step` (in `core/mod.rs`): fetch, decode, execute,
//! then advance `pc`, tick the clock, and poll for a pending interrupt, all as one
//! unit of work per call. The host-escape dispatch (§4.6/§4.12 -- routing a synchronous
//! trap to the Newlib bridge instead of `mtvec` when no guest handler is installed, and
//! the `a7 >= 0xFFFF0000` debug-escape override) has no teacher precedent and is this
//! engine's own addition, documented in `DESIGN.md`.

use log::{debug, trace};

use crate::csr::Csr;
use crate::decode::{DecodeCache, Decoded};
use crate::execute;
use crate::memory::{Memory, OutOfBounds};
use crate::mmio::MmioRouter;
use crate::registers::{Registers, Specifier};
use crate::syscall;
use crate::timer::Timer;
use crate::trap::{self, Exception};

const REGISTER_A0: u8 = 10;
const REGISTER_A7: u8 = 17;
/// Above this threshold, `a7` on `ecall`/`ebreak` is a host-escape request rather than
/// a Newlib syscall number, regardless of whether a guest trap handler is installed.
const HOST_ESCAPE_THRESHOLD: u32 = 0xFFFF_0000;

#[derive(Debug, Clone)]
pub struct Config {
    pub reset_vector: u32,
    pub ram_size: u32,
    pub misa_c: bool,
}

/// Reported when a synchronous trap occurs with `mtvec == 0` and it isn't an `ecall`
/// routed to the syscall bridge: there is no guest handler and no host convention for
/// it, so the run cannot continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostError {
    pub cause: u32,
    pub pc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Terminated(i32),
    HostError(HostError),
}

#[derive(Debug)]
pub struct Engine {
    registers: Registers,
    memory: Memory,
    csr: Csr,
    timer: Timer,
    mmio: MmioRouter,
    cache: DecodeCache,
    reservation: Option<u32>,
    alignment_mask: u32,
    next_pc: u32,
    inst_size: u32,
    terminate: Option<i32>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let csr = Csr::new(config.misa_c);
        let alignment_mask = if csr.misa_c() { 0b01 } else { 0b11 };
        Self {
            registers: Registers::new(config.reset_vector),
            memory: Memory::new(config.ram_size),
            csr,
            timer: Timer::new(),
            mmio: MmioRouter::new(),
            cache: DecodeCache::new(),
            reservation: None,
            alignment_mask,
            next_pc: config.reset_vector,
            inst_size: 4,
            terminate: None,
        }
    }

    pub fn mmio_mut(&mut self) -> &mut MmioRouter {
        &mut self.mmio
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn csr_mut(&mut self) -> &mut Csr {
        &mut self.csr
    }

    pub fn x(&self, specifier: Specifier) -> u32 {
        self.registers.x(specifier)
    }

    pub fn set_x(&mut self, specifier: Specifier, value: u32) {
        self.registers.set_x(specifier, value)
    }

    pub fn pc(&self) -> u32 {
        self.registers.pc()
    }

    /// Overrides `pc` directly, bypassing the normal `next_pc` advance. Used by the GDB
    /// stub (E6) to implement register writes; instruction execution never calls this.
    pub fn set_pc(&mut self, pc: u32) {
        self.registers.set_pc(pc);
    }

    pub fn set_next_pc(&mut self, pc: u32) {
        self.next_pc = pc;
    }

    pub fn inst_size(&self) -> u32 {
        self.inst_size
    }

    pub fn alignment_mask(&self) -> u32 {
        self.alignment_mask
    }

    pub fn reservation(&self) -> Option<u32> {
        self.reservation
    }

    pub fn set_reservation(&mut self, address: Option<u32>) {
        self.reservation = address;
    }

    pub fn clear_reservation(&mut self) {
        self.reservation = None;
    }

    pub fn terminate(&mut self, code: i32) {
        self.terminate = Some(code);
    }

    fn timer_range_contains(&self, address: u32, size: usize) -> bool {
        use crate::timer::{MMIO_MTIME, MMIO_MTIMECMP};
        let end = address as u64 + size as u64;
        let in_range = |base: u32| address as u64 >= base as u64 && end <= base as u64 + 8;
        in_range(MMIO_MTIMECMP) || in_range(MMIO_MTIME)
    }

    pub fn mem_load_u8(&mut self, address: u32) -> Result<u8, OutOfBounds> {
        if self.timer_range_contains(address, 1) {
            let mut buf = [0u8; 1];
            self.timer.read_mmio(&mut buf, address);
            return Ok(buf[0]);
        }
        let mut buf = [0u8; 1];
        if self.mmio.read(&mut buf, address) {
            return Ok(buf[0]);
        }
        self.memory.load_u8(address)
    }

    pub fn mem_load_u16(&mut self, address: u32) -> Result<u16, OutOfBounds> {
        if self.timer_range_contains(address, 2) {
            let mut buf = [0u8; 2];
            self.timer.read_mmio(&mut buf, address);
            return Ok(u16::from_le_bytes(buf));
        }
        let mut buf = [0u8; 2];
        if self.mmio.read(&mut buf, address) {
            return Ok(u16::from_le_bytes(buf));
        }
        self.memory.load_u16(address)
    }

    pub fn mem_load_u32(&mut self, address: u32) -> Result<u32, OutOfBounds> {
        if self.timer_range_contains(address, 4) {
            let mut buf = [0u8; 4];
            self.timer.read_mmio(&mut buf, address);
            return Ok(u32::from_le_bytes(buf));
        }
        let mut buf = [0u8; 4];
        if self.mmio.read(&mut buf, address) {
            return Ok(u32::from_le_bytes(buf));
        }
        self.memory.load_u32(address)
    }

    pub fn mem_store_u8(&mut self, address: u32, value: u8) -> Result<(), OutOfBounds> {
        if self.timer_range_contains(address, 1) {
            self.timer.write_mmio(address, &[value]);
            return Ok(());
        }
        if self.mmio.write(address, &[value]) {
            return Ok(());
        }
        self.memory.store_u8(address, value)
    }

    pub fn mem_store_u16(&mut self, address: u32, value: u16) -> Result<(), OutOfBounds> {
        let bytes = value.to_le_bytes();
        if self.timer_range_contains(address, 2) {
            self.timer.write_mmio(address, &bytes);
            return Ok(());
        }
        if self.mmio.write(address, &bytes) {
            return Ok(());
        }
        self.memory.store_u16(address, value)
    }

    pub fn mem_store_u32(&mut self, address: u32, value: u32) -> Result<(), OutOfBounds> {
        let bytes = value.to_le_bytes();
        if self.timer_range_contains(address, 4) {
            self.timer.write_mmio(address, &bytes);
            return Ok(());
        }
        if self.mmio.write(address, &bytes) {
            return Ok(());
        }
        self.memory.store_u32(address, value)
    }

    pub fn csr_read(&self, csr: u16) -> Result<u32, crate::csr::CsrError> {
        self.csr.read(csr, &self.timer)
    }

    pub fn csr_write(&mut self, csr: u16, value: u32, mask: u32) -> Result<(), crate::csr::CsrError> {
        self.csr.write(csr, value, mask, &mut self.timer)?;
        if csr == crate::csr::MISA {
            self.alignment_mask = if self.csr.misa_c() { 0b01 } else { 0b11 };
        }
        Ok(())
    }

    /// Fetches one instruction word at `pc`, expanding a compressed parcel through the
    /// decode cache if needed. Returns the decoded instruction and its size in bytes.
    fn fetch(&mut self, pc: u32) -> Result<Decoded, trap::TrapRequest> {
        let lo = self
            .mem_load_u16(pc)
            .map_err(|_| Exception::InstructionAccessFault.req(pc))?;
        if lo & 0b11 == 0b11 {
            let word = self
                .mem_load_u32(pc)
                .map_err(|_| Exception::InstructionAccessFault.req(pc))?;
            Ok(self.cache.decode_wide(word))
        } else {
            self.cache
                .decode_narrow(lo)
                .map_err(|_| Exception::IllegalInstruction.req(lo as u32))
        }
    }

    /// Runs one iteration of the fetch/execute loop (§4.9).
    pub fn step(&mut self) -> StepResult {
        if let Some(code) = self.terminate {
            return StepResult::Terminated(code);
        }

        let pc = self.registers.pc();
        if pc & self.alignment_mask != 0 {
            self.next_pc = trap::enter(&mut self.csr, pc, Exception::InstructionAddressMisaligned.code(), pc);
            self.registers.set_pc(self.next_pc);
            return StepResult::Continue;
        }

        let decoded = match self.fetch(pc) {
            Ok(d) => d,
            Err(req) => {
                if let Some(err) = self.handle_trap(pc, req) {
                    return StepResult::HostError(err);
                }
                self.registers.set_pc(self.next_pc);
                return StepResult::Continue;
            }
        };
        self.inst_size = decoded.inst_size;
        self.next_pc = pc.wrapping_add(decoded.inst_size);

        trace!("fetch pc={:#010x} word={:#010x}", pc, decoded.expanded);

        let retired = match execute::execute(self, &decoded) {
            Ok(()) => true,
            Err(req) => {
                if let Some(err) = self.handle_trap(pc, req) {
                    return StepResult::HostError(err);
                }
                false
            }
        };

        self.registers.set_x(Specifier::X0, 0);
        self.registers.set_pc(self.next_pc);
        self.csr.increment_counters(retired);
        self.timer.tick();

        let mip = self.csr.mip(&self.timer);
        if let Some(interrupt) = trap::pending_interrupt(&self.csr, mip) {
            let epc = self.registers.pc();
            debug!("interrupt taken: {interrupt:?}");
            let vector = trap::enter(&mut self.csr, epc, interrupt.cause(), 0);
            self.registers.set_pc(vector);
        }

        if let Some(code) = self.terminate {
            StepResult::Terminated(code)
        } else {
            StepResult::Continue
        }
    }

    /// Dispatches a synchronous trap: to the Newlib syscall bridge (host-escape or
    /// `mtvec == 0`), to the guest's own trap handler, or -- if there's neither a
    /// guest handler nor an applicable host convention -- surfaces a fatal host error.
    fn handle_trap(&mut self, pc: u32, req: trap::TrapRequest) -> Option<HostError> {
        let a7 = self.registers.x(Specifier::from_u5(REGISTER_A7));
        let is_escapable = matches!(
            req.exception,
            Exception::EnvironmentCallFromMMode | Exception::Breakpoint
        );
        let debug_escape = is_escapable && a7 >= HOST_ESCAPE_THRESHOLD;
        let mtvec_zero = self.csr.mtvec() == 0;

        if debug_escape || (req.exception == Exception::EnvironmentCallFromMMode && mtvec_zero) {
            match syscall::handle(self) {
                syscall::Outcome::Exit(code) => self.terminate = Some(code),
                syscall::Outcome::Return(value) => {
                    self.registers.set_x(Specifier::from_u5(REGISTER_A0), value);
                    self.next_pc = pc.wrapping_add(self.inst_size);
                }
            }
            None
        } else if mtvec_zero {
            Some(HostError {
                cause: req.exception.code(),
                pc,
            })
        } else {
            self.next_pc = trap::enter(&mut self.csr, pc, req.exception.code(), req.mtval);
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn decode_for_test(&mut self, word: u32) -> Decoded {
        self.cache.decode_wide(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_engine() -> Engine {
        Engine::new(Config {
            reset_vector: 0,
            ram_size: 4096,
            misa_c: true,
        })
    }

    #[test]
    fn test_misaligned_pc_traps() {
        let mut engine = new_engine();
        engine.csr_write(crate::csr::MTVEC, 0x8000_0000, 0xFFFF_FFFF).unwrap();
        engine.registers.set_pc(0x1001); // misaligned for a 2-byte-aligned target
        let result = engine.step();
        assert_eq!(result, StepResult::Continue);
        assert_eq!(engine.pc(), 0x8000_0000);
    }

    #[test]
    fn test_host_error_when_no_handler() {
        let mut engine = new_engine();
        // Illegal instruction word with mtvec == 0 -> host error, not a trap loop.
        engine.memory_mut().store_u32(0, 0xFFFF_FFFF).unwrap();
        let result = engine.step();
        assert!(matches!(result, StepResult::HostError(_)));
    }

    #[test]
    fn test_exit_syscall_terminates() {
        let mut engine = new_engine();
        // li a7, 93 ; li a0, 7 ; ecall
        engine.memory_mut().store_u32(0, 0x05d00893).unwrap(); // addi x17,x0,93
        engine.memory_mut().store_u32(4, 0x00700513).unwrap(); // addi x10,x0,7
        engine.memory_mut().store_u32(8, 0x00000073).unwrap(); // ecall
        engine.step();
        engine.step();
        let result = engine.step();
        assert_eq!(result, StepResult::Terminated(7));
    }
}
