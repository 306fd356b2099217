//! The trap engine (component C6): synchronous/asynchronous trap entry, `mret`
//! unwind, and interrupt prioritization.
//!
//! Grounded on the `trap()` method and `Exception`/`Interrupt` enums in the teacher's
//! `core/mod.rs`, pruned of S-mode delegation (`medeleg`/`sideleg` don't exist in a
//! machine-mode-only engine) and of vectored-mode dispatch (direct mode only, per
//! §4.6 -- the teacher's full vectored-mode arithmetic is not needed here).

use log::trace;

use crate::csr::{Csr, MIP_MEIP, MIP_MSIP, MIP_MTIP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EnvironmentCallFromMMode,
}

impl Exception {
    pub fn code(self) -> u32 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddressMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EnvironmentCallFromMMode => 11,
        }
    }

    /// Packages this exception with its `mtval`, for `execute.rs` handlers to return.
    pub fn req(self, mtval: u32) -> TrapRequest {
        TrapRequest {
            exception: self,
            mtval,
        }
    }
}

/// A synchronous trap raised by instruction execution: which exception, and the
/// `mtval` to record for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRequest {
    pub exception: Exception,
    pub mtval: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    MachineSoftware,
    MachineTimer,
    MachineExternal,
}

impl Interrupt {
    fn code(self) -> u32 {
        match self {
            Interrupt::MachineSoftware => 3,
            Interrupt::MachineTimer => 7,
            Interrupt::MachineExternal => 11,
        }
    }

    /// The `mcause` value for this interrupt: the interrupt bit set, plus its code.
    pub fn cause(self) -> u32 {
        0x8000_0000 | self.code()
    }
}

/// Returns the highest-priority pending-and-enabled interrupt, if any, per the fixed
/// priority order MEI > MTI > MSI among machine-level interrupts (§4.6, §2).
pub fn pending_interrupt(csr: &Csr, mip: u32) -> Option<Interrupt> {
    if !csr.mstatus_mie() {
        return None;
    }
    let enabled = mip & csr.mie_bits();
    if enabled & MIP_MEIP != 0 {
        Some(Interrupt::MachineExternal)
    } else if enabled & MIP_MTIP != 0 {
        Some(Interrupt::MachineTimer)
    } else if enabled & MIP_MSIP != 0 {
        Some(Interrupt::MachineSoftware)
    } else {
        None
    }
}

/// Enters a trap: writes `mepc`/`mcause`/`mtval`, stashes `mstatus.MIE` into `MPIE`
/// and clears `MIE`, and returns the `next_pc` to install (`mtvec & !0b11`, direct
/// mode only).
///
/// `epc` is the PC to record as `mepc`: the faulting instruction's address for
/// synchronous traps, or the *not-yet-executed* next instruction for interrupts
/// (callers pick the right one -- see §4.6).
pub fn enter(csr: &mut Csr, epc: u32, cause: u32, mtval: u32) -> u32 {
    csr.enter_trap(epc, cause, mtval);
    let mie = csr.mstatus_mie();
    csr.set_mstatus_mpie(mie);
    csr.set_mstatus_mie(false);
    let next_pc = csr.mtvec() & !0b11;
    trace!(epc:?, cause:?, mtval:?, next_pc:?; "Entering trap at epc {epc:#010x} for cause {cause:#x}");
    next_pc
}

/// Unwinds an `mret`: restores `mstatus.MIE` from `MPIE`, sets `MPIE = 1`, and returns
/// the `next_pc` to install (`mepc` masked to the current alignment requirement, so
/// returning into compressed code is honored when `misa.C` is set).
pub fn mret(csr: &mut Csr, alignment_mask: u32) -> u32 {
    let mpie = csr.mstatus_mpie();
    csr.set_mstatus_mie(mpie);
    csr.set_mstatus_mpie(true);
    csr.mepc() & !alignment_mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::Timer;

    #[test]
    fn test_enter_saves_state() {
        let mut csr = Csr::new(true);
        csr.set_mstatus_mie(true);
        csr.write(crate::csr::MTVEC, 0x8000_0000, 0xFFFF_FFFF, &mut Timer::new())
            .unwrap();
        let next_pc = enter(&mut csr, 0x1000, Exception::IllegalInstruction.code(), 0xDEAD);
        assert_eq!(csr.mepc(), 0x1000);
        assert_eq!(csr.mcause(), 2);
        assert!(!csr.mstatus_mie());
        assert!(csr.mstatus_mpie());
        assert_eq!(next_pc, 0x8000_0000);
    }

    #[test]
    fn test_mret_restores_state() {
        let mut csr = Csr::new(true);
        csr.set_mstatus_mie(true);
        enter(&mut csr, 0x1000, 2, 0);
        let next_pc = mret(&mut csr, 0x3);
        assert!(csr.mstatus_mie());
        assert!(csr.mstatus_mpie());
        assert_eq!(next_pc, 0x1000);
    }

    #[test]
    fn test_pending_interrupt_requires_global_enable() {
        let mut csr = Csr::new(true);
        csr.write(crate::csr::MIE, MIP_MTIP, MIP_MTIP, &mut Timer::new())
            .unwrap();
        assert_eq!(pending_interrupt(&csr, MIP_MTIP), None);
        csr.set_mstatus_mie(true);
        assert_eq!(pending_interrupt(&csr, MIP_MTIP), Some(Interrupt::MachineTimer));
    }

    #[test]
    fn test_interrupt_priority_external_over_timer() {
        let mut csr = Csr::new(true);
        csr.set_mstatus_mie(true);
        csr.write(
            crate::csr::MIE,
            MIP_MTIP | MIP_MEIP,
            MIP_MTIP | MIP_MEIP,
            &mut Timer::new(),
        )
        .unwrap();
        assert_eq!(
            pending_interrupt(&csr, MIP_MTIP | MIP_MEIP),
            Some(Interrupt::MachineExternal)
        );
    }

    #[test]
    fn test_interrupt_priority_timer_over_software() {
        let mut csr = Csr::new(true);
        csr.set_mstatus_mie(true);
        csr.write(
            crate::csr::MIE,
            MIP_MTIP | MIP_MSIP,
            MIP_MTIP | MIP_MSIP,
            &mut Timer::new(),
        )
        .unwrap();
        assert_eq!(
            pending_interrupt(&csr, MIP_MTIP | MIP_MSIP),
            Some(Interrupt::MachineTimer)
        );
    }
}
