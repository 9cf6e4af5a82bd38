/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    session.rs

    The lockstep validation loop and divergence recovery.

*/

use crate::{
    compare::{compare_cpus, Divergence, Verdict},
    engine::{DebuggerHook, PrimaryEngine, ReferenceEngine},
    error::LockstepError,
    memory::ProtMapping,
    snapshot::start_reference,
    stepper::step_lockstep,
    tracelogger::TraceLogger,
    udmask::UndefinedFlagOracle,
};

#[derive(Debug)]
pub struct SessionOptions {
    /// Exclude the flags the oracle reports as undefined from the comparison.
    pub mask_flags:   bool,
    /// EFLAGS bits that are never compared.
    pub ignore_flags: u32,
    pub prot_mapping: ProtMapping,
    pub trace:        TraceLogger,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mask_flags:   true,
            ignore_flags: 0,
            prot_mapping: ProtMapping::default(),
            trace:        TraceLogger::None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DivergenceReport {
    pub divergence: Divergence,
    /// Instructions stepped before the divergence was detected.
    pub instruction_count: u64,
    /// Address of the diverging instruction. The primary engine has been restored to the state it
    /// had just before executing it.
    pub last_good_eip: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Halt {
    Diverged(DivergenceReport),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Halted(Halt),
}

/// A primary engine and a reference engine run in lockstep.
///
/// Each iteration compares both engines, then saves the primary engine's state as last known good,
/// asks the oracle for the flags the next instruction leaves undefined, and steps both engines by
/// one instruction. The first mismatch halts the session for good.
pub struct LockstepSession<P, R, O, D>
where
    P: PrimaryEngine,
{
    primary: P,
    reference: R,
    oracle: O,
    debugger: D,
    last_good: P::State,
    undefined_flags: u32,
    mask_flags: bool,
    ignore_flags: u32,
    trace: TraceLogger,
    instruction_count: u64,
    state: SessionState,
}

impl<P, R, O, D> LockstepSession<P, R, O, D>
where
    P: PrimaryEngine,
    R: ReferenceEngine,
    O: UndefinedFlagOracle<P>,
    D: DebuggerHook,
{
    /// Build the reference engine from a snapshot of `primary` and start a session.
    pub fn start(primary: P, oracle: O, debugger: D, options: SessionOptions) -> Result<Self, LockstepError> {
        let reference = start_reference::<R, P>(&primary, options.prot_mapping)?;
        Ok(Self::new(primary, reference, oracle, debugger, options))
    }

    /// Start a session over a reference engine that already mirrors `primary`.
    pub fn new(primary: P, reference: R, oracle: O, debugger: D, options: SessionOptions) -> Self {
        let last_good = primary.save_state();
        Self {
            primary,
            reference,
            oracle,
            debugger,
            last_good,
            undefined_flags: 0,
            mask_flags: options.mask_flags,
            ignore_flags: options.ignore_flags,
            trace: options.trace,
            instruction_count: 0,
            state: SessionState::Running,
        }
    }

    /// Run one iteration. Does nothing once the session has halted.
    pub fn iterate(&mut self) -> Result<SessionState, LockstepError> {
        if let SessionState::Halted(_) = self.state {
            return Ok(self.state);
        }

        let verdict = compare_cpus(
            &mut self.primary,
            &mut self.reference,
            self.undefined_flags,
            self.ignore_flags,
            &mut self.debugger,
            &mut self.trace,
        )?;

        match verdict {
            Verdict::Match => {
                self.last_good = self.primary.save_state();
                self.undefined_flags = if self.mask_flags {
                    self.oracle.undefined_flags(&self.primary)
                }
                else {
                    0
                };

                if self.trace.is_some() {
                    self.trace.println(format!(
                        "{:>10} {} UD: {:03X}",
                        self.instruction_count,
                        self.primary.registers(),
                        self.undefined_flags
                    ));
                }

                let event = step_lockstep(&mut self.primary, &mut self.reference)?;
                if let Some(interrupt) = event.interrupt {
                    self.trace.println(format!("{:>10} {}", "", interrupt));
                }
                self.instruction_count += 1;
            }
            Verdict::Diverged(divergence) => {
                // Registers go back to the last good state for inspection. The faulting
                // instruction is not executed again.
                self.primary.restore_state(&self.last_good);
                let last_good_eip = self.primary.registers().eip;
                log::error!(
                    "Divergence after {} instructions; primary restored to EIP {:08X}",
                    self.instruction_count,
                    last_good_eip
                );
                self.debugger.trap();
                self.trace.flush();

                self.state = SessionState::Halted(Halt::Diverged(DivergenceReport {
                    divergence,
                    instruction_count: self.instruction_count,
                    last_good_eip,
                }));
            }
        }
        Ok(self.state)
    }

    /// Iterate until the engines diverge. There is no successful end state: the loop only stops
    /// on a divergence or a fatal engine error.
    pub fn run(&mut self) -> Result<DivergenceReport, LockstepError> {
        loop {
            if let SessionState::Halted(Halt::Diverged(report)) = self.iterate()? {
                return Ok(report);
            }
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn reference_mut(&mut self) -> &mut R {
        &mut self.reference
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        engine::{Interrupt, NullDebugger},
        mock::{program, MockBug, MockPrimary, MockReference},
        registers::{RegisterId, FLAG_AUX_CARRY},
        udmask::{NoUndefinedFlags, X86UndefinedFlags},
    };

    const CODE: u32 = 0x0804_8000;
    const DATA: u32 = 0x0805_0000;
    const STACK: u32 = 0xBFFF_F000;

    type Session<O, D> = LockstepSession<MockPrimary, MockReference, O, D>;

    fn session<O, D>(primary: MockPrimary, oracle: O, debugger: D) -> Session<O, D>
    where
        O: UndefinedFlagOracle<MockPrimary>,
        D: DebuggerHook,
    {
        Session::start(primary, oracle, debugger, SessionOptions::default()).unwrap()
    }

    fn mov_ebx_inc_eax() -> Vec<u8> {
        // MOV EBX, 1234h; INC EAX; NOP
        vec![0xBB, 0x34, 0x12, 0x00, 0x00, 0x40, 0x90]
    }

    #[test]
    fn divergence_restores_last_good_state() {
        let primary = program(CODE, &mov_ebx_inc_eax(), DATA, STACK).with_bug(MockBug::IncSignOverflow);
        let traps = Cell::new(0);
        let mut s = session(primary, NoUndefinedFlags, || traps.set(traps.get() + 1));

        let report = s.run().unwrap();
        assert_eq!(report.divergence.field, RegisterId::Eflags);
        assert_eq!(report.instruction_count, 2);
        assert_eq!(report.last_good_eip, CODE + 5);

        // State before INC: EBX already loaded, EAX untouched.
        let regs = s.primary().registers();
        assert_eq!(regs.eip, CODE + 5);
        assert_eq!(regs.ebx, 0x1234);
        assert_eq!(regs.eax, 0);

        // Once by the detector, once after the restore.
        assert_eq!(traps.get(), 2);
    }

    #[test]
    fn halted_session_does_not_step() {
        let primary = program(CODE, &mov_ebx_inc_eax(), DATA, STACK).with_bug(MockBug::IncSignOverflow);
        let mut s = session(primary, NoUndefinedFlags, NullDebugger);
        let report = s.run().unwrap();

        let executed = s.reference_mut().executed();
        for _ in 0..3 {
            assert_eq!(s.iterate().unwrap(), SessionState::Halted(Halt::Diverged(report)));
        }
        assert_eq!(s.reference_mut().executed(), executed);
        assert_eq!(s.instruction_count(), report.instruction_count);
        assert_eq!(s.primary().registers().eip, CODE + 5);
    }

    #[test]
    fn runs_are_deterministic() {
        let run = || {
            let primary = program(CODE, &mov_ebx_inc_eax(), DATA, STACK).with_bug(MockBug::IncSignOverflow);
            session(primary, NoUndefinedFlags, NullDebugger).run().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn registers_not_copied_at_startup_are_caught_first() {
        let mut primary = program(CODE, &[0x90], DATA, STACK);
        primary.regs.eax = 0xDEAD_BEEF;
        let report = session(primary, NoUndefinedFlags, NullDebugger).run().unwrap();

        assert_eq!(report.instruction_count, 0);
        assert_eq!(report.last_good_eip, CODE);
        assert_eq!(report.divergence.field, RegisterId::Eax);
        assert_eq!(report.divergence.primary, 0xDEAD_BEEF);
    }

    fn and_program() -> Vec<u8> {
        // MOV EAX, 0Fh; ADD EAX, 1 (sets AF); AND EAX, EAX; NOP
        vec![
            0xB8, 0x0F, 0x00, 0x00, 0x00, //
            0x05, 0x01, 0x00, 0x00, 0x00, //
            0x21, 0xC0, //
            0x90,
        ]
    }

    #[test]
    fn built_in_oracle_masks_undefined_aux_carry() {
        let primary = program(CODE, &and_program(), DATA, STACK).with_bug(MockBug::AndKeepsAux);
        let mut s = session(primary, X86UndefinedFlags, NullDebugger);

        for _ in 0..4 {
            assert_eq!(s.iterate().unwrap(), SessionState::Running);
        }
        assert_eq!(s.instruction_count(), 4);
        assert_eq!(s.primary().registers().eax, 0x10);
    }

    #[test]
    fn undefined_mask_applies_to_one_instruction_only() {
        // AND leaves AF undefined; the NOP that follows must compare it again.
        let mut code = and_program();
        code.push(0x90);
        let primary = program(CODE, &code, DATA, STACK).with_bug(MockBug::AndKeepsAux);

        let calls = Cell::new(0);
        let oracle = |p: &MockPrimary| {
            calls.set(calls.get() + 1);
            X86UndefinedFlags.undefined_flags(p)
        };
        let report = session(primary, oracle, NullDebugger).run().unwrap();

        assert_eq!(report.divergence.field, RegisterId::Eflags);
        assert_eq!(report.divergence.primary ^ report.divergence.reference, FLAG_AUX_CARRY);
        assert_eq!(report.instruction_count, 4);
        assert_eq!(report.last_good_eip, CODE + 12);
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn disabling_the_mask_exposes_aux_carry() {
        let primary = program(CODE, &and_program(), DATA, STACK).with_bug(MockBug::AndKeepsAux);
        let options = SessionOptions {
            mask_flags: false,
            ..Default::default()
        };
        let mut s: Session<_, _> = Session::start(primary, X86UndefinedFlags, NullDebugger, options).unwrap();

        let report = s.run().unwrap();
        assert_eq!(report.divergence.field, RegisterId::Eflags);
        assert_eq!(report.divergence.primary ^ report.divergence.reference, FLAG_AUX_CARRY);
        assert_eq!(report.last_good_eip, CODE + 10);
    }

    #[test]
    fn static_ignore_mask_hides_aux_carry() {
        let primary = program(CODE, &and_program(), DATA, STACK).with_bug(MockBug::AndKeepsAux);
        let options = SessionOptions {
            mask_flags: false,
            ignore_flags: FLAG_AUX_CARRY,
            ..Default::default()
        };
        let mut s: Session<_, _> = Session::start(primary, NoUndefinedFlags, NullDebugger, options).unwrap();
        for _ in 0..4 {
            assert_eq!(s.iterate().unwrap(), SessionState::Running);
        }
    }

    #[test]
    fn dropped_store_goes_unnoticed_until_read_back() {
        // MOV EAX, 55h; MOV [DATA], EAX; NOP; MOV EAX, [DATA]; NOP
        let mut code = vec![0xB8, 0x55, 0x00, 0x00, 0x00, 0xA3];
        code.extend_from_slice(&DATA.to_le_bytes());
        code.push(0x90);
        code.push(0xA1);
        code.extend_from_slice(&DATA.to_le_bytes());
        code.push(0x90);

        let primary = program(CODE, &code, DATA, STACK).with_bug(MockBug::StoreDropped);
        let mut s = session(primary, NoUndefinedFlags, NullDebugger);

        // Memory is not compared: the lost store is invisible while only registers agree.
        for _ in 0..3 {
            assert_eq!(s.iterate().unwrap(), SessionState::Running);
        }

        let report = s.run().unwrap();
        assert_eq!(report.divergence.field, RegisterId::Eax);
        assert_eq!(report.divergence.reference, 0x55);
        assert_eq!(report.divergence.primary, 0);
        assert_eq!(report.instruction_count, 4);
        assert_eq!(report.last_good_eip, CODE + 11);
    }

    #[test]
    fn interrupts_are_forwarded_to_primary() {
        // MOV EAX, 4; INT 80h; NOP
        let code = [0xB8, 0x04, 0x00, 0x00, 0x00, 0xCD, 0x80, 0x90];
        let mut s = session(program(CODE, &code, DATA, STACK), X86UndefinedFlags, NullDebugger);

        for _ in 0..3 {
            assert_eq!(s.iterate().unwrap(), SessionState::Running);
        }
        assert_eq!(s.primary().handled(), &[Interrupt::SYSCALL]);
        assert_eq!(s.primary().trapno(), Some(Interrupt::SYSCALL));
        assert_eq!(s.primary().registers().eax, 0);
        assert_eq!(s.reference_mut().executed(), 3);
    }

    #[test]
    fn reference_failure_is_fatal() {
        // UD2
        let mut s = session(program(CODE, &[0x0F, 0x0B], DATA, STACK), X86UndefinedFlags, NullDebugger);
        let err = s.run().unwrap_err();
        assert_eq!(err.call(), Some("emu_start"));
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn trace_records_steps_and_mismatch() {
        let path = std::env::temp_dir().join(format!("lockstep_trace_{}.log", std::process::id()));
        let primary = program(CODE, &mov_ebx_inc_eax(), DATA, STACK).with_bug(MockBug::IncSignOverflow);
        let options = SessionOptions {
            trace: TraceLogger::from_filename(&path),
            ..Default::default()
        };
        let mut s: Session<_, _> = Session::start(primary, NoUndefinedFlags, NullDebugger, options).unwrap();
        s.run().unwrap();
        drop(s);

        let text = std::fs::read_to_string(&path).unwrap();
        _ = std::fs::remove_file(&path);
        assert_eq!(text.lines().filter(|l| l.contains("EIP:")).count(), 4);
        assert!(text.contains("MISMATCH eflags: reference 0x"));
    }
}
