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

    stepper.rs

    Advances both engines by a single instruction.

*/

use crate::{
    engine::{Interrupt, PrimaryEngine, ReferenceEngine},
    error::{LockstepError, TryCall},
    memory::PagedMemory,
    registers::RegisterId,
};

/// What happened on the primary side of a lockstep step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StepEvent {
    pub interrupt:   Option<Interrupt>,
    pub tlb_flushed: bool,
}

/// Advance both engines by exactly one instruction.
pub fn step_lockstep<P, R>(primary: &mut P, reference: &mut R) -> Result<StepEvent, LockstepError>
where
    P: PrimaryEngine,
    R: ReferenceEngine,
{
    let mut event = StepEvent::default();

    let changes = primary.memory().changes();
    if let Some(interrupt) = primary.step() {
        log::trace!("Primary engine raised {}", interrupt);
        primary.set_trapno(interrupt);
        primary.handle_interrupt(interrupt);
        event.interrupt = Some(interrupt);
    }
    if primary.memory().changes() != changes {
        primary.flush_tlb();
        event.tlb_flushed = true;
    }

    let eip = reference.reg_read(RegisterId::Eip).trycall("reg_read eip")?;
    // No end address and no timeout; the instruction count alone stops the engine.
    reference.emu_start(eip, u64::MAX, 0, 1).trycall("emu_start")?;

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{ProtMapping, PAGE_SIZE, P_READ, P_WRITE},
        mock::{MockPrimary, MockReference},
        snapshot::start_reference,
    };

    const CODE: u32 = 0x0040_0000;
    const DATA: u32 = 0x0060_0000;

    fn pair(code: &[u8]) -> (MockPrimary, MockReference) {
        let mut primary = MockPrimary::new(CODE, 0x0080_0000);
        primary.map_page(CODE, P_READ, Some(code));
        primary.map_page(DATA, P_READ | P_WRITE, Some(&[]));
        let reference = start_reference(&primary, ProtMapping::ReadImpliesExec).unwrap();
        (primary, reference)
    }

    #[test]
    fn both_engines_advance_one_instruction() {
        // INC EAX; INC EAX
        let (mut primary, mut reference) = pair(&[0x40, 0x40]);

        let event = step_lockstep(&mut primary, &mut reference).unwrap();
        assert_eq!(event, StepEvent::default());
        assert_eq!(primary.registers().eip, CODE + 1);
        assert_eq!(primary.registers().eax, 1);
        assert_eq!(reference.reg_read(RegisterId::Eip).unwrap(), CODE + 1);
        assert_eq!(reference.reg_read(RegisterId::Eax).unwrap(), 1);
        assert_eq!(reference.executed(), 1);
    }

    #[test]
    fn last_address_of_the_address_space_executes() {
        // NOP in the final byte before EIP wraps to zero.
        const TOP: u32 = 0xFFFF_F000;
        let mut primary = MockPrimary::new(0xFFFF_FFFF, 0x0080_0000);
        primary.map_page(TOP, P_READ, Some(&[0x90; PAGE_SIZE]));
        let mut reference: MockReference = start_reference(&primary, ProtMapping::ReadImpliesExec).unwrap();

        step_lockstep(&mut primary, &mut reference).unwrap();
        assert_eq!(reference.executed(), 1);
        assert_eq!(reference.reg_read(RegisterId::Eip).unwrap(), 0);
        assert_eq!(primary.registers().eip, 0);
    }

    #[test]
    fn memory_write_flushes_tlb() {
        // MOV [DATA], EAX; NOP
        let mut code = vec![0xA3];
        code.extend_from_slice(&DATA.to_le_bytes());
        code.push(0x90);
        let (mut primary, mut reference) = pair(&code);

        let event = step_lockstep(&mut primary, &mut reference).unwrap();
        assert!(event.tlb_flushed);
        assert_eq!(primary.tlb_flushes(), 1);

        let event = step_lockstep(&mut primary, &mut reference).unwrap();
        assert!(!event.tlb_flushed);
        assert_eq!(primary.tlb_flushes(), 1);
    }

    #[test]
    fn interrupt_is_recorded_and_dispatched() {
        // INT 80h
        let (mut primary, mut reference) = pair(&[0xCD, 0x80]);

        let event = step_lockstep(&mut primary, &mut reference).unwrap();
        assert_eq!(event.interrupt, Some(Interrupt::SYSCALL));
        assert_eq!(primary.trapno(), Some(Interrupt::SYSCALL));
        assert_eq!(primary.handled(), &[Interrupt::SYSCALL]);
    }

    #[test]
    fn reference_failure_is_fatal() {
        // Undefined on the mock; the reference engine refuses to run it.
        let (mut primary, mut reference) = pair(&[0x0F, 0x0B]);

        let err = step_lockstep(&mut primary, &mut reference).unwrap_err();
        assert_eq!(err.call(), Some("emu_start"));
    }
}
