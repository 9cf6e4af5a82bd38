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

    compare.rs

    Register comparison between the primary and reference engines.

*/

use std::fmt;

use crate::{
    engine::{DebuggerHook, PrimaryEngine, ReferenceEngine},
    error::{LockstepError, TryCall},
    registers::{describe_flag_diff, RegisterId, Registers, REFERENCE_BATCH},
    tracelogger::TraceLogger,
};

/// One entry of the comparison order.
#[derive(Copy, Clone, Debug)]
pub struct FieldCheck {
    pub id:     RegisterId,
    /// Compare under the undefined flag mask.
    pub masked: bool,
}

/// Fields are compared in this order and the first mismatch wins. EIP goes first: once control flow
/// differs, every other disagreement is noise.
pub const COMPARE_ORDER: [FieldCheck; 10] = [
    FieldCheck { id: RegisterId::Eip, masked: false },
    FieldCheck { id: RegisterId::Eax, masked: false },
    FieldCheck { id: RegisterId::Ebx, masked: false },
    FieldCheck { id: RegisterId::Ecx, masked: false },
    FieldCheck { id: RegisterId::Edx, masked: false },
    FieldCheck { id: RegisterId::Esi, masked: false },
    FieldCheck { id: RegisterId::Edi, masked: false },
    FieldCheck { id: RegisterId::Esp, masked: false },
    FieldCheck { id: RegisterId::Ebp, masked: false },
    FieldCheck { id: RegisterId::Eflags, masked: true },
];

/// The first field the two engines disagree on. For a masked field, both values are shown with
/// the mask already applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub field:     RegisterId,
    pub reference: u32,
    pub primary:   u32,
    /// Bits excluded from the comparison.
    pub mask:      u32,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: reference 0x{:x}, primary 0x{:x}",
            self.field, self.reference, self.primary
        )?;
        if self.field == RegisterId::Eflags {
            write!(
                f,
                " (differs: {}; masked: 0x{:x})",
                describe_flag_diff(self.reference, self.primary).join(", "),
                self.mask
            )?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Diverged(Divergence),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }
}

/// Compare the two register sets field by field in [`COMPARE_ORDER`].
pub fn first_divergence(primary: &Registers, reference: &Registers, flag_mask: u32) -> Option<Divergence> {
    COMPARE_ORDER.iter().find_map(|check| {
        let mask = if check.masked { flag_mask } else { 0 };
        let p = primary.get(check.id) & !mask;
        let r = reference.get(check.id) & !mask;
        if p != r {
            Some(Divergence {
                field: check.id,
                reference: r,
                primary: p,
                mask,
            })
        }
        else {
            None
        }
    })
}

/// Compare the current architectural state of both engines.
///
/// The reference registers are fetched with a single batched read; the primary engine's lazily
/// held flags are collapsed before its registers are taken. `undefined_flags` comes from the
/// oracle for the instruction that just retired and `ignore_flags` is a static mask applied on
/// top of it. On a mismatch the diagnostic is logged and written to `trace`, and the debugger
/// hook is called before returning.
pub fn compare_cpus<P, R, D>(
    primary: &mut P,
    reference: &mut R,
    undefined_flags: u32,
    ignore_flags: u32,
    debugger: &mut D,
    trace: &mut TraceLogger,
) -> Result<Verdict, LockstepError>
where
    P: PrimaryEngine,
    R: ReferenceEngine,
    D: DebuggerHook + ?Sized,
{
    let mut values = [0u32; REFERENCE_BATCH.len()];
    reference
        .reg_read_batch(&REFERENCE_BATCH, &mut values)
        .trycall("reg_read_batch")?;
    let ref_regs = Registers::from_batch(&REFERENCE_BATCH, &values);

    primary.collapse_flags();
    let cpu_regs = primary.registers();

    match first_divergence(&cpu_regs, &ref_regs, undefined_flags | ignore_flags) {
        None => Ok(Verdict::Match),
        Some(divergence) => {
            log::error!("Register mismatch! {}", divergence);
            trace.println(format!("MISMATCH {}", divergence));
            trace.println(format!("  reference {}", ref_regs));
            trace.println(format!("  primary   {}", cpu_regs));
            debugger.trap();
            Ok(Verdict::Diverged(divergence))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::NullDebugger,
        memory::ProtMapping,
        mock::{program, MockBug, MockPrimary, MockReference},
        registers::*,
        snapshot::start_reference,
        stepper::step_lockstep,
    };

    const CODE: u32 = 0x0040_0000;
    const DATA: u32 = 0x0041_0000;
    const STACK: u32 = 0x0080_0000;

    fn pair(primary: MockPrimary) -> (MockPrimary, MockReference) {
        let reference = start_reference(&primary, ProtMapping::ReadImpliesExec).unwrap();
        (primary, reference)
    }

    fn compare(primary: &mut MockPrimary, reference: &mut MockReference, mask: u32) -> Verdict {
        compare_cpus(primary, reference, mask, 0, &mut NullDebugger, &mut TraceLogger::None).unwrap()
    }

    #[test]
    fn order_starts_with_eip_and_masks_only_flags() {
        assert_eq!(COMPARE_ORDER[0].id, RegisterId::Eip);
        assert_eq!(COMPARE_ORDER.len(), REFERENCE_BATCH.len());
        for check in COMPARE_ORDER {
            assert_eq!(check.masked, check.id == RegisterId::Eflags, "{}", check.id);
        }
    }

    #[test]
    fn masked_bits_never_cause_a_mismatch() {
        let a = Registers {
            eflags: FLAG_RESERVED_ON | FLAG_AUX_CARRY,
            ..Default::default()
        };
        let b = Registers {
            eflags: FLAG_RESERVED_ON,
            ..Default::default()
        };
        assert_eq!(first_divergence(&a, &b, FLAG_AUX_CARRY), None);

        let d = first_divergence(&a, &b, FLAG_CARRY).unwrap();
        assert_eq!(d.field, RegisterId::Eflags);
        assert_eq!(d.primary, FLAG_RESERVED_ON | FLAG_AUX_CARRY);
        assert_eq!(d.reference, FLAG_RESERVED_ON);
    }

    #[test]
    fn mask_does_not_apply_to_general_registers() {
        let a = Registers { eax: 1, ..Default::default() };
        let b = Registers::default();
        let d = first_divergence(&a, &b, 0xFFFF_FFFF).unwrap();
        assert_eq!(d.field, RegisterId::Eax);
        assert_eq!(d.mask, 0);
    }

    #[test]
    fn first_mismatch_wins() {
        let (mut primary, mut reference) = pair(program(CODE, &[0x90], DATA, STACK));
        primary.regs.ebx = 0x1111;
        primary.regs.esi = 0x2222;

        let mut traps = 0;
        let mut debugger = || traps += 1;
        let verdict =
            compare_cpus(&mut primary, &mut reference, 0, 0, &mut debugger, &mut TraceLogger::None).unwrap();

        let Verdict::Diverged(d) = verdict
        else {
            panic!("expected divergence, got {:?}", verdict);
        };
        assert_eq!(d.field, RegisterId::Ebx);
        assert_eq!(d.reference, 0);
        assert_eq!(d.primary, 0x1111);
        assert_eq!(traps, 1);
    }

    #[test]
    fn matching_engines_do_not_trap() {
        let (mut primary, mut reference) = pair(program(CODE, &[0x40], DATA, STACK));
        step_lockstep(&mut primary, &mut reference).unwrap();

        let mut traps = 0;
        let mut debugger = || traps += 1;
        let verdict =
            compare_cpus(&mut primary, &mut reference, 0, 0, &mut debugger, &mut TraceLogger::None).unwrap();
        assert!(verdict.is_match());
        assert_eq!(traps, 0);
    }

    #[test]
    fn flags_are_collapsed_before_comparison() {
        // ADD EAX, 1; the primary holds the result flags unpacked until asked.
        let mut code = vec![0x05];
        code.extend_from_slice(&1u32.to_le_bytes());
        let (mut primary, mut reference) = pair(program(CODE, &code, DATA, STACK));
        step_lockstep(&mut primary, &mut reference).unwrap();

        let collapses = primary.collapses();
        assert!(compare(&mut primary, &mut reference, 0).is_match());
        assert_eq!(primary.collapses(), collapses + 1);
    }

    #[test]
    fn inc_overflow_is_hidden_by_oracle_mask() {
        // INC EAX from 0x7FFFFFFF with SF and OF computed wrong by the primary.
        let primary = program(CODE, &[0x40], DATA, STACK).with_bug(MockBug::IncSignOverflow);
        let (mut primary, mut reference) = pair(primary);
        primary.regs.eax = 0x7FFF_FFFF;
        reference.reg_write(RegisterId::Eax, 0x7FFF_FFFF).unwrap();

        step_lockstep(&mut primary, &mut reference).unwrap();
        assert_eq!(primary.registers().eax, 0x8000_0000);

        // Claimed undefined: no divergence.
        let mut oracle = |_: &MockPrimary| FLAG_OVERFLOW | FLAG_SIGN;
        let mask = crate::udmask::UndefinedFlagOracle::undefined_flags(&mut oracle, &primary);
        assert!(compare(&mut primary, &mut reference, mask).is_match());

        // Without the mask the same state diverges on the flags word.
        let Verdict::Diverged(d) = compare(&mut primary, &mut reference, 0)
        else {
            panic!("expected flags divergence");
        };
        assert_eq!(d.field, RegisterId::Eflags);
        assert_eq!(d.reference ^ d.primary, FLAG_OVERFLOW | FLAG_SIGN);
    }

    #[test]
    fn stuck_carry_is_reported_on_flags() {
        // ADD EAX, 1 from 0xFFFFFFFF: CF must be set.
        let mut code = vec![0x05];
        code.extend_from_slice(&1u32.to_le_bytes());
        let primary = program(CODE, &code, DATA, STACK).with_bug(MockBug::AddCarryStuck);
        let (mut primary, mut reference) = pair(primary);
        primary.regs.eax = 0xFFFF_FFFF;
        reference.reg_write(RegisterId::Eax, 0xFFFF_FFFF).unwrap();

        step_lockstep(&mut primary, &mut reference).unwrap();

        let Verdict::Diverged(d) = compare(&mut primary, &mut reference, 0)
        else {
            panic!("expected flags divergence");
        };
        assert_eq!(d.field, RegisterId::Eflags);
        assert_eq!(d.reference & FLAG_CARRY, FLAG_CARRY);
        assert_eq!(d.primary & FLAG_CARRY, 0);

        let text = d.to_string();
        assert!(text.starts_with("eflags: reference 0x"), "{}", text);
        assert!(text.contains(&format!("0x{:x}", d.reference)));
        assert!(text.contains(&format!("primary 0x{:x}", d.primary)));
        assert!(text.contains("CARRY"));
    }

    #[test]
    fn static_ignore_mask_combines_with_oracle() {
        let (mut primary, mut reference) = pair(program(CODE, &[0x90], DATA, STACK));
        primary.set_flags(FLAG_RESERVED_ON | FLAG_PARITY | FLAG_AUX_CARRY);

        let verdict = compare_cpus(
            &mut primary,
            &mut reference,
            FLAG_PARITY,
            FLAG_AUX_CARRY,
            &mut NullDebugger,
            &mut TraceLogger::None,
        )
        .unwrap();
        assert!(verdict.is_match());
    }

    #[test]
    fn divergence_display_names_register() {
        let d = Divergence {
            field: RegisterId::Esp,
            reference: 0xbfff_f000,
            primary: 0xbfff_effc,
            mask: 0,
        };
        assert_eq!(d.to_string(), "esp: reference 0xbffff000, primary 0xbfffeffc");
    }
}
