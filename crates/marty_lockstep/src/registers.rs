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

    registers.rs

    Register file shared by the primary and reference engines, and EFLAGS bit
    definitions.

*/

use std::fmt::{self, Display};

use strum_macros::{Display, EnumIter, IntoStaticStr};

pub const FLAG_CARRY: u32 = 0b0000_0000_0000_0001;
pub const FLAG_RESERVED_ON: u32 = 0b0000_0000_0000_0010;
pub const FLAG_PARITY: u32 = 0b0000_0000_0000_0100;
pub const FLAG_AUX_CARRY: u32 = 0b0000_0000_0001_0000;
pub const FLAG_ZERO: u32 = 0b0000_0000_0100_0000;
pub const FLAG_SIGN: u32 = 0b0000_0000_1000_0000;
pub const FLAG_TRAP: u32 = 0b0000_0001_0000_0000;
pub const FLAG_INT_ENABLE: u32 = 0b0000_0010_0000_0000;
pub const FLAG_DIRECTION: u32 = 0b0000_0100_0000_0000;
pub const FLAG_OVERFLOW: u32 = 0b0000_1000_0000_0000;

/// The six arithmetic status flags.
pub const FLAGS_STATUS: u32 = FLAG_CARRY | FLAG_PARITY | FLAG_AUX_CARRY | FLAG_ZERO | FLAG_SIGN | FLAG_OVERFLOW;

const FLAG_NAMES: [(u32, &str); 9] = [
    (FLAG_CARRY, "CARRY"),
    (FLAG_PARITY, "PARITY"),
    (FLAG_AUX_CARRY, "AUX CARRY"),
    (FLAG_ZERO, "ZERO"),
    (FLAG_SIGN, "SIGN"),
    (FLAG_TRAP, "TRAP"),
    (FLAG_INT_ENABLE, "INT"),
    (FLAG_DIRECTION, "DIRECTION"),
    (FLAG_OVERFLOW, "OVERFLOW"),
];

/// Named 32-bit architectural registers shared by both engines.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, EnumIter, IntoStaticStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RegisterId {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
    Eflags,
}

impl RegisterId {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Registers fetched from the reference engine in a single batched read, so every value comes from
/// the same point in execution.
pub const REFERENCE_BATCH: [RegisterId; 10] = [
    RegisterId::Eax,
    RegisterId::Ebx,
    RegisterId::Ecx,
    RegisterId::Edx,
    RegisterId::Esi,
    RegisterId::Edi,
    RegisterId::Ebp,
    RegisterId::Esp,
    RegisterId::Eip,
    RegisterId::Eflags,
];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
}

impl Registers {
    #[inline]
    pub fn get(&self, id: RegisterId) -> u32 {
        match id {
            RegisterId::Eax => self.eax,
            RegisterId::Ebx => self.ebx,
            RegisterId::Ecx => self.ecx,
            RegisterId::Edx => self.edx,
            RegisterId::Esi => self.esi,
            RegisterId::Edi => self.edi,
            RegisterId::Ebp => self.ebp,
            RegisterId::Esp => self.esp,
            RegisterId::Eip => self.eip,
            RegisterId::Eflags => self.eflags,
        }
    }

    #[inline]
    pub fn set(&mut self, id: RegisterId, value: u32) {
        match id {
            RegisterId::Eax => self.eax = value,
            RegisterId::Ebx => self.ebx = value,
            RegisterId::Ecx => self.ecx = value,
            RegisterId::Edx => self.edx = value,
            RegisterId::Esi => self.esi = value,
            RegisterId::Edi => self.edi = value,
            RegisterId::Ebp => self.ebp = value,
            RegisterId::Esp => self.esp = value,
            RegisterId::Eip => self.eip = value,
            RegisterId::Eflags => self.eflags = value,
        }
    }

    /// Build a register set from the values of a batched read. `values[n]` belongs to `ids[n]`;
    /// registers not named in `ids` stay zero.
    pub fn from_batch(ids: &[RegisterId], values: &[u32]) -> Registers {
        let mut regs = Registers::default();
        for (id, value) in ids.iter().zip(values) {
            regs.set(*id, *value);
        }
        regs
    }
}

impl Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EAX: {:08X} EBX: {:08X} ECX: {:08X} EDX: {:08X} ESI: {:08X} EDI: {:08X} EBP: {:08X} ESP: {:08X} EIP: {:08X} FLAGS: {:08X}",
            self.eax, self.ebx, self.ecx, self.edx, self.esi, self.edi, self.ebp, self.esp, self.eip, self.eflags
        )
    }
}

/// Names of the flags that differ between two flag words, for divergence reports.
pub fn describe_flag_diff(a: u32, b: u32) -> Vec<&'static str> {
    let diff = a ^ b;
    FLAG_NAMES
        .iter()
        .filter(|(bit, _)| diff & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}
