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

    unicorn.rs

*/

//! Reference engine backed by the Unicorn CPU emulator.

use std::{error::Error, fmt};

use unicorn_engine::{
    unicorn_const::{uc_error, Arch, Mode, Permission},
    RegisterX86,
    Unicorn,
};

use crate::{engine::ReferenceEngine, registers::RegisterId};

/// Unicorn's error code. `uc_error` doesn't implement `std::error::Error`, so it is wrapped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnicornError(pub uc_error);

impl Error for UnicornError {}
impl fmt::Display for UnicornError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unicorn error {:?}", self.0)
    }
}

impl From<uc_error> for UnicornError {
    fn from(e: uc_error) -> Self {
        UnicornError(e)
    }
}

fn x86_register(id: RegisterId) -> RegisterX86 {
    match id {
        RegisterId::Eax => RegisterX86::EAX,
        RegisterId::Ebx => RegisterX86::EBX,
        RegisterId::Ecx => RegisterX86::ECX,
        RegisterId::Edx => RegisterX86::EDX,
        RegisterId::Esi => RegisterX86::ESI,
        RegisterId::Edi => RegisterX86::EDI,
        RegisterId::Ebp => RegisterX86::EBP,
        RegisterId::Esp => RegisterX86::ESP,
        RegisterId::Eip => RegisterX86::EIP,
        RegisterId::Eflags => RegisterX86::EFLAGS,
    }
}

/// An X86 Unicorn instance in 32-bit mode.
pub struct UnicornEngine {
    uc: Unicorn<'static, ()>,
}

impl ReferenceEngine for UnicornEngine {
    type Error = UnicornError;

    fn open() -> Result<Self, UnicornError> {
        let uc = Unicorn::new(Arch::X86, Mode::MODE_32)?;
        Ok(Self { uc })
    }

    fn reg_read_batch(&mut self, ids: &[RegisterId], values: &mut [u32]) -> Result<(), UnicornError> {
        // The binding has no batched read. Nothing runs between these reads, so the values are
        // still taken from a single point in execution.
        for (id, value) in ids.iter().zip(values.iter_mut()) {
            *value = self.uc.reg_read(x86_register(*id))? as u32;
        }
        Ok(())
    }

    fn reg_write(&mut self, id: RegisterId, value: u32) -> Result<(), UnicornError> {
        self.uc.reg_write(x86_register(id), value as u64)?;
        Ok(())
    }

    fn mem_map(&mut self, addr: u32, size: usize, prot: u32) -> Result<(), UnicornError> {
        // Protection bits share Unicorn's UC_PROT_* layout.
        self.uc
            .mem_map(addr as u64, size, Permission::from_bits_truncate(prot))?;
        Ok(())
    }

    fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), UnicornError> {
        self.uc.mem_write(addr as u64, data)?;
        Ok(())
    }

    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), UnicornError> {
        self.uc.mem_read(addr as u64, buf)?;
        Ok(())
    }

    fn emu_start(&mut self, begin: u32, until: u64, timeout: u64, count: usize) -> Result<(), UnicornError> {
        self.uc.emu_start(begin as u64, until, timeout, count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PROT_EXEC, PROT_READ, PROT_WRITE};

    #[test]
    fn protection_bits_match_unicorn() {
        assert_eq!(Permission::READ.bits(), PROT_READ);
        assert_eq!(Permission::WRITE.bits(), PROT_WRITE);
        assert_eq!(Permission::EXEC.bits(), PROT_EXEC);
    }

    #[test]
    fn single_step_inc() {
        let mut uc = UnicornEngine::open().unwrap();
        uc.mem_map(0x1000, 0x1000, PROT_READ | PROT_EXEC).unwrap();
        // INC EAX; INC EAX
        uc.mem_write(0x1000, &[0x40, 0x40]).unwrap();
        uc.reg_write(RegisterId::Eip, 0x1000).unwrap();

        uc.emu_start(0x1000, u64::MAX, 0, 1).unwrap();
        assert_eq!(uc.reg_read(RegisterId::Eax).unwrap(), 1);
        assert_eq!(uc.reg_read(RegisterId::Eip).unwrap(), 0x1001);
    }
}
