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

    snapshot.rs

    Builds a reference engine from a snapshot of the primary engine.

*/

use crate::{
    engine::{PrimaryEngine, ReferenceEngine},
    error::{LockstepError, TryCall},
    memory::{page_addr, PagedMemory, ProtMapping, PAGE_SIZE},
    registers::RegisterId,
};

/// Registers copied into the reference engine at startup. The rest are checked, not copied: the
/// first comparison catches any register the two engines disagree on from the outset.
pub const SNAPSHOT_REGISTERS: [RegisterId; 2] = [RegisterId::Esp, RegisterId::Eip];

/// Open a reference engine and make it a copy of `primary`.
///
/// Only pages with backing data are transferred. A page the primary engine has not faulted in must
/// stay unmapped in the reference engine as well, or the two would disagree about page faults.
pub fn start_reference<R, P>(primary: &P, mapping: ProtMapping) -> Result<R, LockstepError>
where
    R: ReferenceEngine,
    P: PrimaryEngine,
{
    let mut reference = R::open().trycall("open")?;

    let regs = primary.registers();
    for id in SNAPSHOT_REGISTERS {
        reference.reg_write(id, regs.get(id)).trycall("reg_write")?;
    }

    let mem = primary.memory();
    let mut transferred = 0usize;
    for page in 0..mem.page_count() {
        let Some(entry) = mem.page(page)
        else {
            continue;
        };
        let Some(data) = entry.data
        else {
            continue;
        };

        let addr = page_addr(page);
        let Some(data) = data.get(..PAGE_SIZE)
        else {
            return Err(LockstepError::ShortPage { addr, len: data.len() });
        };
        reference
            .mem_map(addr, PAGE_SIZE, mapping.protection(entry.flags))
            .trycall("mem_map")?;
        reference.mem_write(addr, data).trycall("mem_write")?;
        transferred += 1;
    }

    log::debug!(
        "Reference engine initialized: {} pages transferred, ESP: {:08X} EIP: {:08X}",
        transferred,
        regs.esp,
        regs.eip
    );
    Ok(reference)
}
