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

    engine.rs

*/

//! Interfaces to the two engines and the debugger.
//!
//! Neither engine knows about the other. The session holds one of each and moves state between them
//! by value only.

use std::{error::Error, fmt};

use crate::{
    memory::PagedMemory,
    registers::{RegisterId, Registers},
};

/// An interrupt or trap raised by the primary engine while executing an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Interrupt(pub u8);

impl Interrupt {
    pub const UNDEFINED: Interrupt = Interrupt(6);
    pub const PAGE_FAULT: Interrupt = Interrupt(14);
    pub const SYSCALL: Interrupt = Interrupt(0x80);
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INT {:02X}h", self.0)
    }
}

/// The emulator under test.
pub trait PrimaryEngine {
    /// Complete saved CPU state, used to rewind to the last known good instruction.
    type State: Clone;
    type Memory: PagedMemory;

    /// Architectural registers. The flags word is only meaningful after [`collapse_flags`].
    ///
    /// [`collapse_flags`]: PrimaryEngine::collapse_flags
    fn registers(&self) -> Registers;
    fn save_state(&self) -> Self::State;
    fn restore_state(&mut self, state: &Self::State);

    /// Fold any lazily tracked flag state into the architectural flags word.
    fn collapse_flags(&mut self);

    fn memory(&self) -> &Self::Memory;

    /// Execute exactly one instruction.
    fn step(&mut self) -> Option<Interrupt>;
    fn set_trapno(&mut self, interrupt: Interrupt);
    fn handle_interrupt(&mut self, interrupt: Interrupt);

    /// Drop every cached address translation.
    fn flush_tlb(&mut self);
}

/// The trusted CPU implementation used as ground truth.
///
/// Every call may fail; the validator treats any failure as fatal.
pub trait ReferenceEngine: Sized {
    type Error: Error + Send + Sync + 'static;

    /// Construct a fresh 32-bit x86 instance with an empty address space.
    fn open() -> Result<Self, Self::Error>;

    /// Read `ids[n]` into `values[n]` for every n, in one call.
    fn reg_read_batch(&mut self, ids: &[RegisterId], values: &mut [u32]) -> Result<(), Self::Error>;

    fn reg_read(&mut self, id: RegisterId) -> Result<u32, Self::Error> {
        let mut value = [0u32; 1];
        self.reg_read_batch(&[id], &mut value)?;
        Ok(value[0])
    }

    fn reg_write(&mut self, id: RegisterId, value: u32) -> Result<(), Self::Error>;

    /// Map `size` bytes at `addr` with `PROT_*` protection bits.
    fn mem_map(&mut self, addr: u32, size: usize, prot: u32) -> Result<(), Self::Error>;
    fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;
    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Start executing at `begin`, stopping at `until` (any value above `u32::MAX` for none), after `timeout` microseconds (0 for none) or
    /// after `count` instructions (0 for no limit), whichever comes first.
    fn emu_start(&mut self, begin: u32, until: u64, timeout: u64, count: usize) -> Result<(), Self::Error>;
}

/// Called at the point of divergence. Intended to hand control to an interactive debugger.
pub trait DebuggerHook {
    fn trap(&mut self);
}

impl<F> DebuggerHook for F
where
    F: FnMut(),
{
    fn trap(&mut self) {
        self()
    }
}

/// A debugger hook that does nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullDebugger;

impl DebuggerHook for NullDebugger {
    fn trap(&mut self) {}
}
