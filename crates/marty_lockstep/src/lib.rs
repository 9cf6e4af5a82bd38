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
*/

//! Lockstep CPU validation.
//!
//! A primary emulator (the one under test) and a reference CPU engine are stepped through the same
//! instruction stream one instruction at a time. After every instruction the architectural register
//! state of both is compared, ignoring status flags the retired instruction leaves undefined. The
//! first mismatch halts the session with the primary engine restored to the state it had before the
//! faulting instruction, so it can be inspected in a debugger.
//!
//! Features:
//! - `unicorn`: a [`ReferenceEngine`](engine::ReferenceEngine) backed by the Unicorn CPU emulator.
//! - `mock`: small deterministic engines used by tests and benchmarks.

#![forbid(unsafe_code)]

pub mod compare;
pub mod dump;
pub mod engine;
pub mod error;
pub mod memory;
pub mod registers;
pub mod session;
pub mod snapshot;
pub mod stepper;
pub mod tracelogger;
pub mod udmask;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "unicorn")]
pub mod unicorn;

pub use compare::{Divergence, Verdict};
pub use engine::{DebuggerHook, Interrupt, NullDebugger, PrimaryEngine, ReferenceEngine};
pub use error::LockstepError;
pub use registers::{RegisterId, Registers};
pub use session::{Halt, LockstepSession, SessionOptions, SessionState};
pub use udmask::{NoUndefinedFlags, UndefinedFlagOracle, X86UndefinedFlags};
