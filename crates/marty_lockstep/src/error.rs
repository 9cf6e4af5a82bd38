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

use std::{error::Error, path::PathBuf};

use thiserror::Error;

pub type BoxedEngineError = Box<dyn Error + Send + Sync + 'static>;

/// Fatal errors. A divergence is not an error; it is reported through
/// [`Verdict`](crate::compare::Verdict) and [`Halt`](crate::session::Halt).
#[derive(Error, Debug)]
pub enum LockstepError {
    #[error("{call}: {source}")]
    Engine {
        call:   &'static str,
        #[source]
        source: BoxedEngineError,
    },
    #[error("Page at {addr:08X} has {len} bytes of backing data")]
    ShortPage { addr: u32, len: usize },
    #[error("Failed to write memory dump to {path:?}: {source}")]
    DumpIo {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockstepError {
    pub fn engine<E>(call: &'static str, err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        LockstepError::Engine {
            call,
            source: Box::new(err),
        }
    }

    /// Name of the failed engine call, if this was an engine error.
    pub fn call(&self) -> Option<&'static str> {
        match self {
            LockstepError::Engine { call, .. } => Some(call),
            _ => None,
        }
    }
}

/// Attach the name of an engine call to its error. Every reference engine call goes through this
/// so a fatal failure says exactly which call broke.
pub trait TryCall<T> {
    fn trycall(self, call: &'static str) -> Result<T, LockstepError>;
}

impl<T, E> TryCall<T> for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    #[inline]
    fn trycall(self, call: &'static str) -> Result<T, LockstepError> {
        self.map_err(|e| LockstepError::engine(call, e))
    }
}
