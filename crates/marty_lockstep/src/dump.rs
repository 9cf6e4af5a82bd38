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

    dump.rs

*/

use std::{fs::File, io::Write, path::Path};

use crate::{
    engine::ReferenceEngine,
    error::{LockstepError, TryCall},
};

/// Write `size` bytes of the reference engine's memory starting at `start` to `path`.
pub fn dump_memory<R, PA>(reference: &mut R, path: PA, start: u32, size: usize) -> Result<(), LockstepError>
where
    R: ReferenceEngine,
    PA: AsRef<Path>,
{
    let path = path.as_ref();
    let mut buf = vec![0u8; size];
    reference.mem_read(start, &mut buf).trycall("mem_read")?;

    let io_err = |source| LockstepError::DumpIo {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(&buf).map_err(io_err)?;

    log::debug!("Dumped {} bytes from {:08X} to {}", size, start, path.display());
    Ok(())
}
