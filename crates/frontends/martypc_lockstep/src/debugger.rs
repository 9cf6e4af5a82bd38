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

    debugger.rs

*/

use std::io::{self, BufRead, Write};

use colored::*;

use marty_lockstep::DebuggerHook;

/// Debugger hook for a terminal session. Announces each trap and, when pausing is enabled, waits
/// for Enter so a debugger can be attached to the process.
pub struct ConsoleDebugger {
    pause: bool,
    traps: usize,
}

impl ConsoleDebugger {
    pub fn new(pause: bool) -> Self {
        Self { pause, traps: 0 }
    }

    pub fn traps(&self) -> usize {
        self.traps
    }

    fn wait_for_enter(&self, input: &mut impl BufRead) {
        print!("Attach a debugger now, or press Enter to continue...");
        _ = io::stdout().flush();
        let mut line = String::new();
        if let Err(e) = input.read_line(&mut line) {
            log::warn!("Couldn't read from stdin: {}", e);
        }
    }
}

impl DebuggerHook for ConsoleDebugger {
    fn trap(&mut self) {
        self.traps += 1;
        let msg = match self.traps {
            1 => "registers diverged",
            _ => "emulator restored to last good state",
        };
        println!("{} {}", "Debugger trap:".yellow(), msg);
        if self.pause {
            self.wait_for_enter(&mut io::stdin().lock());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traps_are_counted() {
        let mut debugger = ConsoleDebugger::new(false);
        debugger.trap();
        debugger.trap();
        assert_eq!(debugger.traps(), 2);
    }

    #[test]
    fn pause_consumes_one_line() {
        let debugger = ConsoleDebugger::new(true);
        let mut input = io::Cursor::new(b"\nremaining\n".to_vec());
        debugger.wait_for_enter(&mut input);

        let mut rest = String::new();
        input.read_line(&mut rest).unwrap();
        assert_eq!(rest, "remaining\n");
    }
}
