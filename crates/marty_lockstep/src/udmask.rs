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

    udmask.rs

    Undefined flag masks for 32-bit x86 instructions.

*/

//! Undefined flag masks.
//!
//! After many instructions some status flags are architecturally undefined, and two correct CPU
//! implementations may leave different values in them. The mask for an instruction is computed
//! from the state *before* it executes and applied to the comparison *after* it retires.

use crate::{engine::PrimaryEngine, memory::PagedMemory, registers::*};

/// Supplies the mask of undefined flag bits for the instruction the primary engine is about to
/// execute. Called once per step; masks are never reused across steps.
pub trait UndefinedFlagOracle<P: PrimaryEngine> {
    fn undefined_flags(&mut self, primary: &P) -> u32;
}

impl<P, F> UndefinedFlagOracle<P> for F
where
    P: PrimaryEngine,
    F: FnMut(&P) -> u32,
{
    fn undefined_flags(&mut self, primary: &P) -> u32 {
        self(primary)
    }
}

/// Compare every flag bit.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoUndefinedFlags;

impl<P: PrimaryEngine> UndefinedFlagOracle<P> for NoUndefinedFlags {
    fn undefined_flags(&mut self, _primary: &P) -> u32 {
        0
    }
}

const CF: u32 = FLAG_CARRY;
const PF: u32 = FLAG_PARITY;
const AF: u32 = FLAG_AUX_CARRY;
const ZF: u32 = FLAG_ZERO;
const SF: u32 = FLAG_SIGN;
const OF: u32 = FLAG_OVERFLOW;

const MAX_INSTRUCTION_LEN: usize = 15;
const TWO_BYTE: u16 = 0x0F00;

/// Static mask for an opcode, optionally narrowed by the ModRM reg field.
pub struct FlagMask {
    /// One-byte opcode, or `0x0Fxx` for two-byte opcodes.
    pub opcode: u16,
    /// ModRM reg field, or -1 for any.
    pub ext: i8,
    pub mask: u32,
}

macro_rules! fm {
    ($op:expr, $ext:expr, $mask:expr) => {
        FlagMask {
            opcode: $op,
            ext:    $ext,
            mask:   $mask,
        }
    };
}

pub const FLAG_MASK_LOOKUP: [FlagMask; 65] = [
    // OR
    fm!(0x08, -1, AF),
    fm!(0x09, -1, AF),
    fm!(0x0A, -1, AF),
    fm!(0x0B, -1, AF),
    fm!(0x0C, -1, AF),
    fm!(0x0D, -1, AF),
    // AND
    fm!(0x20, -1, AF),
    fm!(0x21, -1, AF),
    fm!(0x22, -1, AF),
    fm!(0x23, -1, AF),
    fm!(0x24, -1, AF),
    fm!(0x25, -1, AF),
    fm!(0x27, -1, OF), // DAA
    fm!(0x2F, -1, OF), // DAS
    // XOR
    fm!(0x30, -1, AF),
    fm!(0x31, -1, AF),
    fm!(0x32, -1, AF),
    fm!(0x33, -1, AF),
    fm!(0x34, -1, AF),
    fm!(0x35, -1, AF),
    fm!(0x37, -1, PF | ZF | SF | OF), // AAA
    fm!(0x3F, -1, PF | ZF | SF | OF), // AAS
    fm!(0x69, -1, PF | AF | ZF | SF), // IMUL r, r/m, imm32
    fm!(0x6B, -1, PF | AF | ZF | SF), // IMUL r, r/m, imm8
    // Group 1 OR/AND/XOR
    fm!(0x80, 1, AF),
    fm!(0x80, 4, AF),
    fm!(0x80, 6, AF),
    fm!(0x81, 1, AF),
    fm!(0x81, 4, AF),
    fm!(0x81, 6, AF),
    fm!(0x82, 1, AF),
    fm!(0x82, 4, AF),
    fm!(0x82, 6, AF),
    fm!(0x83, 1, AF),
    fm!(0x83, 4, AF),
    fm!(0x83, 6, AF),
    // TEST
    fm!(0x84, -1, AF),
    fm!(0x85, -1, AF),
    fm!(0xA8, -1, AF),
    fm!(0xA9, -1, AF),
    fm!(0xD4, -1, CF | AF | OF), // AAM
    fm!(0xD5, -1, CF | AF | OF), // AAD
    // Group 3 TEST, MUL, IMUL, DIV, IDIV
    fm!(0xF6, 0, AF),
    fm!(0xF6, 1, AF),
    fm!(0xF6, 4, PF | AF | ZF | SF),
    fm!(0xF6, 5, PF | AF | ZF | SF),
    fm!(0xF6, 6, FLAGS_STATUS),
    fm!(0xF6, 7, FLAGS_STATUS),
    fm!(0xF7, 0, AF),
    fm!(0xF7, 1, AF),
    fm!(0xF7, 4, PF | AF | ZF | SF),
    fm!(0xF7, 5, PF | AF | ZF | SF),
    fm!(0xF7, 6, FLAGS_STATUS),
    fm!(0xF7, 7, FLAGS_STATUS),
    // BT, BTS, BTR, BTC
    fm!(0x0FA3, -1, PF | AF | SF | OF),
    fm!(0x0FAB, -1, PF | AF | SF | OF),
    fm!(0x0FB3, -1, PF | AF | SF | OF),
    fm!(0x0FBB, -1, PF | AF | SF | OF),
    fm!(0x0FAF, -1, PF | AF | ZF | SF), // IMUL r, r/m
    fm!(0x0FBA, 4, PF | AF | SF | OF),
    fm!(0x0FBA, 5, PF | AF | SF | OF),
    fm!(0x0FBA, 6, PF | AF | SF | OF),
    fm!(0x0FBA, 7, PF | AF | SF | OF),
    fm!(0x0FBC, -1, CF | PF | AF | SF | OF), // BSF
    fm!(0x0FBD, -1, CF | PF | AF | SF | OF), // BSR
];

fn is_prefix(byte: u8) -> bool {
    matches!(
        byte,
        0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
    )
}

/// Length of a ModRM operand (ModRM, SIB and displacement) starting at `bytes[0]`.
fn modrm_len(bytes: &[u8], addr16: bool) -> Option<usize> {
    let modrm = *bytes.first()?;
    let mode = modrm >> 6;
    let rm = modrm & 0x07;

    if mode == 0b11 {
        return Some(1);
    }
    if addr16 {
        return Some(match (mode, rm) {
            (0b00, 0b110) => 3,
            (0b00, _) => 1,
            (0b01, _) => 2,
            _ => 3,
        });
    }

    let mut len = 1;
    if rm == 0b100 {
        let sib = *bytes.get(1)?;
        len += 1;
        if mode == 0b00 && sib & 0x07 == 0b101 {
            len += 4;
        }
    }
    else if mode == 0b00 && rm == 0b101 {
        len += 4;
    }
    match mode {
        0b01 => len += 1,
        0b10 => len += 4,
        _ => {}
    }
    Some(len)
}

fn group2_mask(ext: u8, count: u32, width: u32) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        // Flags are not touched at all.
        return 0;
    }
    match ext {
        // ROL, ROR, RCL, RCR
        0..=3 => {
            if count == 1 {
                0
            }
            else {
                OF
            }
        }
        // SHL, SHR, SAL, SAR
        _ => {
            let mut mask = AF;
            if count != 1 {
                mask |= OF;
            }
            if ext != 7 && count >= width {
                mask |= CF;
            }
            mask
        }
    }
}

fn double_shift_mask(count: u32, width: u32) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        0
    }
    else if count > width {
        FLAGS_STATUS
    }
    else if count == 1 {
        AF
    }
    else {
        AF | OF
    }
}

/// Undefined flag mask for the instruction encoded at the start of `bytes`. `ecx` supplies CL for
/// shifts by register. Returns 0 if the encoding is truncated.
pub fn mask_for_instruction(bytes: &[u8], ecx: u32) -> u32 {
    let mut pos = 0;
    let mut op16 = false;
    let mut addr16 = false;
    while let Some(&b) = bytes.get(pos) {
        if !is_prefix(b) {
            break;
        }
        match b {
            0x66 => op16 = true,
            0x67 => addr16 = true,
            _ => {}
        }
        pos += 1;
    }
    let Some(&first) = bytes.get(pos)
    else {
        return 0;
    };
    pos += 1;

    let opcode = if first == 0x0F {
        let Some(&second) = bytes.get(pos)
        else {
            return 0;
        };
        pos += 1;
        TWO_BYTE | second as u16
    }
    else {
        first as u16
    };

    let modrm_at = pos;
    let ext = bytes.get(modrm_at).map(|m| (m >> 3) & 0x07);
    let width = if op16 { 16 } else { 32 };
    let cl = ecx & 0xFF;

    // Count-dependent encodings.
    match opcode {
        0xD0 | 0xD1 => return ext.map_or(0, |e| group2_mask(e, 1, if opcode == 0xD0 { 8 } else { width })),
        0xD2 | 0xD3 => {
            return ext.map_or(0, |e| group2_mask(e, cl, if opcode == 0xD2 { 8 } else { width }));
        }
        0xC0 | 0xC1 => {
            let Some(e) = ext
            else {
                return 0;
            };
            let Some(imm) = modrm_len(&bytes[modrm_at..], addr16).and_then(|n| bytes.get(modrm_at + n))
            else {
                return 0;
            };
            return group2_mask(e, *imm as u32, if opcode == 0xC0 { 8 } else { width });
        }
        0x0FA4 | 0x0FAC => {
            let Some(imm) = modrm_len(&bytes[modrm_at..], addr16).and_then(|n| bytes.get(modrm_at + n))
            else {
                return 0;
            };
            return double_shift_mask(*imm as u32, width);
        }
        0x0FA5 | 0x0FAD => return double_shift_mask(cl, width),
        _ => {}
    }

    FLAG_MASK_LOOKUP
        .iter()
        .find(|m| m.opcode == opcode && (m.ext < 0 || Some(m.ext as u8) == ext))
        .map_or(0, |m| m.mask)
}

/// Mask oracle for 32-bit x86, reading the next instruction from the primary engine's memory.
#[derive(Copy, Clone, Debug, Default)]
pub struct X86UndefinedFlags;

impl X86UndefinedFlags {
    /// Read up to [`MAX_INSTRUCTION_LEN`] bytes at `addr`, stopping at the first unreadable byte.
    fn fetch_window<M: PagedMemory>(mem: &M, addr: u32, buf: &mut [u8; MAX_INSTRUCTION_LEN]) -> usize {
        if mem.read_bytes(addr, buf) {
            return buf.len();
        }
        let mut n = 0;
        while n < buf.len() && mem.read_bytes(addr.wrapping_add(n as u32), &mut buf[n..n + 1]) {
            n += 1;
        }
        n
    }
}

impl<P: PrimaryEngine> UndefinedFlagOracle<P> for X86UndefinedFlags {
    fn undefined_flags(&mut self, primary: &P) -> u32 {
        let regs = primary.registers();
        let mut window = [0u8; MAX_INSTRUCTION_LEN];
        let n = Self::fetch_window(primary.memory(), regs.eip, &mut window);
        mask_for_instruction(&window[..n], regs.ecx)
    }
}
