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

    mock.rs

    Mock primary and reference engines for tests and benchmarks.

*/

//! Small deterministic engines for exercising the validator without a real emulator.
//!
//! Both engines run the same tiny IA-32 subset:
//!
//! | Opcode | Instruction |
//! |---|---|
//! | `90` | NOP |
//! | `40+r` / `48+r` | INC r32 / DEC r32 |
//! | `05 id` | ADD EAX, imm32 |
//! | `21 /r` (mod 3) | AND r32, r32 |
//! | `B8+r id` | MOV r32, imm32 |
//! | `A1 md` / `A3 md` | MOV EAX, [moffs32] / MOV [moffs32], EAX |
//! | `CD ib` | INT imm8 |
//!
//! The primary engine keeps its status flags unpacked and only folds them into EFLAGS on
//! `collapse_flags`, demand-pages writes into present but unbacked pages, and can carry injected
//! [`MockBug`]s. The reference engine enforces page protection and refuses anything it can't run.

use std::{collections::BTreeMap, error::Error, fmt};

use crate::{
    engine::{Interrupt, PrimaryEngine, ReferenceEngine},
    memory::{page_of, PageEntry, PagedMemory, PAGE_SIZE, PROT_EXEC, PROT_WRITE, P_READ, P_WRITE},
    registers::*,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MockError {
    Unaligned(u32),
    Overlap(u32),
    Unmapped(u32),
    FetchUnmapped(u32),
    WriteProtected(u32),
    InvalidInstruction(u32, u8),
}

impl Error for MockError {}
impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockError::Unaligned(addr) => write!(f, "Unaligned mapping at {:08X}", addr),
            MockError::Overlap(addr) => write!(f, "Mapping overlaps existing page at {:08X}", addr),
            MockError::Unmapped(addr) => write!(f, "Unmapped memory at {:08X}", addr),
            MockError::FetchUnmapped(addr) => write!(f, "Fetch from non-executable memory at {:08X}", addr),
            MockError::WriteProtected(addr) => write!(f, "Write to protected memory at {:08X}", addr),
            MockError::InvalidInstruction(addr, opcode) => {
                write!(f, "Invalid instruction {:02X} at {:08X}", opcode, addr)
            }
        }
    }
}

/// Faults injected into the primary engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MockBug {
    /// ADD never sets CF.
    AddCarryStuck,
    /// INC computes SF and OF inverted.
    IncSignOverflow,
    /// AND leaves AF as it was instead of clearing it.
    AndKeepsAux,
    /// MOV [moffs32], EAX writes nothing.
    StoreDropped,
}

#[derive(Clone, Debug)]
struct MockPage {
    flags: u32,
    data:  Option<Box<[u8]>>,
}

/// Sparse paged memory with a change counter.
#[derive(Clone, Debug, Default)]
pub struct MockMemory {
    pages:   BTreeMap<u32, MockPage>,
    changes: u64,
}

impl MockMemory {
    fn page_mut(&mut self, addr: u32) -> Option<&mut MockPage> {
        self.pages.get_mut(&page_of(addr))
    }

    fn write_byte(&mut self, addr: u32, byte: u8) -> Option<()> {
        let data = self.page_mut(addr)?.data.as_mut()?;
        data[(addr as usize) & (PAGE_SIZE - 1)] = byte;
        Some(())
    }
}

impl PagedMemory for MockMemory {
    fn page_count(&self) -> u32 {
        self.pages.keys().next_back().map_or(0, |last| last + 1)
    }

    fn page(&self, page: u32) -> Option<PageEntry<'_>> {
        self.pages.get(&page).map(|p| PageEntry {
            flags: p.flags,
            data:  p.data.as_deref(),
        })
    }

    fn changes(&self) -> u64 {
        self.changes
    }
}

enum Exec {
    Retired,
    Interrupt(u8),
}

/// Memory access policy of one engine.
trait MockBus {
    fn fetch(&self, addr: u32, buf: &mut [u8]) -> Result<(), MockError>;
    fn load(&self, addr: u32, buf: &mut [u8]) -> Result<(), MockError>;
    fn store(&mut self, addr: u32, data: &[u8]) -> Result<(), MockError>;
}

struct PrimaryBus<'a>(&'a mut MockMemory);

impl MockBus for PrimaryBus<'_> {
    fn fetch(&self, addr: u32, buf: &mut [u8]) -> Result<(), MockError> {
        self.load(addr, buf)
    }

    fn load(&self, addr: u32, buf: &mut [u8]) -> Result<(), MockError> {
        if self.0.read_bytes(addr, buf) {
            Ok(())
        }
        else {
            Err(MockError::Unmapped(addr))
        }
    }

    fn store(&mut self, addr: u32, data: &[u8]) -> Result<(), MockError> {
        for (i, byte) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            let page = self.0.page_mut(a).ok_or(MockError::Unmapped(a))?;
            if page.flags & P_WRITE == 0 {
                return Err(MockError::WriteProtected(a));
            }
            // Demand paging: first write to a present page faults its data in.
            page.data.get_or_insert_with(|| vec![0; PAGE_SIZE].into_boxed_slice());
            self.0.write_byte(a, *byte);
        }
        self.0.changes += 1;
        Ok(())
    }
}

struct ReferenceBus<'a>(&'a mut MockMemory);

impl ReferenceBus<'_> {
    fn check(&self, addr: u32, len: usize, prot: u32) -> Result<(), MockError> {
        for i in 0..len as u32 {
            let a = addr.wrapping_add(i);
            match self.0.pages.get(&page_of(a)) {
                Some(page) if page.flags & prot == prot => {}
                Some(_) if prot == PROT_EXEC => return Err(MockError::FetchUnmapped(a)),
                Some(_) if prot == PROT_WRITE => return Err(MockError::WriteProtected(a)),
                _ => return Err(MockError::Unmapped(a)),
            }
        }
        Ok(())
    }
}

impl MockBus for ReferenceBus<'_> {
    fn fetch(&self, addr: u32, buf: &mut [u8]) -> Result<(), MockError> {
        self.check(addr, buf.len(), PROT_EXEC)
            .map_err(|_| MockError::FetchUnmapped(addr))?;
        self.load(addr, buf)
    }

    fn load(&self, addr: u32, buf: &mut [u8]) -> Result<(), MockError> {
        if self.0.read_bytes(addr, buf) {
            Ok(())
        }
        else {
            Err(MockError::Unmapped(addr))
        }
    }

    fn store(&mut self, addr: u32, data: &[u8]) -> Result<(), MockError> {
        self.check(addr, data.len(), PROT_WRITE)?;
        for (i, byte) in data.iter().enumerate() {
            self.0.write_byte(addr.wrapping_add(i as u32), *byte);
        }
        self.0.changes += 1;
        Ok(())
    }
}

const REG_ENCODING: [RegisterId; 8] = [
    RegisterId::Eax,
    RegisterId::Ecx,
    RegisterId::Edx,
    RegisterId::Ebx,
    RegisterId::Esp,
    RegisterId::Ebp,
    RegisterId::Esi,
    RegisterId::Edi,
];

fn fetch_u8(bus: &dyn MockBus, regs: &mut Registers) -> Result<u8, MockError> {
    let mut b = [0u8; 1];
    bus.fetch(regs.eip, &mut b)?;
    regs.eip = regs.eip.wrapping_add(1);
    Ok(b[0])
}

fn fetch_u32(bus: &dyn MockBus, regs: &mut Registers) -> Result<u32, MockError> {
    let mut b = [0u8; 4];
    bus.fetch(regs.eip, &mut b)?;
    regs.eip = regs.eip.wrapping_add(4);
    Ok(u32::from_le_bytes(b))
}

fn set_flag(flags: &mut u32, flag: u32, on: bool) {
    if on {
        *flags |= flag;
    }
    else {
        *flags &= !flag;
    }
}

fn set_szp(flags: &mut u32, result: u32) {
    set_flag(flags, FLAG_ZERO, result == 0);
    set_flag(flags, FLAG_SIGN, result & 0x8000_0000 != 0);
    set_flag(flags, FLAG_PARITY, (result as u8).count_ones() % 2 == 0);
}

/// Execute one instruction. `regs` is only committed by the caller on success, so a fault leaves the
/// instruction unexecuted.
fn execute(regs: &mut Registers, bus: &mut dyn MockBus, bugs: &[MockBug]) -> Result<Exec, MockError> {
    let start = regs.eip;
    let opcode = fetch_u8(bus, regs)?;
    let mut flags = regs.eflags;

    match opcode {
        0x90 => {}
        0x40..=0x47 | 0x48..=0x4F => {
            let id = REG_ENCODING[(opcode & 0x07) as usize];
            let a = regs.get(id);
            let (r, of, af) = if opcode < 0x48 {
                let r = a.wrapping_add(1);
                (r, a == 0x7FFF_FFFF, (a ^ 1 ^ r) & 0x10 != 0)
            }
            else {
                let r = a.wrapping_sub(1);
                (r, a == 0x8000_0000, (a ^ 1 ^ r) & 0x10 != 0)
            };
            regs.set(id, r);
            set_szp(&mut flags, r);
            set_flag(&mut flags, FLAG_OVERFLOW, of);
            set_flag(&mut flags, FLAG_AUX_CARRY, af);
            if opcode < 0x48 && bugs.contains(&MockBug::IncSignOverflow) {
                flags ^= FLAG_SIGN | FLAG_OVERFLOW;
            }
        }
        0x05 => {
            let a = regs.eax;
            let b = fetch_u32(bus, regs)?;
            let (r, carry) = a.overflowing_add(b);
            regs.eax = r;
            set_szp(&mut flags, r);
            set_flag(&mut flags, FLAG_CARRY, carry && !bugs.contains(&MockBug::AddCarryStuck));
            set_flag(&mut flags, FLAG_OVERFLOW, (a ^ r) & (b ^ r) & 0x8000_0000 != 0);
            set_flag(&mut flags, FLAG_AUX_CARRY, (a ^ b ^ r) & 0x10 != 0);
        }
        0x21 => {
            let modrm = fetch_u8(bus, regs)?;
            if modrm >> 6 != 0b11 {
                return Err(MockError::InvalidInstruction(start, opcode));
            }
            let dst = REG_ENCODING[(modrm & 0x07) as usize];
            let src = REG_ENCODING[((modrm >> 3) & 0x07) as usize];
            let r = regs.get(dst) & regs.get(src);
            regs.set(dst, r);
            set_szp(&mut flags, r);
            set_flag(&mut flags, FLAG_CARRY, false);
            set_flag(&mut flags, FLAG_OVERFLOW, false);
            if !bugs.contains(&MockBug::AndKeepsAux) {
                set_flag(&mut flags, FLAG_AUX_CARRY, false);
            }
        }
        0xB8..=0xBF => {
            let id = REG_ENCODING[(opcode & 0x07) as usize];
            let imm = fetch_u32(bus, regs)?;
            regs.set(id, imm);
        }
        0xA1 => {
            let addr = fetch_u32(bus, regs)?;
            let mut b = [0u8; 4];
            bus.load(addr, &mut b)?;
            regs.eax = u32::from_le_bytes(b);
        }
        0xA3 => {
            let addr = fetch_u32(bus, regs)?;
            if !bugs.contains(&MockBug::StoreDropped) {
                bus.store(addr, &regs.eax.to_le_bytes())?;
            }
        }
        0xCD => {
            let vector = fetch_u8(bus, regs)?;
            regs.eflags = flags;
            return Ok(Exec::Interrupt(vector));
        }
        _ => return Err(MockError::InvalidInstruction(start, opcode)),
    }

    regs.eflags = flags;
    Ok(Exec::Retired)
}

/// Status flags held unpacked, the way an emulator with lazy flag evaluation might.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct UnpackedFlags {
    cf: bool,
    pf: bool,
    af: bool,
    zf: bool,
    sf: bool,
    of: bool,
}

impl UnpackedFlags {
    fn from_word(word: u32) -> Self {
        Self {
            cf: word & FLAG_CARRY != 0,
            pf: word & FLAG_PARITY != 0,
            af: word & FLAG_AUX_CARRY != 0,
            zf: word & FLAG_ZERO != 0,
            sf: word & FLAG_SIGN != 0,
            of: word & FLAG_OVERFLOW != 0,
        }
    }

    fn fold(&self, word: u32) -> u32 {
        let mut word = word & !FLAGS_STATUS;
        set_flag(&mut word, FLAG_CARRY, self.cf);
        set_flag(&mut word, FLAG_PARITY, self.pf);
        set_flag(&mut word, FLAG_AUX_CARRY, self.af);
        set_flag(&mut word, FLAG_ZERO, self.zf);
        set_flag(&mut word, FLAG_SIGN, self.sf);
        set_flag(&mut word, FLAG_OVERFLOW, self.of);
        word
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockPrimaryState {
    regs:   Registers,
    flags:  UnpackedFlags,
    trapno: Option<Interrupt>,
}

#[derive(Clone, Debug)]
pub struct MockPrimary {
    /// Architectural registers. `eflags` holds the last collapsed value.
    pub regs: Registers,
    flags: UnpackedFlags,
    mem: MockMemory,
    bugs: Vec<MockBug>,
    trapno: Option<Interrupt>,
    handled: Vec<Interrupt>,
    tlb_flushes: usize,
    collapses: usize,
}

impl MockPrimary {
    pub fn new(eip: u32, esp: u32) -> Self {
        Self {
            regs: Registers {
                eip,
                esp,
                eflags: FLAG_RESERVED_ON,
                ..Default::default()
            },
            flags: UnpackedFlags::default(),
            mem: MockMemory::default(),
            bugs: Vec::new(),
            trapno: None,
            handled: Vec::new(),
            tlb_flushes: 0,
            collapses: 0,
        }
    }

    pub fn with_bug(mut self, bug: MockBug) -> Self {
        self.bugs.push(bug);
        self
    }

    /// Add a page at the page containing `addr`. With `data`, the page is backed and `data` is
    /// copied to its start.
    pub fn map_page(&mut self, addr: u32, flags: u32, data: Option<&[u8]>) {
        let data = data.map(|bytes| {
            let mut page = vec![0u8; PAGE_SIZE];
            page[..bytes.len()].copy_from_slice(bytes);
            page.into_boxed_slice()
        });
        self.mem.pages.insert(page_of(addr), MockPage { flags, data });
    }

    /// Set status flags in both the unpacked and the collapsed form.
    pub fn set_flags(&mut self, word: u32) {
        self.flags = UnpackedFlags::from_word(word);
        self.regs.eflags = self.flags.fold(self.regs.eflags);
    }

    pub fn trapno(&self) -> Option<Interrupt> {
        self.trapno
    }

    pub fn handled(&self) -> &[Interrupt] {
        &self.handled
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes
    }

    pub fn collapses(&self) -> usize {
        self.collapses
    }
}

impl PrimaryEngine for MockPrimary {
    type State = MockPrimaryState;
    type Memory = MockMemory;

    fn registers(&self) -> Registers {
        self.regs
    }

    fn save_state(&self) -> MockPrimaryState {
        MockPrimaryState {
            regs:   self.regs,
            flags:  self.flags,
            trapno: self.trapno,
        }
    }

    fn restore_state(&mut self, state: &MockPrimaryState) {
        self.regs = state.regs;
        self.flags = state.flags;
        self.trapno = state.trapno;
    }

    fn collapse_flags(&mut self) {
        self.regs.eflags = self.flags.fold(self.regs.eflags);
        self.collapses += 1;
    }

    fn memory(&self) -> &MockMemory {
        &self.mem
    }

    fn step(&mut self) -> Option<Interrupt> {
        let mut regs = self.regs;
        regs.eflags = self.flags.fold(regs.eflags);

        let mut bus = PrimaryBus(&mut self.mem);
        let result = execute(&mut regs, &mut bus, &self.bugs);

        // Flags go back to the unpacked form; the architectural word goes stale until collapsed.
        let stale_flags = self.regs.eflags;
        match result {
            Ok(exec) => {
                self.flags = UnpackedFlags::from_word(regs.eflags);
                self.regs = Registers {
                    eflags: stale_flags,
                    ..regs
                };
                match exec {
                    Exec::Retired => None,
                    Exec::Interrupt(vector) => Some(Interrupt(vector)),
                }
            }
            Err(MockError::InvalidInstruction(..)) => Some(Interrupt::UNDEFINED),
            Err(_) => Some(Interrupt::PAGE_FAULT),
        }
    }

    fn set_trapno(&mut self, interrupt: Interrupt) {
        self.trapno = Some(interrupt);
    }

    fn handle_interrupt(&mut self, interrupt: Interrupt) {
        self.handled.push(interrupt);
        if interrupt == Interrupt::SYSCALL {
            // Every system call succeeds with 0.
            self.regs.eax = 0;
        }
    }

    fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
    }
}

/// Reference engine over the same instruction subset.
#[derive(Clone, Debug)]
pub struct MockReference {
    regs: Registers,
    mem: MockMemory,
    executed: u64,
}

impl MockReference {
    /// Protection of the page containing `addr`, if mapped.
    pub fn protection(&self, addr: u32) -> Option<u32> {
        self.mem.pages.get(&page_of(addr)).map(|p| p.flags)
    }

    /// Instructions executed over the engine's lifetime.
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl ReferenceEngine for MockReference {
    type Error = MockError;

    fn open() -> Result<Self, MockError> {
        Ok(Self {
            regs: Registers {
                eflags: FLAG_RESERVED_ON,
                ..Default::default()
            },
            mem: MockMemory::default(),
            executed: 0,
        })
    }

    fn reg_read_batch(&mut self, ids: &[RegisterId], values: &mut [u32]) -> Result<(), MockError> {
        for (id, value) in ids.iter().zip(values.iter_mut()) {
            *value = self.regs.get(*id);
        }
        Ok(())
    }

    fn reg_write(&mut self, id: RegisterId, value: u32) -> Result<(), MockError> {
        self.regs.set(id, value);
        Ok(())
    }

    fn mem_map(&mut self, addr: u32, size: usize, prot: u32) -> Result<(), MockError> {
        if addr as usize & (PAGE_SIZE - 1) != 0 || size == 0 || size % PAGE_SIZE != 0 {
            return Err(MockError::Unaligned(addr));
        }
        let first = page_of(addr);
        let count = (size / PAGE_SIZE) as u32;
        if (first..first + count).any(|p| self.mem.pages.contains_key(&p)) {
            return Err(MockError::Overlap(addr));
        }
        for page in first..first + count {
            self.mem.pages.insert(
                page,
                MockPage {
                    flags: prot,
                    data:  Some(vec![0; PAGE_SIZE].into_boxed_slice()),
                },
            );
        }
        Ok(())
    }

    fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), MockError> {
        for (i, b) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            self.mem.write_byte(a, *b).ok_or(MockError::Unmapped(a))?;
        }
        Ok(())
    }

    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MockError> {
        if self.mem.read_bytes(addr, buf) {
            Ok(())
        }
        else {
            Err(MockError::Unmapped(addr))
        }
    }

    fn emu_start(&mut self, begin: u32, until: u64, _timeout: u64, count: usize) -> Result<(), MockError> {
        self.regs.eip = begin;
        let mut n = 0;
        while (count == 0 || n < count) && self.regs.eip as u64 != until {
            let mut regs = self.regs;
            let mut bus = ReferenceBus(&mut self.mem);
            if let Exec::Interrupt(vector) = execute(&mut regs, &mut bus, &[])? {
                if vector == Interrupt::SYSCALL.0 {
                    regs.eax = 0;
                }
                else {
                    return Err(MockError::InvalidInstruction(self.regs.eip, 0xCD));
                }
            }
            self.regs = regs;
            self.executed += 1;
            n += 1;
        }
        Ok(())
    }
}

/// Put the primary and reference side by side on the same program: code at `code_addr`, a
/// writable data page at `data_addr` and the stack pointer at `esp`. Returns the primary; the
/// reference is built from it with [`start_reference`](crate::snapshot::start_reference).
pub fn program(code_addr: u32, code: &[u8], data_addr: u32, esp: u32) -> MockPrimary {
    let mut primary = MockPrimary::new(code_addr, esp);
    primary.map_page(code_addr, P_READ, Some(code));
    primary.map_page(data_addr, P_READ | P_WRITE, Some(&[]));
    primary
}
