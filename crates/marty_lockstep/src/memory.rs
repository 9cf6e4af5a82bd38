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

    memory.rs

    Paged memory view of the primary engine and protection mapping for the
    reference engine.

*/

use serde_derive::Deserialize;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
pub const MEM_PAGES: u32 = 1 << (32 - PAGE_BITS);

// Primary engine page flags
pub const P_READ: u32 = 0b0001;
pub const P_WRITE: u32 = 0b0010;
pub const P_EXEC: u32 = 0b0100;

// Reference engine protection bits
pub const PROT_NONE: u32 = 0b0000;
pub const PROT_READ: u32 = 0b0001;
pub const PROT_WRITE: u32 = 0b0010;
pub const PROT_EXEC: u32 = 0b0100;

#[inline(always)]
pub fn page_of(addr: u32) -> u32 {
    addr >> PAGE_BITS
}

#[inline(always)]
pub fn page_addr(page: u32) -> u32 {
    page << PAGE_BITS
}

/// A view of a single page table entry of the primary engine.
#[derive(Copy, Clone, Debug)]
pub struct PageEntry<'a> {
    pub flags: u32,
    /// Backing data, exactly [`PAGE_SIZE`] bytes. `None` for pages that have not been faulted in.
    pub data:  Option<&'a [u8]>,
}

/// The primary engine's paged address space.
pub trait PagedMemory {
    /// Number of page table entries to enumerate.
    fn page_count(&self) -> u32 {
        MEM_PAGES
    }

    /// The entry for `page`, or `None` if the page is not present at all.
    fn page(&self, page: u32) -> Option<PageEntry<'_>>;

    /// Monotonic counter, incremented on every mutation of the memory image.
    fn changes(&self) -> u64;

    /// Copy bytes starting at `addr` into `buf`. Returns false if any byte falls on a page without
    /// backing data.
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> bool {
        let mut addr = addr;
        let mut filled = 0;
        while filled < buf.len() {
            let Some(data) = self.page(page_of(addr)).and_then(|entry| entry.data)
            else {
                return false;
            };
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let n = usize::min(PAGE_SIZE - offset, buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&data[offset..offset + n]);
            filled += n;
            addr = addr.wrapping_add(n as u32);
        }
        true
    }
}

/// How primary page flags translate into reference engine protection.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum ProtMapping {
    /// Readable pages are also executable. Correct only for targets without execute protection,
    /// such as plain 32-bit x86 paging.
    #[default]
    ReadImpliesExec,
    /// Execute permission comes only from [`P_EXEC`].
    Strict,
}

impl ProtMapping {
    pub fn protection(&self, flags: u32) -> u32 {
        let mut prot = PROT_NONE;
        if flags & P_READ != 0 {
            prot |= PROT_READ;
            if let ProtMapping::ReadImpliesExec = self {
                prot |= PROT_EXEC;
            }
        }
        if flags & P_WRITE != 0 {
            prot |= PROT_WRITE;
        }
        if let ProtMapping::Strict = self {
            if flags & P_EXEC != 0 {
                prot |= PROT_EXEC;
            }
        }
        prot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct TwoPages {
        pages: BTreeMap<u32, Vec<u8>>,
    }

    impl PagedMemory for TwoPages {
        fn page(&self, page: u32) -> Option<PageEntry<'_>> {
            self.pages.get(&page).map(|data| PageEntry {
                flags: P_READ,
                data:  Some(data.as_slice()),
            })
        }
        fn changes(&self) -> u64 {
            0
        }
    }

    #[test]
    fn read_bytes_crosses_page_boundary() {
        let mut pages = BTreeMap::new();
        pages.insert(1, vec![0xAA; PAGE_SIZE]);
        pages.insert(2, vec![0xBB; PAGE_SIZE]);
        let mem = TwoPages { pages };

        let mut buf = [0u8; 4];
        assert!(mem.read_bytes(page_addr(2) - 2, &mut buf));
        assert_eq!(buf, [0xAA, 0xAA, 0xBB, 0xBB]);

        // Page 3 has no backing data.
        assert!(!mem.read_bytes(page_addr(3) - 1, &mut buf[..2]));
    }

    #[test]
    fn read_implies_exec_mapping() {
        let m = ProtMapping::ReadImpliesExec;
        assert_eq!(m.protection(P_READ), PROT_READ | PROT_EXEC);
        assert_eq!(m.protection(P_READ | P_WRITE), PROT_READ | PROT_WRITE | PROT_EXEC);
        assert_eq!(m.protection(P_WRITE), PROT_WRITE);
        assert_eq!(m.protection(0), PROT_NONE);
    }

    #[test]
    fn strict_mapping_needs_exec_flag() {
        let m = ProtMapping::Strict;
        assert_eq!(m.protection(P_READ), PROT_READ);
        assert_eq!(m.protection(P_READ | P_EXEC), PROT_READ | PROT_EXEC);
    }
}
