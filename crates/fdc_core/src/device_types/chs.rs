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

    --------------------------------------------------------------------------

    device_types::chs.rs

    Sector address as carried by a sector ID field (C, H, R, N).
*/

use std::fmt::Display;

/// A [SectorAddress] holds the four ID field bytes of a sector header: cylinder, head, sector
/// number and size code. These are the *logical* values written at format time, which do not
/// have to match the physical position of the head.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SectorAddress {
    pub(crate) c: u8,
    pub(crate) h: u8,
    pub(crate) s: u8,
    pub(crate) n: u8,
}

impl From<(u8, u8, u8, u8)> for SectorAddress {
    fn from((c, h, s, n): (u8, u8, u8, u8)) -> Self {
        Self { c, h, s, n }
    }
}

impl From<SectorAddress> for (u8, u8, u8, u8) {
    fn from(id: SectorAddress) -> Self {
        (id.c, id.h, id.s, id.n)
    }
}

impl Display for SectorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{:2} h:{} s:{:3} n:{}]", self.c, self.h, self.s, self.n)
    }
}

impl SectorAddress {
    /// Create a new `SectorAddress` from cylinder, head, sector id and size code components.
    pub fn new(c: u8, h: u8, s: u8, n: u8) -> Self {
        Self { c, h, s, n }
    }
    /// Return the cylinder (c) field.
    #[inline]
    pub fn c(&self) -> u8 {
        self.c
    }
    /// Return the head (h) field.
    #[inline]
    pub fn h(&self) -> u8 {
        self.h
    }
    /// Return the sector id (s) field.
    #[inline]
    pub fn s(&self) -> u8 {
        self.s
    }
    /// Return the size code (n) field.
    #[inline]
    pub fn n(&self) -> u8 {
        self.n
    }
    /// Return the sector size in bytes implied by the size code.
    pub fn size(&self) -> usize {
        crate::device_types::media::sector_size_bytes(self.n)
    }

    /// Pack the address into a 16-bit sector table entry: cylinder in the high byte, head in
    /// bit 7, and the low 7 bits of the sector number. The size code is not kept.
    pub fn table_entry(&self) -> u16 {
        ((self.c as u16) << 8) | (((self.h & 0x01) as u16) << 7) | (self.s & 0x7F) as u16
    }

    /// Unpack a sector table entry produced by [SectorAddress::table_entry]. The size code is
    /// set to 0.
    pub fn from_table_entry(entry: u16) -> Self {
        Self {
            c: (entry >> 8) as u8,
            h: ((entry >> 7) & 0x01) as u8,
            s: (entry & 0x7F) as u8,
            n: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_entry_packing() {
        let id = SectorAddress::new(79, 1, 18, 2);
        let entry = id.table_entry();
        assert_eq!(entry, (79 << 8) | 0x80 | 18);

        let unpacked = SectorAddress::from_table_entry(entry);
        assert_eq!(unpacked.c(), 79);
        assert_eq!(unpacked.h(), 1);
        assert_eq!(unpacked.s(), 18);
        assert_eq!(unpacked.n(), 0);
    }

    #[test]
    fn test_display() {
        let id = SectorAddress::new(3, 0, 7, 2);
        assert_eq!(format!("{}", id), "[c: 3 h:0 s:  7 n:2]");
        assert_eq!(id.size(), 512);
    }
}
