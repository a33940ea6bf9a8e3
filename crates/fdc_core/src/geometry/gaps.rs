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

    geometry::gaps.rs

    Sector gap (GPL) and format gap (GAP3) selection: a table of well known
    formats, then an empirical formula for everything else.
*/

use crate::device_types::media::{DataRate, DriveMediaParams};

pub const MIN_SECTOR_GAP: u16 = 7;
pub const MAX_SECTOR_GAP: u16 = 200;
pub const MIN_FORMAT_GAP: i32 = 13;
pub const MAX_FORMAT_GAP: i32 = 255;

/// (size code, sectors per track, sector gap, format gap)
type GapEntry = (u8, u8, u8, u8);

// Searched in order; the first matching size code and SPT wins.
#[rustfmt::skip]
const GAP_TABLE: &[GapEntry] = &[
    // 8" FM
    (0, 26, 0x07, 0x1B), (1, 15, 0x0E, 0x2A), (2, 8, 0x1B, 0x3A),
    (3, 4, 0x47, 0x8A), (4, 2, 0xC8, 0xFF), (5, 1, 0xC8, 0xFF),
    // 8" MFM
    (1, 26, 0x0E, 0x36), (2, 15, 0x1B, 0x54), (3, 8, 0x35, 0x74),
    (4, 4, 0x99, 0xFF), (5, 2, 0xC8, 0xFF), (6, 1, 0xC8, 0xFF),
    // 5.25" FM
    (0, 18, 0x07, 0x09), (0, 16, 0x10, 0x19), (1, 8, 0x18, 0x30),
    (2, 4, 0x46, 0x87), (3, 2, 0xC8, 0xFF), (4, 1, 0xC8, 0xFF),
    // 5.25" MFM
    (1, 18, 0x0A, 0x0C), (1, 16, 0x20, 0x32), (2, 8, 0x2A, 0x50),
    (3, 4, 0x80, 0xF0), (4, 2, 0xC8, 0xFF), (5, 1, 0xC8, 0xFF),
    // PC
    (2, 9, 0x2A, 0x50), (2, 18, 0x1B, 0x6C), (2, 36, 0x1B, 0x53),
];

/// Returns `(sector gap, format gap)` for the current size, SPT, rate and encoding.
pub fn compute_gaps(params: &DriveMediaParams) -> (u8, u8) {
    let size_code = params.sector_size_code();
    let spt = params.sectors_per_track;

    if let Some(&(_, _, gap, format_gap)) = GAP_TABLE.iter().find(|e| e.0 == size_code && e.1 == spt) {
        return (gap, format_gap);
    }
    formula_gaps(params.data_rate, params.fm, spt, params.sector_size)
}

/// Gaps for formats not in the table, scaled from the raw track capacity.
pub fn formula_gaps(rate: DataRate, fm: bool, spt: u8, sector_size: u16) -> (u8, u8) {
    let spt = spt.max(1) as i32;
    let size = sector_size as i32;
    let fast = rate == DataRate::Rate500;

    let mut gap3 = if fm {
        (if fast { 4962 } else { 2948 }) / spt - 33
    }
    else {
        (if fast { 9926 } else { 5898 }) / spt - 62
    };

    if gap3 <= size {
        gap3 = MIN_FORMAT_GAP;
    }
    else {
        gap3 -= size;
        if gap3 < MIN_FORMAT_GAP {
            gap3 = MIN_FORMAT_GAP;
        }
    }

    let mut gap = (gap3 * 2 / 3) as u16;
    gap -= gap / 5;
    let gap = gap.clamp(MIN_SECTOR_GAP, MAX_SECTOR_GAP);
    let gap3 = gap3.min(MAX_FORMAT_GAP);

    (gap as u8, gap3 as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_first_match() {
        let mut params = DriveMediaParams::pc_1440k(0);
        assert_eq!(compute_gaps(&params), (0x1B, 0x6C));

        // 8 x 512 is listed for both 8" FM and 5.25" MFM; the 8" FM entry comes first.
        params.sectors_per_track = 8;
        assert_eq!(compute_gaps(&params), (0x1B, 0x3A));

        let cpm = DriveMediaParams::ibm_3740(0);
        assert_eq!(compute_gaps(&cpm), (0x07, 0x1B));
    }

    #[test]
    fn test_formula() {
        // MFM 500kbps 10 x 512: 9926 / 10 - 62 = 930, minus 512 = 418 -> clamp 255.
        // gap = 418 * 2 / 3 = 278, minus 55 = 223 -> clamp 200.
        assert_eq!(formula_gaps(DataRate::Rate500, false, 10, 512), (200, 255));

        // MFM 250kbps 10 x 512: 5898 / 10 - 62 = 527, minus 512 = 15.
        // gap = 10, minus 2 = 8.
        assert_eq!(formula_gaps(DataRate::Rate250, false, 10, 512), (8, 15));

        // Too many sectors to fit: minimum gaps.
        assert_eq!(formula_gaps(DataRate::Rate250, true, 40, 256), (7, 13));
    }
}
