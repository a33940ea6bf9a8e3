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

    geometry::interleave.rs

    Sector skew: generating a physical sector order from a skew factor, and
    recovering the factor from a sampled order.
*/


/// Physical order of sector numbers 1..=spt for a skew `factor`.
///
/// Each slot holds the previous slot's sector number plus `factor`, wrapping past `spt`. If that
/// number is already placed, the next free number is used instead. Factor 1 (or 0) gives the
/// sequential order.
pub fn skew_table(spt: u8, factor: u8) -> Vec<u8> {
    let spt16 = spt as u16;
    let factor = factor.max(1) as u16;
    let mut used = vec![false; spt as usize + 1];
    let mut table = Vec::with_capacity(spt as usize);
    let mut sector: u16 = 1;

    for _ in 0..spt {
        while used[sector as usize] {
            sector = sector % spt16 + 1;
        }
        used[sector as usize] = true;
        table.push(sector as u8);
        sector = (sector - 1 + factor) % spt16 + 1;
    }
    table
}

/// Recover the skew factor from sector numbers in the order they passed under the head.
///
/// Zero entries (missed IDs) and pairs involving the last sector are ignored. A pair of
/// consecutive numbers means sequential. Otherwise the advance between a pair is confirmed by
/// finding the following sector later in `ids` with the same advance after it. Returns `None`
/// when no pair can be confirmed.
pub fn skew_factor(ids: &[u8], spt: u8) -> Option<u8> {
    if spt < 3 {
        return Some(1);
    }

    for (i, pair) in ids.windows(2).enumerate() {
        let (this, next) = (pair[0], pair[1]);
        if this == 0 || next == 0 || this == spt || next == spt {
            continue;
        }
        if next == this + 1 {
            return Some(1);
        }
        if next <= this {
            continue;
        }

        let later = &ids[i + 2..];
        if let Some(j) = later.iter().position(|&s| s == this + 1) {
            if later.get(j + 1) == Some(&(next + 1)) {
                return Some(next - this);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPM_ORDER: [u8; 26] = [
        1, 7, 13, 19, 25, 5, 11, 17, 23, 3, 9, 15, 21, 2, 8, 14, 20, 26, 6, 12, 18, 24, 4, 10, 16, 22,
    ];

    #[test]
    fn test_cpm_skew_is_six() {
        assert_eq!(skew_factor(&CPM_ORDER, 26), Some(6));
        assert_eq!(skew_table(26, 6), CPM_ORDER.to_vec());
    }

    #[test]
    fn test_sequential() {
        assert_eq!(skew_table(9, 1), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(skew_factor(&[9, 1, 2, 3, 4, 5, 6, 7, 8, 9], 9), Some(1));
        assert_eq!(skew_factor(&[1, 2], 2), Some(1));
    }

    #[test]
    fn test_table_is_permutation() {
        for spt in 1..=30u8 {
            for factor in 1..=8u8 {
                let mut table = skew_table(spt, factor);
                table.sort_unstable();
                assert_eq!(table, (1..=spt).collect::<Vec<u8>>(), "spt {} factor {}", spt, factor);
            }
        }
    }

    #[test]
    fn test_detected_factor_matches_generated() {
        for factor in 2..=5u8 {
            let one = skew_table(15, factor);
            let two: Vec<u8> = one.iter().chain(one.iter()).copied().collect();
            assert_eq!(skew_factor(&two, 15), Some(factor));
        }
    }

    #[test]
    fn test_unconfirmed() {
        assert_eq!(skew_factor(&[0, 0, 0, 0], 9), None);
        assert_eq!(skew_factor(&[1, 5, 3], 9), None);
    }
}
