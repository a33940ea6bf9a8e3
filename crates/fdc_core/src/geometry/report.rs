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

    geometry::report.rs

    Human readable summary of the geometry currently programmed into the driver.
*/

use std::fmt::{self, Display};

use crate::device_types::media::{sector_size_bytes, DriveMediaParams};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeometryReport {
    pub double_stepping: bool,
    pub cylinders: u8,
    pub heads: u8,
    pub cylinder: u8,
    pub head: u8,
    pub sectors_per_track: u8,
    pub size_code: u8,
    pub gap_length: u8,
    pub format_gap_length: u8,
    /// Controller data rate in kbps.
    pub data_rate: u16,
    pub fm: bool,
    pub interleave: u8,
    pub auto_gaps: bool,
}

impl GeometryReport {
    pub fn new(params: &DriveMediaParams, cylinder: u8, head: u8, interleave: u8, auto_gaps: bool) -> Self {
        Self {
            double_stepping: params.double_stepping,
            cylinders: params.logical_cylinders(),
            heads: params.heads,
            cylinder,
            head,
            sectors_per_track: params.sectors_per_track,
            size_code: params.sector_size_code(),
            gap_length: params.gap_length,
            format_gap_length: params.format_gap_length,
            data_rate: params.data_rate.kbps(),
            fm: params.fm,
            interleave,
            auto_gaps,
        }
    }

    /// Rate of the recording on the media. FM packs half as many bits as the controller clock.
    pub fn media_rate(&self) -> u16 {
        if self.fm {
            self.data_rate / 2
        }
        else {
            self.data_rate
        }
    }
}

impl Display for GeometryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Step: {}, cylinders: {}, heads: {}",
            if self.double_stepping { "double" } else { "single" },
            self.cylinders,
            self.heads
        )?;
        writeln!(
            f,
            "CHS {:02}/{}: {} x {} bytes, gap {:02X}h{}",
            self.cylinder,
            self.head,
            self.sectors_per_track,
            sector_size_bytes(self.size_code),
            self.gap_length,
            if self.auto_gaps { " (auto)" } else { "" }
        )?;
        write!(
            f,
            "Media: {}kbps {}, format gap {:02X}h, interleave 1:{}",
            self.media_rate(),
            if self.fm { "FM" } else { "MFM" },
            self.format_gap_length,
            self.interleave
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fm_report() {
        let params = DriveMediaParams::ibm_3740(0);
        let report = GeometryReport::new(&params, 2, 0, 6, true);
        assert_eq!(report.media_rate(), 250);
        let text = report.to_string();
        assert!(text.contains("cylinders: 77, heads: 1"));
        assert!(text.contains("CHS 02/0: 26 x 128 bytes, gap 07h (auto)"));
        assert!(text.ends_with("Media: 250kbps FM, format gap 1Bh, interleave 1:6"));
    }
}
