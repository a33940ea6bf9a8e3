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

    device_types::media.rs

    Drive and media description: physical size class, data rate and the full
    set of parameters the driver needs to talk to one drive.
*/

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};
use serde_derive::Deserialize;
use strum_macros::{Display, EnumIter};

use crate::devices::fdc::error::FdcError;

pub const MAX_SECTOR_SIZE_CODE: u8 = 6;
pub const MAX_SECTORS_PER_TRACK: u8 = 63;
/// Size of the persisted parameter blob in bytes.
pub const MEDIA_PARAMS_BLOB_LEN: usize = 27;

/// Return the size in bytes of a sector with the given size code (128 << n).
pub fn sector_size_bytes(code: u8) -> usize {
    128usize << code.min(MAX_SECTOR_SIZE_CODE)
}

/// Return the size code for a sector size in bytes. Sizes that are not a power of two between
/// 128 and 8192 map to 2 (512 bytes).
pub fn sector_size_code(bytes: usize) -> u8 {
    match bytes {
        128 => 0,
        256 => 1,
        512 => 2,
        1024 => 3,
        2048 => 4,
        4096 => 5,
        8192 => 6,
        _ => 2,
    }
}

/// Physical size class of a drive. Determines the Specify timings and the reduced write
/// current behavior.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumIter, Deserialize)]
#[serde(try_from = "u8")]
pub enum DriveSize {
    #[strum(to_string = "8\"")]
    Eight,
    #[strum(to_string = "5.25\"")]
    FiveQuarter,
    #[default]
    #[strum(to_string = "3.5\"")]
    ThreeHalf,
}

impl DriveSize {
    /// Whole inches, as stored in the parameter blob.
    pub fn inches(&self) -> u8 {
        match self {
            DriveSize::Eight => 8,
            DriveSize::FiveQuarter => 5,
            DriveSize::ThreeHalf => 3,
        }
    }
}

impl TryFrom<u8> for DriveSize {
    type Error = String;

    fn try_from(inches: u8) -> Result<Self, Self::Error> {
        match inches {
            8 => Ok(DriveSize::Eight),
            5 => Ok(DriveSize::FiveQuarter),
            3 => Ok(DriveSize::ThreeHalf),
            _ => Err(format!("Unsupported drive size: {} inches", inches)),
        }
    }
}

/// Data rate between controller and drive. In FM the media rate is half of this.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumIter, Deserialize)]
#[serde(try_from = "u16")]
pub enum DataRate {
    #[strum(to_string = "250kbps")]
    Rate250,
    #[strum(to_string = "300kbps")]
    Rate300,
    #[default]
    #[strum(to_string = "500kbps")]
    Rate500,
    #[strum(to_string = "1Mbps")]
    Rate1000,
}

impl DataRate {
    pub fn kbps(&self) -> u16 {
        match self {
            DataRate::Rate250 => 250,
            DataRate::Rate300 => 300,
            DataRate::Rate500 => 500,
            DataRate::Rate1000 => 1000,
        }
    }

    /// Value written to the data rate register.
    pub fn drr_bits(&self) -> u8 {
        match self {
            DataRate::Rate500 => 0,
            DataRate::Rate300 => 1,
            DataRate::Rate250 => 2,
            DataRate::Rate1000 => 3,
        }
    }

    pub fn from_drr_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DataRate::Rate500,
            1 => DataRate::Rate300,
            2 => DataRate::Rate250,
            _ => DataRate::Rate1000,
        }
    }
}

impl TryFrom<u16> for DataRate {
    type Error = String;

    fn try_from(kbps: u16) -> Result<Self, Self::Error> {
        match kbps {
            250 => Ok(DataRate::Rate250),
            300 => Ok(DataRate::Rate300),
            500 => Ok(DataRate::Rate500),
            1000 => Ok(DataRate::Rate1000),
            _ => Err(format!("Unsupported data rate: {}kbps", kbps)),
        }
    }
}

/// Filesystem hints carried along with the media description. The core never reads these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilesystemHints {
    pub use_fat12: bool,
    pub use_cpmfs: bool,
    pub fat_media_descriptor: u8,
    pub fat_root_dir_entries: u8,
    pub fat_cluster_size: u16,
}

/// Physical format of one logical drive and the media in it.
///
/// `cylinders` is the number of cylinders the *drive* steps through. When double stepping is
/// enabled the media has half as many; see [DriveMediaParams::logical_cylinders].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DriveMediaParams {
    pub drive_number: u8,
    pub drive_size: DriveSize,
    pub cylinders: u8,
    pub heads: u8,
    pub sector_size: u16,
    pub sectors_per_track: u8,
    pub gap_length: u8,
    pub format_gap_length: u8,
    pub format_filler: u8,
    pub srt: u8,
    pub hlt: u16,
    pub hut: u16,
    pub data_rate: DataRate,
    pub fm: bool,
    pub double_stepping: bool,
    pub disk_change_line: bool,
    pub perpendicular: bool,
    #[serde(flatten)]
    pub filesystem: FilesystemHints,
}

impl Default for DriveMediaParams {
    fn default() -> Self {
        Self::pc_1440k(0)
    }
}

impl DriveMediaParams {
    /// 3.5" 1.44M: 80 cylinders, 2 heads, 18 x 512 at 500kbps MFM.
    pub fn pc_1440k(drive_number: u8) -> Self {
        Self {
            drive_number,
            drive_size: DriveSize::ThreeHalf,
            cylinders: 80,
            heads: 2,
            sector_size: 512,
            sectors_per_track: 18,
            gap_length: 0x1B,
            format_gap_length: 0x6C,
            format_filler: 0xF6,
            srt: 4,
            hlt: 32,
            hut: 256,
            data_rate: DataRate::Rate500,
            fm: false,
            double_stepping: false,
            disk_change_line: true,
            perpendicular: false,
            filesystem: FilesystemHints {
                use_fat12: true,
                fat_media_descriptor: 0xF0,
                fat_root_dir_entries: 224,
                fat_cluster_size: 512,
                ..Default::default()
            },
        }
    }

    /// 5.25" 360K: 40 cylinders, 2 heads, 9 x 512 at 250kbps MFM.
    pub fn pc_360k(drive_number: u8) -> Self {
        Self {
            drive_number,
            drive_size: DriveSize::FiveQuarter,
            cylinders: 40,
            heads: 2,
            sector_size: 512,
            sectors_per_track: 9,
            gap_length: 0x2A,
            format_gap_length: 0x50,
            format_filler: 0xF6,
            srt: 6,
            hlt: 64,
            hut: 256,
            data_rate: DataRate::Rate250,
            fm: false,
            double_stepping: false,
            disk_change_line: false,
            perpendicular: false,
            filesystem: FilesystemHints {
                use_fat12: true,
                fat_media_descriptor: 0xFD,
                fat_root_dir_entries: 112,
                fat_cluster_size: 1024,
                ..Default::default()
            },
        }
    }

    /// 8" single sided single density (IBM 3740): 77 cylinders, 1 head, 26 x 128 FM.
    pub fn ibm_3740(drive_number: u8) -> Self {
        Self {
            drive_number,
            drive_size: DriveSize::Eight,
            cylinders: 77,
            heads: 1,
            sector_size: 128,
            sectors_per_track: 26,
            gap_length: 0x07,
            format_gap_length: 0x1B,
            format_filler: 0xE5,
            srt: 8,
            hlt: 256,
            hut: 256,
            data_rate: DataRate::Rate500,
            fm: true,
            double_stepping: false,
            disk_change_line: false,
            perpendicular: false,
            filesystem: FilesystemHints {
                use_cpmfs: true,
                ..Default::default()
            },
        }
    }

    /// Drive letter used in diagnostics, 'A' for drive 0.
    pub fn drive_letter(&self) -> char {
        (b'A' + (self.drive_number & 0x03)) as char
    }

    pub fn sector_size_code(&self) -> u8 {
        sector_size_code(self.sector_size as usize)
    }

    /// Number of cylinders on the media. Half the drive's cylinders when double stepping.
    pub fn logical_cylinders(&self) -> u8 {
        if self.double_stepping {
            self.cylinders / 2
        }
        else {
            self.cylinders
        }
    }

    /// Default format filler byte for the current encoding.
    pub fn default_filler(&self) -> u8 {
        if self.fm {
            0xE5
        }
        else {
            0xF6
        }
    }

    /// Serialize into the fixed little-endian layout used for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FdcError> {
        let blob = MediaParamsBlob::from(self);
        let mut cursor = Cursor::new(Vec::with_capacity(MEDIA_PARAMS_BLOB_LEN));
        blob.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Deserialize from the fixed little-endian layout used for persistence.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FdcError> {
        let blob = MediaParamsBlob::read(&mut Cursor::new(bytes))?;
        Self::try_from(blob)
    }
}

/// On-disk layout of [DriveMediaParams]. Booleans are stored as single bytes.
#[binrw]
#[derive(Debug, Default)]
#[brw(little)]
struct MediaParamsBlob {
    drive_number: u8,
    drive_inches: u8,
    cylinders: u8,
    heads: u8,
    sector_size: u16,
    sectors_per_track: u8,
    gap_length: u8,
    format_gap_length: u8,
    format_filler: u8,
    srt: u8,
    hlt: u16,
    hut: u16,
    data_rate_kbps: u16,
    fm: u8,
    double_stepping: u8,
    disk_change_line: u8,
    perpendicular: u8,
    use_fat12: u8,
    use_cpmfs: u8,
    fat_media_descriptor: u8,
    fat_root_dir_entries: u8,
    fat_cluster_size: u16,
}

impl From<&DriveMediaParams> for MediaParamsBlob {
    fn from(p: &DriveMediaParams) -> Self {
        Self {
            drive_number: p.drive_number,
            drive_inches: p.drive_size.inches(),
            cylinders: p.cylinders,
            heads: p.heads,
            sector_size: p.sector_size,
            sectors_per_track: p.sectors_per_track,
            gap_length: p.gap_length,
            format_gap_length: p.format_gap_length,
            format_filler: p.format_filler,
            srt: p.srt,
            hlt: p.hlt,
            hut: p.hut,
            data_rate_kbps: p.data_rate.kbps(),
            fm: p.fm as u8,
            double_stepping: p.double_stepping as u8,
            disk_change_line: p.disk_change_line as u8,
            perpendicular: p.perpendicular as u8,
            use_fat12: p.filesystem.use_fat12 as u8,
            use_cpmfs: p.filesystem.use_cpmfs as u8,
            fat_media_descriptor: p.filesystem.fat_media_descriptor,
            fat_root_dir_entries: p.filesystem.fat_root_dir_entries,
            fat_cluster_size: p.filesystem.fat_cluster_size,
        }
    }
}

impl TryFrom<MediaParamsBlob> for DriveMediaParams {
    type Error = FdcError;

    fn try_from(b: MediaParamsBlob) -> Result<Self, Self::Error> {
        Ok(Self {
            drive_number: b.drive_number & 0x03,
            drive_size: DriveSize::try_from(b.drive_inches).map_err(FdcError::Protocol)?,
            cylinders: b.cylinders,
            heads: b.heads.clamp(1, 2),
            sector_size: b.sector_size,
            sectors_per_track: b.sectors_per_track,
            gap_length: b.gap_length,
            format_gap_length: b.format_gap_length,
            format_filler: b.format_filler,
            srt: b.srt,
            hlt: b.hlt,
            hut: b.hut,
            data_rate: DataRate::try_from(b.data_rate_kbps).map_err(FdcError::Protocol)?,
            fm: b.fm != 0,
            double_stepping: b.double_stepping != 0,
            disk_change_line: b.disk_change_line != 0,
            perpendicular: b.perpendicular != 0,
            filesystem: FilesystemHints {
                use_fat12: b.use_fat12 != 0,
                use_cpmfs: b.use_cpmfs != 0,
                fat_media_descriptor: b.fat_media_descriptor,
                fat_root_dir_entries: b.fat_root_dir_entries,
                fat_cluster_size: b.fat_cluster_size,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_size_codes() {
        for code in 0..=MAX_SECTOR_SIZE_CODE {
            assert_eq!(sector_size_code(sector_size_bytes(code)), code);
        }
        assert_eq!(sector_size_code(300), 2);
        assert_eq!(sector_size_bytes(6), 8192);
    }

    #[test]
    fn test_params_blob() {
        let mut params = DriveMediaParams::pc_360k(1);
        params.double_stepping = true;
        let bytes = params.to_bytes().unwrap();
        assert_eq!(bytes.len(), MEDIA_PARAMS_BLOB_LEN);
        // sector size is stored little endian at offset 4
        assert_eq!(&bytes[4..6], &[0x00, 0x02]);
        let decoded = DriveMediaParams::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_params_blob_rejects_bad_rate() {
        let mut bytes = DriveMediaParams::pc_1440k(0).to_bytes().unwrap();
        // data rate lives at offset 15
        bytes[15] = 0x99;
        bytes[16] = 0x00;
        assert!(DriveMediaParams::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_logical_cylinders() {
        let mut params = DriveMediaParams::pc_1440k(0);
        assert_eq!(params.logical_cylinders(), 80);
        params.double_stepping = true;
        assert_eq!(params.logical_cylinders(), 40);
        assert_eq!(params.drive_letter(), 'A');
    }

    #[test]
    fn test_drr_bits() {
        assert_eq!(DataRate::Rate500.drr_bits(), 0);
        assert_eq!(DataRate::Rate300.drr_bits(), 1);
        assert_eq!(DataRate::Rate250.drr_bits(), 2);
        assert_eq!(DataRate::Rate1000.drr_bits(), 3);
        assert_eq!(DataRate::from_drr_bits(2), DataRate::Rate250);
    }
}
