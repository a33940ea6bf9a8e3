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

    imagestream::mod.rs

    Resumable ImageDisk stream codec.
    
    ImageReader turns the disk under the head into an IMD byte stream, one
    output block at a time. ImageWriter does the reverse. Both keep all of their
    progress in their own state, so blocks may be cut at any byte.
*/

use std::fmt;

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::ImageReader;
pub use record::{parse_image, ImageSectorRecord, ImageTrackRecord, ParsedImage, RecordType, TrackMode};
pub use writer::ImageWriter;

/// Settings shared by both directions of a transfer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Recompute the sector and format gaps whenever the track geometry changes.
    pub auto_gaps: bool,
    /// Write 250kbps tracks at 300kbps and label 300kbps captures as 250kbps, for 300 RPM
    /// media in a 360 RPM drive.
    pub xlat_300_250: bool,
    /// Don't write sectors the image marks as read with an error.
    pub skip_bad_sectors: bool,
    /// Read back every sector after writing it.
    pub verify: bool,
}

/// Outcome of a read or write transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub success: bool,
    pub message: Option<String>,
    pub bad_sectors_on_disk: u32,
    pub bad_sectors_in_file: u32,
    pub unreadable_tracks: u32,
    /// Number of times the track geometry was (re)applied.
    pub geometry_changes: u32,
    pub tracks: u32,
}

impl TransferReport {
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("transfer failed: {}", message);
        self.success = false;
        self.message = Some(message);
    }

    pub(crate) fn succeed(&mut self) {
        self.success = true;
        self.message = None;
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(f, "Transfer completed")?;
        }
        else {
            write!(f, "Transfer failed")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        write!(
            f,
            "\nTracks: {}, bad sectors on disk: {}, bad sectors in file: {}, unreadable tracks: {}",
            self.tracks, self.bad_sectors_on_disk, self.bad_sectors_in_file, self.unreadable_tracks
        )
    }
}
