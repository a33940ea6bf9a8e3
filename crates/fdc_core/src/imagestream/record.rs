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

    imagestream::record.rs

    ImageDisk record grammar: track modes, sector record types, and a whole-image
    parser used to inspect and trim captured streams.
*/

use std::fmt;

use strum_macros::{Display, FromRepr};

use crate::{
    device_types::media::{sector_size_bytes, DataRate, MAX_SECTORS_PER_TRACK, MAX_SECTOR_SIZE_CODE},
    devices::fdc::error::FdcError,
};

/// ASCII EOF. Ends the header, and in the mode position ends the stream.
pub const IMD_EOF: u8 = 0x1A;
pub const IMD_SIGNATURE: &[u8; 4] = b"IMD ";
pub const HEAD_CYLINDER_MAP: u8 = 0x80;
pub const HEAD_HEAD_MAP: u8 = 0x40;
pub const HEAD_MASK: u8 = 0x3F;
pub const IMAGE_VERSION: &str = "IMD 1.18";

/// Recording mode byte at the start of each track.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum TrackMode {
    #[strum(to_string = "500kbps FM")]
    Fm500 = 0,
    #[strum(to_string = "300kbps FM")]
    Fm300 = 1,
    #[strum(to_string = "250kbps FM")]
    Fm250 = 2,
    #[strum(to_string = "500kbps MFM")]
    Mfm500 = 3,
    #[strum(to_string = "300kbps MFM")]
    Mfm300 = 4,
    #[strum(to_string = "250kbps MFM")]
    Mfm250 = 5,
}

impl TrackMode {
    /// Mode for a controller rate and encoding. 1Mbps has no IMD mode.
    pub fn new(rate: DataRate, fm: bool) -> Option<Self> {
        let mode = match (rate, fm) {
            (DataRate::Rate500, true) => TrackMode::Fm500,
            (DataRate::Rate300, true) => TrackMode::Fm300,
            (DataRate::Rate250, true) => TrackMode::Fm250,
            (DataRate::Rate500, false) => TrackMode::Mfm500,
            (DataRate::Rate300, false) => TrackMode::Mfm300,
            (DataRate::Rate250, false) => TrackMode::Mfm250,
            (DataRate::Rate1000, _) => return None,
        };
        Some(mode)
    }

    pub fn rate(&self) -> DataRate {
        match self {
            TrackMode::Fm500 | TrackMode::Mfm500 => DataRate::Rate500,
            TrackMode::Fm300 | TrackMode::Mfm300 => DataRate::Rate300,
            TrackMode::Fm250 | TrackMode::Mfm250 => DataRate::Rate250,
        }
    }

    pub fn fm(&self) -> bool {
        (*self as u8) < 3
    }
}

/// Type byte in front of every sector record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum RecordType {
    Unavailable = 0,
    Raw = 1,
    Compressed = 2,
    RawDeleted = 3,
    CompressedDeleted = 4,
    RawError = 5,
    CompressedError = 6,
    RawDeletedError = 7,
    CompressedDeletedError = 8,
}

impl RecordType {
    pub fn has_data(&self) -> bool {
        *self != RecordType::Unavailable
    }

    /// A single fill byte follows instead of the sector data.
    pub fn compressed(&self) -> bool {
        self.has_data() && (*self as u8) % 2 == 0
    }

    pub fn deleted(&self) -> bool {
        matches!(
            self,
            RecordType::RawDeleted
                | RecordType::CompressedDeleted
                | RecordType::RawDeletedError
                | RecordType::CompressedDeletedError
        )
    }

    /// Data was read with an error when the image was captured.
    pub fn error(&self) -> bool {
        (*self as u8) >= RecordType::RawError as u8
    }

    /// Payload length in the stream for a sector of `sector_size` bytes.
    pub fn payload_len(&self, sector_size: usize) -> usize {
        match self {
            RecordType::Unavailable => 0,
            t if t.compressed() => 1,
            _ => sector_size,
        }
    }

    fn from_flags(compressed: bool, deleted: bool, error: bool) -> Self {
        let base = 1 + compressed as u8 + (deleted as u8) * 2 + (error as u8) * 4;
        RecordType::from_repr(base).unwrap_or(RecordType::Unavailable)
    }
}

/// One sector's record, as held while it is being sent or written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSectorRecord {
    Unavailable,
    Raw(Vec<u8>),
    Compressed(u8),
    RawDeleted(Vec<u8>),
    CompressedDeleted(u8),
    RawError(Vec<u8>),
    CompressedError(u8),
    RawDeletedError(Vec<u8>),
    CompressedDeletedError(u8),
}

impl ImageSectorRecord {
    /// Build the record for a sector just read. A failed read that left the buffer all zero
    /// had no data at all.
    pub fn classify(data: &[u8], deleted: bool, error: bool) -> Self {
        let first = data.first().copied().unwrap_or(0);
        let uniform = data.iter().all(|&b| b == first);
        if error && uniform && first == 0 {
            return ImageSectorRecord::Unavailable;
        }
        let record_type = RecordType::from_flags(uniform, deleted, error);
        let payload = if uniform { vec![first] } else { data.to_vec() };
        Self::from_parts(record_type, payload)
    }

    /// Build a record from its type and the payload bytes that followed it in the stream.
    pub fn from_parts(record_type: RecordType, payload: Vec<u8>) -> Self {
        let fill = payload.first().copied().unwrap_or(0);
        match record_type {
            RecordType::Unavailable => ImageSectorRecord::Unavailable,
            RecordType::Raw => ImageSectorRecord::Raw(payload),
            RecordType::Compressed => ImageSectorRecord::Compressed(fill),
            RecordType::RawDeleted => ImageSectorRecord::RawDeleted(payload),
            RecordType::CompressedDeleted => ImageSectorRecord::CompressedDeleted(fill),
            RecordType::RawError => ImageSectorRecord::RawError(payload),
            RecordType::CompressedError => ImageSectorRecord::CompressedError(fill),
            RecordType::RawDeletedError => ImageSectorRecord::RawDeletedError(payload),
            RecordType::CompressedDeletedError => ImageSectorRecord::CompressedDeletedError(fill),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            ImageSectorRecord::Unavailable => RecordType::Unavailable,
            ImageSectorRecord::Raw(_) => RecordType::Raw,
            ImageSectorRecord::Compressed(_) => RecordType::Compressed,
            ImageSectorRecord::RawDeleted(_) => RecordType::RawDeleted,
            ImageSectorRecord::CompressedDeleted(_) => RecordType::CompressedDeleted,
            ImageSectorRecord::RawError(_) => RecordType::RawError,
            ImageSectorRecord::CompressedError(_) => RecordType::CompressedError,
            ImageSectorRecord::RawDeletedError(_) => RecordType::RawDeletedError,
            ImageSectorRecord::CompressedDeletedError(_) => RecordType::CompressedDeletedError,
        }
    }

    /// Full sector contents, or `None` for an unavailable sector.
    pub fn data(&self, sector_size: usize) -> Option<Vec<u8>> {
        match self {
            ImageSectorRecord::Unavailable => None,
            ImageSectorRecord::Raw(d)
            | ImageSectorRecord::RawDeleted(d)
            | ImageSectorRecord::RawError(d)
            | ImageSectorRecord::RawDeletedError(d) => {
                let mut data = d.clone();
                data.resize(sector_size, 0);
                Some(data)
            }
            ImageSectorRecord::Compressed(b)
            | ImageSectorRecord::CompressedDeleted(b)
            | ImageSectorRecord::CompressedError(b)
            | ImageSectorRecord::CompressedDeletedError(b) => Some(vec![*b; sector_size]),
        }
    }

    /// Append the type byte and payload.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.record_type() as u8);
        match self {
            ImageSectorRecord::Unavailable => {}
            ImageSectorRecord::Raw(d)
            | ImageSectorRecord::RawDeleted(d)
            | ImageSectorRecord::RawError(d)
            | ImageSectorRecord::RawDeletedError(d) => out.extend_from_slice(d),
            ImageSectorRecord::Compressed(b)
            | ImageSectorRecord::CompressedDeleted(b)
            | ImageSectorRecord::CompressedError(b)
            | ImageSectorRecord::CompressedDeletedError(b) => out.push(*b),
        }
    }
}

/// A whole track as it appears in the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageTrackRecord {
    /// No sector IDs could be read. Only the five header bytes are present.
    Unreadable { mode: u8, cylinder: u8, head: u8 },
    Readable {
        mode: TrackMode,
        cylinder: u8,
        head: u8,
        sector_size_code: u8,
        sector_numbering_map: Vec<u8>,
        cylinder_map: Option<Vec<u8>>,
        head_map: Option<Vec<u8>>,
        sector_records: Vec<ImageSectorRecord>,
    },
}

impl ImageTrackRecord {
    pub fn cylinder(&self) -> u8 {
        match self {
            ImageTrackRecord::Unreadable { cylinder, .. } | ImageTrackRecord::Readable { cylinder, .. } => *cylinder,
        }
    }

    pub fn head(&self) -> u8 {
        match self {
            ImageTrackRecord::Unreadable { head, .. } | ImageTrackRecord::Readable { head, .. } => *head,
        }
    }

    pub fn sectors_per_track(&self) -> u8 {
        match self {
            ImageTrackRecord::Unreadable { .. } => 0,
            ImageTrackRecord::Readable {
                sector_numbering_map, ..
            } => sector_numbering_map.len() as u8,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ImageTrackRecord::Unreadable { mode, cylinder, head } => {
                out.extend_from_slice(&[*mode, *cylinder, *head & HEAD_MASK, 0, 0]);
            }
            ImageTrackRecord::Readable {
                mode,
                cylinder,
                head,
                sector_size_code,
                sector_numbering_map,
                cylinder_map,
                head_map,
                sector_records,
            } => {
                let mut flags = *head & HEAD_MASK;
                if cylinder_map.is_some() {
                    flags |= HEAD_CYLINDER_MAP;
                }
                if head_map.is_some() {
                    flags |= HEAD_HEAD_MAP;
                }
                out.extend_from_slice(&[
                    *mode as u8,
                    *cylinder,
                    flags,
                    sector_numbering_map.len() as u8,
                    *sector_size_code,
                ]);
                out.extend_from_slice(sector_numbering_map);
                if let Some(map) = cylinder_map {
                    out.extend_from_slice(map);
                }
                if let Some(map) = head_map {
                    out.extend_from_slice(map);
                }
                for record in sector_records {
                    record.encode(out);
                }
            }
        }
    }
}

/// Build the text header: signature, an identification line, the comment lines, then EOF.
pub fn make_header(comment: &str) -> Vec<u8> {
    let mut header = format!("{}: MegaFDC\r\n", IMAGE_VERSION);
    for line in comment.lines() {
        header.push_str(line);
        header.push_str("\r\n");
    }
    let mut bytes = header.into_bytes();
    // EOF inside the comment would end the header early.
    bytes.retain(|&b| b != IMD_EOF);
    bytes.push(IMD_EOF);
    bytes
}

/// A fully parsed image.
#[derive(Clone, Debug)]
pub struct ParsedImage {
    /// Header text without the signature line terminator or EOF.
    pub header: String,
    pub tracks: Vec<ImageTrackRecord>,
    /// Bytes up to and including the last complete track. Anything after it is padding.
    pub length: usize,
}

impl ParsedImage {
    pub fn sector_count(&self) -> usize {
        self.tracks.iter().map(|t| t.sectors_per_track() as usize).sum()
    }

    pub fn bad_sector_count(&self) -> usize {
        self.tracks
            .iter()
            .filter_map(|t| match t {
                ImageTrackRecord::Readable { sector_records, .. } => Some(sector_records),
                _ => None,
            })
            .flatten()
            .filter(|r| r.record_type().error())
            .count()
    }
}

impl fmt::Display for ParsedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unreadable = self
            .tracks
            .iter()
            .filter(|t| matches!(t, ImageTrackRecord::Unreadable { .. }))
            .count();
        writeln!(f, "{}", self.header.lines().next().unwrap_or(""))?;
        write!(
            f,
            "Tracks: {} ({} unreadable), sectors: {} ({} bad), length: {} bytes",
            self.tracks.len(),
            unreadable,
            self.sector_count(),
            self.bad_sector_count(),
            self.length
        )
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }
}

fn protocol(message: &str) -> FdcError {
    FdcError::Protocol(message.to_string())
}

/// Parse a complete image held in memory. Parsing stops at an EOF in the mode position, at the
/// end of the data, or at a track cut short; trailing transfer padding is ignored.
pub fn parse_image(stream: &[u8]) -> Result<ParsedImage, FdcError> {
    if !stream.starts_with(IMD_SIGNATURE) {
        return Err(protocol("Invalid image header"));
    }
    let header_end = stream
        .iter()
        .position(|&b| b == IMD_EOF)
        .ok_or_else(|| protocol("Image header is not terminated"))?;
    let header = String::from_utf8_lossy(&stream[..header_end]).trim_end().to_string();

    let mut cursor = Cursor {
        data: stream,
        pos: header_end + 1,
    };
    let mut tracks = Vec::new();
    let mut length = cursor.pos;

    while let Some(track) = parse_track(&mut cursor)? {
        tracks.push(track);
        length = cursor.pos;
    }

    Ok(ParsedImage { header, tracks, length })
}

fn parse_track(cursor: &mut Cursor) -> Result<Option<ImageTrackRecord>, FdcError> {
    let Some(mode) = cursor.byte()
    else {
        return Ok(None);
    };
    if mode == IMD_EOF {
        return Ok(None);
    }
    let mode_value = TrackMode::from_repr(mode).ok_or_else(|| protocol("Invalid track mode"))?;

    let Some(&[cylinder, head, spt, size_code]) = cursor.take(4)
    else {
        return Ok(None);
    };
    if head & HEAD_MASK > 1 {
        return Err(protocol("Invalid head number"));
    }
    if spt > MAX_SECTORS_PER_TRACK {
        return Err(protocol("Too many sectors per track"));
    }
    if size_code > MAX_SECTOR_SIZE_CODE {
        return Err(protocol("Invalid sector size"));
    }
    if spt == 0 {
        return Ok(Some(ImageTrackRecord::Unreadable { mode, cylinder, head }));
    }

    let n = spt as usize;
    let Some(numbering) = cursor.take(n)
    else {
        return Ok(None);
    };
    let cylinder_map = match head & HEAD_CYLINDER_MAP {
        0 => None,
        _ => match cursor.take(n) {
            Some(map) => Some(map.to_vec()),
            None => return Ok(None),
        },
    };
    let head_map = match head & HEAD_HEAD_MAP {
        0 => None,
        _ => match cursor.take(n) {
            Some(map) => Some(map.to_vec()),
            None => return Ok(None),
        },
    };

    let sector_size = sector_size_bytes(size_code);
    let mut sector_records = Vec::with_capacity(n);
    for _ in 0..n {
        let Some(type_byte) = cursor.byte()
        else {
            return Ok(None);
        };
        let record_type = RecordType::from_repr(type_byte).ok_or_else(|| protocol("Invalid sector record"))?;
        let Some(payload) = cursor.take(record_type.payload_len(sector_size))
        else {
            return Ok(None);
        };
        sector_records.push(ImageSectorRecord::from_parts(record_type, payload.to_vec()));
    }

    Ok(Some(ImageTrackRecord::Readable {
        mode: mode_value,
        cylinder,
        head: head & HEAD_MASK,
        sector_size_code: size_code,
        sector_numbering_map: numbering.to_vec(),
        cylinder_map,
        head_map,
        sector_records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_track(cylinder: u8) -> ImageTrackRecord {
        ImageTrackRecord::Readable {
            mode: TrackMode::Mfm250,
            cylinder,
            head: 0,
            sector_size_code: 0,
            sector_numbering_map: vec![1, 3, 2],
            cylinder_map: Some(vec![cylinder + 1; 3]),
            head_map: None,
            sector_records: vec![
                ImageSectorRecord::Compressed(0xE5),
                ImageSectorRecord::Raw((0..128).collect()),
                ImageSectorRecord::Unavailable,
            ],
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            ImageSectorRecord::classify(&[0xF6; 512], false, false),
            ImageSectorRecord::Compressed(0xF6)
        );
        assert_eq!(
            ImageSectorRecord::classify(&[0x00; 512], true, false),
            ImageSectorRecord::CompressedDeleted(0x00)
        );
        assert_eq!(
            ImageSectorRecord::classify(&[0x00; 512], false, true),
            ImageSectorRecord::Unavailable
        );
        assert_eq!(
            ImageSectorRecord::classify(&[0x11; 4], true, true).record_type(),
            RecordType::CompressedDeletedError
        );
        assert_eq!(
            ImageSectorRecord::classify(&[1, 2, 3], false, true).record_type(),
            RecordType::RawError
        );
        assert_eq!(
            ImageSectorRecord::classify(&[1, 2, 3], true, false).record_type(),
            RecordType::RawDeleted
        );
    }

    #[test]
    fn test_record_type_flags() {
        assert!(RecordType::CompressedDeleted.compressed());
        assert!(RecordType::CompressedDeleted.deleted());
        assert!(!RecordType::CompressedDeleted.error());
        assert!(RecordType::RawDeletedError.error());
        assert!(!RecordType::Unavailable.compressed());
        assert_eq!(RecordType::RawError.payload_len(256), 256);
        assert_eq!(RecordType::CompressedError.payload_len(256), 1);
        assert_eq!(RecordType::Unavailable.payload_len(256), 0);
    }

    #[test]
    fn test_track_modes() {
        assert_eq!(TrackMode::new(DataRate::Rate250, false), Some(TrackMode::Mfm250));
        assert_eq!(TrackMode::new(DataRate::Rate500, true), Some(TrackMode::Fm500));
        assert_eq!(TrackMode::new(DataRate::Rate1000, false), None);
        assert!(TrackMode::Fm250.fm());
        assert!(!TrackMode::Mfm500.fm());
        assert_eq!(TrackMode::Mfm300.rate(), DataRate::Rate300);
        assert_eq!(TrackMode::Fm300.to_string(), "300kbps FM");
    }

    #[test]
    fn test_header() {
        let header = make_header("first\nsecond");
        assert!(header.starts_with(IMD_SIGNATURE));
        assert_eq!(header.last(), Some(&IMD_EOF));
        assert_eq!(header.iter().filter(|&&b| b == IMD_EOF).count(), 1);
        assert!(String::from_utf8_lossy(&header).contains("second\r\n"));
    }

    #[test]
    fn test_parse_ignores_padding() {
        let mut stream = make_header("");
        sample_track(0).encode(&mut stream);
        ImageTrackRecord::Unreadable {
            mode: 0,
            cylinder: 0,
            head: 1,
        }
        .encode(&mut stream);
        sample_track(1).encode(&mut stream);
        let length = stream.len();
        stream.resize(length + 100, IMD_EOF);

        let parsed = parse_image(&stream).unwrap();
        assert_eq!(parsed.length, length);
        assert_eq!(parsed.tracks.len(), 3);
        assert_eq!(parsed.tracks[2], sample_track(1));
        assert_eq!(parsed.sector_count(), 6);
        assert_eq!(parsed.bad_sector_count(), 0);
    }

    #[test]
    fn test_parse_truncated() {
        let mut stream = make_header("");
        sample_track(0).encode(&mut stream);
        let complete = stream.len();
        sample_track(1).encode(&mut stream);
        stream.truncate(stream.len() - 10);

        let parsed = parse_image(&stream).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        assert_eq!(parsed.length, complete);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(parse_image(b"XMD 1.18\x1A").is_err());
        let mut stream = make_header("");
        stream.extend_from_slice(&[6, 0, 0, 0, 0]);
        assert!(parse_image(&stream).is_err());
        let mut stream = make_header("");
        stream.extend_from_slice(&[3, 0, 0, 1, 2, 1, 9]);
        assert!(parse_image(&stream).is_err());
    }
}
