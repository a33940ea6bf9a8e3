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

    imagestream::writer.rs

    Writes an incoming IMD stream to disk.
    
    Every track is formatted with the sector IDs from its maps before its
    sectors are written, so the result reproduces the source layout including
    skew and foreign cylinder or head IDs.
*/

use crate::{
    clock::Clock,
    device_types::media::{sector_size_bytes, DataRate, MAX_SECTORS_PER_TRACK, MAX_SECTOR_SIZE_CODE},
    devices::fdc::{
        driver::{ControllerDriver, TransferOptions, MAX_TRANSFER_SIZE_CODE},
        error::FdcError,
        registers::RegisterPort,
    },
    geometry::{gaps::compute_gaps, interleave::skew_factor, report::GeometryReport},
    imagestream::{
        record::{
            ImageSectorRecord,
            RecordType,
            TrackMode,
            HEAD_CYLINDER_MAP,
            HEAD_HEAD_MAP,
            HEAD_MASK,
            IMD_EOF,
            IMD_SIGNATURE,
        },
        StreamOptions,
        TransferReport,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WriteState {
    Signature(usize),
    Comment,
    Mode,
    Cylinder,
    Head,
    SectorsPerTrack,
    SizeCode,
    NumberingMap,
    CylinderMap,
    HeadMap,
    RecordType,
    Payload(RecordType),
    Finished,
}

pub struct ImageWriter {
    options: StreamOptions,
    state: WriteState,

    mode: Option<TrackMode>,
    cylinder: u8,
    head: u8,
    flags: u8,
    spt: Option<u8>,
    size_code: Option<u8>,
    interleave: u8,

    numbering: Vec<u8>,
    cylinder_map: Vec<u8>,
    head_map: Vec<u8>,
    payload: Vec<u8>,
    sector_index: usize,

    skip_track: bool,
    geometry_changed: bool,
    seek_indicated: bool,
    report: TransferReport,
}

impl ImageWriter {
    pub fn new(options: StreamOptions) -> Self {
        Self {
            options,
            state: WriteState::Signature(0),
            mode: None,
            cylinder: 0,
            head: 0,
            flags: 0,
            spt: None,
            size_code: None,
            interleave: 1,
            numbering: Vec::new(),
            cylinder_map: Vec::new(),
            head_map: Vec::new(),
            payload: Vec::new(),
            sector_index: 0,
            skip_track: false,
            geometry_changed: true,
            seek_indicated: true,
            report: TransferReport::default(),
        }
    }

    pub fn report(&self) -> &TransferReport {
        &self.report
    }

    /// Interleave of the current track's numbering map.
    pub fn interleave(&self) -> u8 {
        self.interleave
    }

    pub fn is_finished(&self) -> bool {
        self.state == WriteState::Finished
    }

    /// Feed the next piece of the stream. Returns false once the transfer is over, either at
    /// the end of the image or on an error; the report tells which.
    pub fn consume<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        data: &[u8],
    ) -> Result<bool, FdcError> {
        for &byte in data {
            if !self.push(driver, byte)? {
                self.state = WriteState::Finished;
                return Ok(false);
            }
        }
        Ok(self.state != WriteState::Finished)
    }

    /// Close the transfer and hand back the report. A stream that stops between tracks is
    /// complete; one that stops inside a track is not.
    pub fn finish(mut self) -> TransferReport {
        match self.state {
            WriteState::Finished => {}
            WriteState::Mode => self.report.succeed(),
            _ => self.report.fail("Image ended in the middle of a track"),
        }
        self.report
    }

    fn abort(&mut self, message: impl Into<String>) -> Result<bool, FdcError> {
        self.report.fail(message);
        Ok(false)
    }

    fn sector_size(&self) -> usize {
        sector_size_bytes(self.size_code.unwrap_or(0))
    }

    fn map_len(&self) -> usize {
        self.spt.unwrap_or(0) as usize
    }

    fn push<P: RegisterPort, C: Clock>(&mut self, driver: &mut ControllerDriver<P, C>, byte: u8) -> Result<bool, FdcError> {
        match self.state {
            WriteState::Signature(n) => {
                if IMD_SIGNATURE.get(n) != Some(&byte) {
                    return self.abort("Invalid image header");
                }
                self.state = if n + 1 == IMD_SIGNATURE.len() {
                    WriteState::Comment
                }
                else {
                    WriteState::Signature(n + 1)
                };
            }
            WriteState::Comment => {
                if byte == IMD_EOF {
                    self.state = WriteState::Mode;
                }
            }
            WriteState::Mode => {
                if byte == IMD_EOF {
                    log::debug!("ImageWriter: end of image");
                    self.report.succeed();
                    return Ok(false);
                }
                let Some(mode) = TrackMode::from_repr(byte)
                else {
                    return self.abort("Invalid track mode");
                };
                if self.mode != Some(mode) {
                    self.mode = Some(mode);
                    self.geometry_changed = true;
                }
                self.state = WriteState::Cylinder;
            }
            WriteState::Cylinder => {
                if byte >= driver.cylinder_count() {
                    return self.abort(format!("Cylinder {} is beyond the drive's last cylinder", byte));
                }
                self.cylinder = byte;
                self.state = WriteState::Head;
            }
            WriteState::Head => {
                if byte & HEAD_MASK > 1 {
                    return self.abort("Invalid head number");
                }
                self.flags = byte & !HEAD_MASK;
                self.head = byte & HEAD_MASK;
                self.state = WriteState::SectorsPerTrack;
            }
            WriteState::SectorsPerTrack => {
                if byte > MAX_SECTORS_PER_TRACK {
                    return self.abort("Too many sectors per track");
                }
                if self.spt != Some(byte) {
                    self.spt = Some(byte);
                    self.geometry_changed = true;
                }
                self.state = WriteState::SizeCode;
            }
            WriteState::SizeCode => {
                if byte > MAX_SECTOR_SIZE_CODE {
                    return self.abort("Invalid sector size");
                }
                if byte > MAX_TRANSFER_SIZE_CODE {
                    return self.abort(format!(
                        "{}: {} byte sectors do not fit the sector buffer",
                        FdcError::ResourceExhaustion,
                        sector_size_bytes(byte)
                    ));
                }
                if self.size_code != Some(byte) {
                    self.size_code = Some(byte);
                    self.geometry_changed = true;
                }

                if self.spt == Some(0) {
                    log::debug!("ImageWriter: cylinder {} head {} unreadable in image", self.cylinder, self.head);
                    self.report.unreadable_tracks += 1;
                    self.report.tracks += 1;
                    self.geometry_changed = true;
                    self.state = WriteState::Mode;
                }
                else {
                    self.numbering = Vec::with_capacity(self.map_len());
                    self.state = WriteState::NumberingMap;
                }
            }
            WriteState::NumberingMap => {
                self.numbering.push(byte);
                if self.numbering.len() == self.map_len() {
                    let interleave = skew_factor(&self.numbering, self.map_len() as u8).unwrap_or(1);
                    if interleave != self.interleave {
                        self.interleave = interleave;
                        self.geometry_changed = true;
                    }
                    return self.next_map(driver);
                }
            }
            WriteState::CylinderMap => {
                self.cylinder_map.push(byte);
                if self.cylinder_map.len() == self.map_len() {
                    return self.next_map(driver);
                }
            }
            WriteState::HeadMap => {
                self.head_map.push(byte);
                if self.head_map.len() == self.map_len() {
                    return self.next_map(driver);
                }
            }
            WriteState::RecordType => {
                let Some(record_type) = RecordType::from_repr(byte)
                else {
                    return self.abort("Invalid sector record");
                };
                self.payload.clear();
                if record_type.payload_len(self.sector_size()) == 0 {
                    return self.finish_sector(driver, record_type);
                }
                self.state = WriteState::Payload(record_type);
            }
            WriteState::Payload(record_type) => {
                self.payload.push(byte);
                if self.payload.len() == record_type.payload_len(self.sector_size()) {
                    return self.finish_sector(driver, record_type);
                }
            }
            WriteState::Finished => return Ok(false),
        }
        Ok(true)
    }

    /// Move on to the next optional map, or start the track once all are in.
    fn next_map<P: RegisterPort, C: Clock>(&mut self, driver: &mut ControllerDriver<P, C>) -> Result<bool, FdcError> {
        let n = self.map_len();
        if self.flags & HEAD_CYLINDER_MAP != 0 && self.cylinder_map.len() < n {
            self.cylinder_map = Vec::with_capacity(n);
            self.state = WriteState::CylinderMap;
            return Ok(true);
        }
        if self.flags & HEAD_HEAD_MAP != 0 && self.head_map.len() < n {
            self.head_map = Vec::with_capacity(n);
            self.state = WriteState::HeadMap;
            return Ok(true);
        }
        self.begin_track(driver)
    }

    /// Seek, apply any geometry change and format the track from the maps.
    fn begin_track<P: RegisterPort, C: Clock>(&mut self, driver: &mut ControllerDriver<P, C>) -> Result<bool, FdcError> {
        self.sector_index = 0;
        self.state = WriteState::RecordType;
        self.skip_track = driver.head_count() == 1 && self.head > 0;
        if self.skip_track {
            log::debug!("ImageWriter: skipping cylinder {} head {} on a single sided drive", self.cylinder, self.head);
            return Ok(true);
        }

        if driver.current_cylinder() != self.cylinder || driver.current_head() != self.head {
            driver.seek_drive(self.cylinder, self.head)?;
            self.seek_indicated = true;
        }

        if self.geometry_changed {
            self.apply_geometry(driver)?;
        }

        if self.seek_indicated {
            log::info!("Writing cylinder {} head {}", self.cylinder, self.head);
            let size_code = self.size_code.unwrap_or(0);
            for (i, entry) in driver.buffer_mut().chunks_exact_mut(4).take(self.numbering.len()).enumerate() {
                let cylinder = self.cylinder_map.get(i).copied().unwrap_or(self.cylinder);
                let head = self.head_map.get(i).copied().unwrap_or(self.head);
                entry.copy_from_slice(&[cylinder, head, self.numbering[i], size_code]);
            }

            if !driver.format_track(true, self.interleave)? {
                if driver.no_disk() {
                    return self.abort(FdcError::NoMediumPresent.to_string());
                }
                if driver.write_protected() {
                    return self.abort(FdcError::WriteProtected.to_string());
                }
            }
        }

        self.geometry_changed = false;
        self.seek_indicated = false;
        Ok(true)
    }

    fn apply_geometry<P: RegisterPort, C: Clock>(&mut self, driver: &mut ControllerDriver<P, C>) -> Result<(), FdcError> {
        let Some(mode) = self.mode
        else {
            return Ok(());
        };
        let rate = match mode.rate() {
            DataRate::Rate250 if self.options.xlat_300_250 => DataRate::Rate300,
            rate => rate,
        };

        let params = driver.params_mut();
        params.data_rate = rate;
        params.fm = mode.fm();
        params.format_filler = params.default_filler();
        params.sectors_per_track = self.spt.unwrap_or(0);
        params.sector_size = self.sector_size() as u16;
        if self.options.auto_gaps {
            let (gap, format_gap) = compute_gaps(params);
            params.gap_length = gap;
            params.format_gap_length = format_gap;
        }
        driver.set_communication_rate()?;

        self.report.geometry_changes += 1;
        log::info!(
            "{}",
            GeometryReport::new(driver.params(), self.cylinder, self.head, self.interleave, self.options.auto_gaps)
        );
        Ok(())
    }

    fn finish_sector<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        record_type: RecordType,
    ) -> Result<bool, FdcError> {
        let record = ImageSectorRecord::from_parts(record_type, std::mem::take(&mut self.payload));
        let mut write = record_type.has_data();
        if record_type.error() {
            self.report.bad_sectors_in_file += 1;
            if self.options.skip_bad_sectors {
                write = false;
            }
        }

        if write && !self.skip_track && !self.write_sector(driver, &record)? {
            return Ok(false);
        }

        self.sector_index += 1;
        if self.sector_index < self.numbering.len() {
            self.state = WriteState::RecordType;
            return Ok(true);
        }

        self.report.tracks += 1;
        self.numbering = Vec::new();
        self.cylinder_map = Vec::new();
        self.head_map = Vec::new();
        self.state = WriteState::Mode;
        Ok(true)
    }

    /// Write one sector and optionally verify it. False if the transfer has to stop.
    fn write_sector<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        record: &ImageSectorRecord,
    ) -> Result<bool, FdcError> {
        let i = self.sector_index;
        let sector = self.numbering[i];
        let cylinder = self.cylinder_map.get(i).copied().unwrap_or(self.cylinder);
        let head = self.head_map.get(i).copied().unwrap_or(self.head);
        let size = self.sector_size();

        if let Some(data) = record.data(size) {
            driver.buffer_mut()[..size].copy_from_slice(&data);
        }
        let options = TransferOptions::logical(cylinder, head).with_deleted_mark(record.record_type().deleted());
        let mut good = driver.read_write_sectors(true, sector, sector, options)? > 0;

        if driver.last_error() && driver.no_disk() {
            return self.abort(FdcError::NoMediumPresent.to_string());
        }
        if driver.last_error() && driver.write_protected() {
            return self.abort(FdcError::WriteProtected.to_string());
        }

        if good && self.options.verify {
            good = driver.verify(sector, false, Some(cylinder), Some(head))? > 0;
            if driver.last_error() && driver.no_disk() {
                return self.abort(FdcError::NoMediumPresent.to_string());
            }
        }

        if !good {
            log::warn!("ImageWriter: sector {} of cylinder {} head {} failed", sector, self.cylinder, self.head);
            self.report.bad_sectors_on_disk += 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::VirtualClock,
        device_types::media::DriveMediaParams,
        devices::fdc::sim::{SimDisk, SimulatedController},
        imagestream::record::{make_header, ImageTrackRecord},
    };

    type SimDriver = ControllerDriver<SimulatedController, VirtualClock>;

    fn driver_with(disk: SimDisk, heads: u8) -> SimDriver {
        let mut params = DriveMediaParams::pc_360k(0);
        params.cylinders = 3;
        params.heads = heads;
        let clock = VirtualClock::new();
        let mut sim = SimulatedController::new(clock.clone());
        sim.insert_disk(0, disk);
        let mut driver = ControllerDriver::new(sim, clock);
        driver.set_active_drive(params).unwrap();
        driver
    }

    fn track(cylinder: u8, head: u8, size_code: u8, records: Vec<ImageSectorRecord>) -> ImageTrackRecord {
        ImageTrackRecord::Readable {
            mode: TrackMode::Mfm250,
            cylinder,
            head,
            sector_size_code: size_code,
            sector_numbering_map: (1..=records.len() as u8).collect(),
            cylinder_map: None,
            head_map: None,
            sector_records: records,
        }
    }

    fn filled(spt: u8, base: u8) -> Vec<ImageSectorRecord> {
        (0..spt).map(|s| ImageSectorRecord::Compressed(base + s)).collect()
    }

    fn image(tracks: &[ImageTrackRecord]) -> Vec<u8> {
        let mut out = make_header("writer test");
        for track in tracks {
            track.encode(&mut out);
        }
        out.push(IMD_EOF);
        out
    }

    fn write(driver: &mut SimDriver, options: StreamOptions, stream: &[u8], chunk: usize) -> TransferReport {
        let mut writer = ImageWriter::new(options);
        for block in stream.chunks(chunk) {
            if !writer.consume(driver, block).unwrap() {
                break;
            }
        }
        writer.finish()
    }

    #[test]
    fn test_geometry_changes() {
        let stream = image(&[
            track(0, 0, 2, filled(9, 0x10)),
            track(0, 1, 2, filled(9, 0x20)),
            track(1, 0, 1, filled(9, 0x30)),
        ]);
        let mut driver = driver_with(SimDisk::unformatted(3), 2);
        let report = write(&mut driver, StreamOptions::default(), &stream, 128);

        assert!(report.success, "{:?}", report.message);
        assert_eq!(report.tracks, 3);
        assert_eq!(report.geometry_changes, 2);
        assert_eq!(report.bad_sectors_on_disk, 0);

        let disk = driver.port().disk(0).unwrap();
        let sector = disk.track(0, 1).unwrap().sector(4).unwrap();
        assert_eq!(sector.data, vec![0x23; 512]);
        let sector = disk.track(1, 0).unwrap().sector(9).unwrap();
        assert_eq!(sector.id.n(), 1);
        assert_eq!(sector.data, vec![0x38; 256]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut second = filled(9, 0x40);
        second[3] = ImageSectorRecord::Raw((0..=255u8).cycle().take(512).collect());
        second[6] = ImageSectorRecord::CompressedDeleted(0x99);
        let stream = image(&[track(0, 0, 2, filled(9, 0x10)), track(2, 1, 2, second)]);

        let mut whole = driver_with(SimDisk::unformatted(3), 2);
        let report_whole = write(&mut whole, StreamOptions::default(), &stream, 1024);
        let mut bytes = driver_with(SimDisk::unformatted(3), 2);
        let report_bytes = write(&mut bytes, StreamOptions::default(), &stream, 1);

        assert!(report_bytes.success);
        assert_eq!(report_whole, report_bytes);
        let a = whole.port().disk(0).unwrap().track(2, 1).unwrap();
        let b = bytes.port().disk(0).unwrap().track(2, 1).unwrap();
        for (sa, sb) in a.sectors.iter().zip(b.sectors.iter()) {
            assert_eq!(sa.id, sb.id);
            assert_eq!(sa.data, sb.data);
            assert_eq!(sa.deleted, sb.deleted);
        }
        assert!(b.sector(7).unwrap().deleted);
        assert_eq!(b.sector(4).unwrap().data[..4], [0, 1, 2, 3]);
    }

    #[test]
    fn test_foreign_ids_and_skew() {
        let records = filled(8, 0x50);
        let stream = image(&[ImageTrackRecord::Readable {
            mode: TrackMode::Mfm250,
            cylinder: 1,
            head: 0,
            sector_size_code: 2,
            sector_numbering_map: vec![1, 5, 2, 6, 3, 7, 4, 8],
            cylinder_map: Some(vec![9; 8]),
            head_map: Some(vec![1; 8]),
            sector_records: records,
        }]);
        let mut driver = driver_with(SimDisk::unformatted(3), 2);
        let mut writer = ImageWriter::new(StreamOptions::default());
        assert!(!writer.consume(&mut driver, &stream).unwrap());
        assert_eq!(writer.interleave(), 4);
        let report = writer.finish();
        assert!(report.success);

        let track = driver.port().disk(0).unwrap().track(1, 0).unwrap();
        let order: Vec<u8> = track.sectors.iter().map(|s| s.id.s()).collect();
        assert_eq!(order, vec![1, 5, 2, 6, 3, 7, 4, 8]);
        assert!(track.sectors.iter().all(|s| s.id.c() == 9 && s.id.h() == 1));
        assert_eq!(track.sector(5).unwrap().data, vec![0x51; 512]);
    }

    #[test]
    fn test_unreadable_track_in_image() {
        let mut stream = make_header("");
        ImageTrackRecord::Unreadable { mode: 0, cylinder: 0, head: 0 }.encode(&mut stream);
        track(0, 1, 2, filled(9, 0)).encode(&mut stream);

        let mut driver = driver_with(SimDisk::unformatted(3), 2);
        let report = write(&mut driver, StreamOptions::default(), &stream, 128);
        // No EOF marker, but the stream stops on a track boundary.
        assert!(report.success);
        assert_eq!(report.unreadable_tracks, 1);
        assert_eq!(report.tracks, 2);
        assert!(driver.port().disk(0).unwrap().track(0, 0).unwrap().sectors.is_empty());
    }

    #[test]
    fn test_single_sided_drive_skips_head_1() {
        let stream = image(&[track(0, 0, 2, filled(9, 1)), track(0, 1, 2, filled(9, 2))]);
        let mut driver = driver_with(SimDisk::unformatted(3), 1);
        let report = write(&mut driver, StreamOptions::default(), &stream, 64);

        assert!(report.success);
        assert_eq!(report.tracks, 2);
        let disk = driver.port().disk(0).unwrap();
        assert_eq!(disk.track(0, 0).unwrap().sectors.len(), 9);
        assert!(disk.track(0, 1).unwrap().sectors.is_empty());
    }

    #[test]
    fn test_skip_bad_sectors() {
        let mut records = filled(9, 0x60);
        records[2] = ImageSectorRecord::CompressedError(0x77);
        let stream = image(&[track(0, 0, 2, records)]);

        let mut driver = driver_with(SimDisk::unformatted(3), 2);
        let options = StreamOptions {
            skip_bad_sectors: true,
            verify: true,
            ..Default::default()
        };
        let report = write(&mut driver, options, &stream, 128);
        assert!(report.success);
        assert_eq!(report.bad_sectors_in_file, 1);
        assert_eq!(report.bad_sectors_on_disk, 0);
        let filler = driver.params().format_filler;
        let track = driver.port().disk(0).unwrap().track(0, 0).unwrap();
        assert_eq!(track.sector(3).unwrap().data, vec![filler; 512]);
        assert_eq!(track.sector(4).unwrap().data, vec![0x63; 512]);
    }

    #[test]
    fn test_rejected_streams() {
        let mut driver = driver_with(SimDisk::unformatted(3), 2);
        let report = write(&mut driver, StreamOptions::default(), b"IMG 1.18\x1a", 16);
        assert!(!report.success);
        assert_eq!(report.message.as_deref(), Some("Invalid image header"));

        let stream = image(&[track(0, 0, 5, vec![ImageSectorRecord::Unavailable])]);
        let report = write(&mut driver, StreamOptions::default(), &stream, 16);
        assert!(report.message.unwrap().starts_with("Not enough memory"));

        let stream = image(&[track(7, 0, 2, filled(9, 0))]);
        let report = write(&mut driver, StreamOptions::default(), &stream, 16);
        assert!(!report.success);

        let mut stream = make_header("");
        stream.extend_from_slice(&[9, 0, 0, 9, 2]);
        let report = write(&mut driver, StreamOptions::default(), &stream, 16);
        assert_eq!(report.message.as_deref(), Some("Invalid track mode"));
    }

    #[test]
    fn test_truncated_stream() {
        let mut stream = image(&[track(0, 0, 2, filled(9, 0))]);
        stream.truncate(stream.len() - 6);
        let mut driver = driver_with(SimDisk::unformatted(3), 2);
        let report = write(&mut driver, StreamOptions::default(), &stream, 128);
        assert!(!report.success);
        assert_eq!(report.message.as_deref(), Some("Image ended in the middle of a track"));
    }

    #[test]
    fn test_write_protected_aborts() {
        let stream = image(&[track(0, 0, 2, filled(9, 0)), track(0, 1, 2, filled(9, 0))]);
        let mut driver = driver_with(SimDisk::unformatted(3).with_write_protect(true), 2);
        let report = write(&mut driver, StreamOptions::default(), &stream, 1024);
        assert!(!report.success);
        assert_eq!(report.message.as_deref(), Some("Disk is write protected"));
        assert_eq!(report.tracks, 0);
    }
}
