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

    imagestream::reader.rs

    Captures the disk under the head as an IMD stream.
    
    Work is done one unit at a time: the header, a track header with its maps,
    or a single sector record. A unit is staged in a small buffer and drained
    into as many output blocks as it takes before the next one is produced.
*/

use crate::{
    clock::Clock,
    device_types::{
        chs::SectorAddress,
        media::{sector_size_bytes, DataRate, MAX_SECTORS_PER_TRACK},
    },
    devices::fdc::{
        driver::{ControllerDriver, TransferOptions, MAX_TRANSFER_SIZE_CODE},
        error::FdcError,
        registers::RegisterPort,
    },
    geometry::{gaps::compute_gaps, GeometryDetector, GeometryReport},
    imagestream::{
        record::{make_header, ImageSectorRecord, TrackMode, HEAD_CYLINDER_MAP, HEAD_HEAD_MAP, IMD_EOF},
        StreamOptions,
        TransferReport,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReadStage {
    Header,
    Track,
    Sector(usize),
    Finished,
}

pub struct ImageReader {
    options: StreamOptions,
    header: Vec<u8>,
    stage: ReadStage,
    pending: Vec<u8>,
    pending_pos: usize,

    cylinder: u8,
    head: u8,
    spt: u8,
    size_code: u8,
    interleave: u8,
    /// IDs of the current track in map order.
    ids: Vec<SectorAddress>,

    geometry_changed: bool,
    report: TransferReport,
}

impl ImageReader {
    /// `comment` goes into the image header after the identification line.
    pub fn new(options: StreamOptions, comment: &str) -> Self {
        Self {
            options,
            header: make_header(comment),
            stage: ReadStage::Header,
            pending: Vec::new(),
            pending_pos: 0,
            cylinder: 0,
            head: 0,
            spt: 0,
            size_code: 0,
            interleave: 1,
            ids: Vec::new(),
            geometry_changed: true,
            report: TransferReport::default(),
        }
    }

    pub fn report(&self) -> &TransferReport {
        &self.report
    }

    pub fn into_report(self) -> TransferReport {
        self.report
    }

    pub fn is_finished(&self) -> bool {
        self.stage == ReadStage::Finished && self.pending_pos >= self.pending.len()
    }

    /// Fill the next output block. Unused space is left as EOF padding. Returns false when
    /// there is nothing more to send, or when the transfer failed.
    pub fn fill<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        detector: &mut GeometryDetector,
        out: &mut [u8],
    ) -> Result<bool, FdcError> {
        out.fill(IMD_EOF);
        let mut pos = 0;
        loop {
            let n = (self.pending.len() - self.pending_pos).min(out.len() - pos);
            out[pos..pos + n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            pos += n;
            self.pending_pos += n;
            if pos == out.len() {
                return Ok(true);
            }

            if !self.produce(driver, detector)? {
                return Ok(self.report.success && pos > 0);
            }
        }
    }

    /// Stage the next unit. False once nothing is left or the transfer was aborted.
    fn produce<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        detector: &mut GeometryDetector,
    ) -> Result<bool, FdcError> {
        self.pending.clear();
        self.pending_pos = 0;
        match self.stage {
            ReadStage::Header => {
                self.pending.extend_from_slice(&self.header);
                self.cylinder = 0;
                self.head = 0;
                driver.seek_drive(0, 0)?;
                self.stage = ReadStage::Track;
                Ok(true)
            }
            ReadStage::Track => self.capture_track(driver, detector),
            ReadStage::Sector(index) => self.read_sector(driver, index),
            ReadStage::Finished => Ok(false),
        }
    }

    fn abort(&mut self, message: impl Into<String>) -> Result<bool, FdcError> {
        self.report.fail(message);
        self.stage = ReadStage::Finished;
        self.pending.clear();
        self.pending_pos = 0;
        Ok(false)
    }

    /// Detect the current track's format and stage its header and maps.
    fn capture_track<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        detector: &mut GeometryDetector,
    ) -> Result<bool, FdcError> {
        let before = (driver.params().data_rate, driver.params().fm, driver.params().sector_size);
        let mut readable = detector.autodetect_comm_rate(driver)?;
        if !readable && driver.no_disk() {
            return self.abort(FdcError::NoMediumPresent.to_string());
        }
        let after = (driver.params().data_rate, driver.params().fm, driver.params().sector_size);
        self.geometry_changed |= before != after;

        let mode = if readable {
            let rate = match driver.params().data_rate {
                DataRate::Rate300 if self.options.xlat_300_250 => DataRate::Rate250,
                rate => rate,
            };
            match TrackMode::new(rate, driver.params().fm) {
                Some(mode) => mode as u8,
                None => return self.abort(format!("{} media has no image mode", rate)),
            }
        }
        else {
            0
        };

        let mut flags = 0;
        let mut ids = Vec::new();
        if readable {
            let (old_interleave, old_spt) = (self.interleave, self.spt);
            detector.autodetect_interleave(driver)?;
            match detector.sectors_table() {
                None if driver.no_disk() => return self.abort(FdcError::NoMediumPresent.to_string()),
                None => readable = false,
                Some(table) => {
                    let spt = driver.sectors_per_track();
                    if spt > MAX_SECTORS_PER_TRACK {
                        return self.abort("Too many sectors per track");
                    }
                    let Some(track_ids) = track_order(table, spt)
                    else {
                        return self.abort("Unable to synchronize with the sector table");
                    };
                    for id in table.iter().filter(|&&e| e != 0).map(|&e| SectorAddress::from_table_entry(e)) {
                        if id.c() != self.cylinder {
                            flags |= HEAD_CYLINDER_MAP;
                        }
                        if id.h() != self.head {
                            flags |= HEAD_HEAD_MAP;
                        }
                    }
                    ids = track_ids;
                    self.spt = spt;
                    self.interleave = detector.interleave();
                    self.geometry_changed |= old_interleave != self.interleave || old_spt != self.spt;
                }
            }
        }

        if !readable || ids.is_empty() {
            log::warn!("Cylinder {} head {} is unreadable", self.cylinder, self.head);
            self.pending.extend_from_slice(&[mode, self.cylinder, self.head, 0, 0]);
            self.report.unreadable_tracks += 1;
            self.report.tracks += 1;
            self.geometry_changed = true;
            self.spt = 0;
            return self.advance(driver);
        }

        self.size_code = driver.params().sector_size_code();
        if self.size_code > MAX_TRANSFER_SIZE_CODE {
            return self.abort(format!(
                "{}: {} byte sectors do not fit the sector buffer",
                FdcError::ResourceExhaustion,
                sector_size_bytes(self.size_code)
            ));
        }

        self.pending.extend_from_slice(&[mode, self.cylinder, self.head | flags, self.spt, self.size_code]);
        self.pending.extend(ids.iter().map(|id| id.s()));
        if flags & HEAD_CYLINDER_MAP != 0 {
            self.pending.extend(ids.iter().map(|id| id.c()));
        }
        if flags & HEAD_HEAD_MAP != 0 {
            self.pending.extend(ids.iter().map(|id| id.h()));
        }

        if self.geometry_changed {
            if self.options.auto_gaps {
                let (gap, format_gap) = compute_gaps(driver.params());
                driver.params_mut().gap_length = gap;
                driver.params_mut().format_gap_length = format_gap;
            }
            self.report.geometry_changes += 1;
            log::info!(
                "{}",
                GeometryReport::new(driver.params(), self.cylinder, self.head, self.interleave, self.options.auto_gaps)
            );
            self.geometry_changed = false;
        }
        log::info!("Reading cylinder {} head {}", self.cylinder, self.head);

        self.ids = ids;
        self.stage = ReadStage::Sector(0);
        Ok(true)
    }

    fn read_sector<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
        index: usize,
    ) -> Result<bool, FdcError> {
        let Some(&id) = self.ids.get(index)
        else {
            return self.advance(driver);
        };
        let size = sector_size_bytes(self.size_code);
        driver.buffer_mut()[..size].fill(0);

        let moved = driver.read_write_sectors(false, id.s(), id.s(), TransferOptions::logical(id.c(), id.h()))?;
        if driver.last_error() && driver.no_disk() {
            return self.abort(FdcError::NoMediumPresent.to_string());
        }
        let error = moved == 0;
        if error {
            self.report.bad_sectors_on_disk += 1;
        }

        let record = ImageSectorRecord::classify(&driver.buffer()[..size], driver.control_mark(), error);
        record.encode(&mut self.pending);

        if index + 1 < self.ids.len() {
            self.stage = ReadStage::Sector(index + 1);
            return Ok(true);
        }
        self.report.tracks += 1;
        self.ids = Vec::new();
        self.advance(driver)
    }

    /// Step to the next head, then the next cylinder.
    fn advance<P: RegisterPort, C: Clock>(&mut self, driver: &mut ControllerDriver<P, C>) -> Result<bool, FdcError> {
        self.head += 1;
        if self.head >= driver.head_count() {
            self.head = 0;
            self.cylinder += 1;
        }
        if self.cylinder >= driver.cylinder_count() {
            log::debug!("ImageReader: last track done");
            self.report.succeed();
            self.stage = ReadStage::Finished;
            return Ok(true);
        }
        driver.seek_drive(self.cylinder, self.head)?;
        self.stage = ReadStage::Track;
        Ok(true)
    }
}

/// One revolution's worth of IDs from a sampled table, starting at the lowest sector number.
fn track_order(table: &[u16], spt: u8) -> Option<Vec<SectorAddress>> {
    let sampled: Vec<SectorAddress> = table
        .iter()
        .take_while(|&&e| e != 0)
        .map(|&e| SectorAddress::from_table_entry(e))
        .collect();
    let lowest = sampled.iter().map(|id| id.s()).min()?;
    let start = sampled.iter().position(|id| id.s() == lowest)?;
    Some(
        (0..spt as usize)
            .map(|i| sampled[(start + i) % sampled.len()])
            .collect(),
    )
}
