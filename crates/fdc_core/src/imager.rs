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

    fdc_core::imager.rs

    Whole-disk operations: imaging in both directions, format, erase, and the
    controller and drive self-tests.
    
    Every operation works on a copy of the configured drive parameters and puts
    them back when done, the way a session with a single configured drive
    expects.
*/

use std::fmt::{self, Display};

use strum::IntoEnumIterator;
use strum_macros::{Display as StrumDisplay, EnumIter};

use crate::{
    clock::Clock,
    device_types::media::{DataRate, DriveMediaParams},
    devices::fdc::{driver::ControllerDriver, error::FdcError, registers::RegisterPort},
    geometry::{gaps::compute_gaps, GeometryDetector, GeometryReport},
    imagestream::{ImageReader, ImageWriter, StreamOptions, TransferReport},
    transport::Transport,
};

/// Format written by the erase operation: a single sector far longer than the track, so the
/// old contents are overwritten end to end.
pub const ERASE_SECTOR_SIZE: u16 = 8192;
pub const RPM_SYNC_WINDOW_MS: u64 = 10_000;
pub const RPM_REVOLUTIONS: u32 = 20;
/// Milliseconds per minute less the index pulse width.
pub const RPM_CALIBRATION: u32 = 60_000 - 420;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagingOptions {
    pub auto_double_step: bool,
    pub auto_heads: bool,
    pub auto_gaps: bool,
    pub xlat_300_250: bool,
    pub skip_bad_sectors: bool,
    pub verify: bool,
    pub format_interleave: u8,
}

impl Default for ImagingOptions {
    fn default() -> Self {
        Self {
            auto_double_step: true,
            auto_heads: true,
            auto_gaps: true,
            xlat_300_250: false,
            skip_bad_sectors: false,
            verify: false,
            format_interleave: 1,
        }
    }
}

impl ImagingOptions {
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            auto_gaps: self.auto_gaps,
            xlat_300_250: self.xlat_300_250,
            skip_bad_sectors: self.skip_bad_sectors,
            verify: self.verify,
        }
    }
}

/// The low level format to lay down with [Imager::format_disk].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FormatSpec {
    pub data_rate: DataRate,
    pub fm: bool,
    pub sectors_per_track: u8,
    pub sector_size: u16,
}

impl FormatSpec {
    pub fn from_params(params: &DriveMediaParams) -> Self {
        Self {
            data_rate: params.data_rate,
            fm: params.fm,
            sectors_per_track: params.sectors_per_track,
            sector_size: params.sector_size,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, StrumDisplay, EnumIter)]
pub enum ControllerTest {
    #[strum(to_string = "500kbps MFM, 15 x 512")]
    HighDensity,
    #[strum(to_string = "1Mbps perpendicular, 36 x 512")]
    Perpendicular,
    #[strum(to_string = "500kbps FM, 26 x 128")]
    EightInchFm,
    #[strum(to_string = "500kbps MFM, 26 x 128")]
    Mfm128,
}

impl ControllerTest {
    fn pattern(&self) -> u8 {
        match self {
            ControllerTest::HighDensity => 0xA1,
            ControllerTest::Perpendicular => 0xB2,
            ControllerTest::EightInchFm => 0xC3,
            ControllerTest::Mfm128 => 0xD4,
        }
    }
}

/// Outcome per test; `None` for a test the controller can't run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerTestReport {
    pub results: Vec<(ControllerTest, Option<bool>)>,
}

impl ControllerTestReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|(_, result)| *result != Some(false))
    }
}

impl Display for ControllerTestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (test, result) in &self.results {
            let outcome = match result {
                Some(true) => "OK",
                Some(false) => "FAIL",
                None => "skipped",
            };
            writeln!(f, "{:<32} {}", test.to_string(), outcome)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriveTestReport {
    pub media_readable: bool,
    pub seek_ok: bool,
    pub rpm: Option<u32>,
}

impl Display for DriveTestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.media_readable {
            return write!(f, "Unable to read the disk");
        }
        writeln!(f, "Seek test: {}", if self.seek_ok { "OK" } else { "FAIL" })?;
        match self.rpm {
            Some(rpm) => write!(f, "Rotation: {} RPM", rpm),
            None => write!(f, "Rotation: unable to sync with sector 1"),
        }
    }
}

pub struct Imager<P: RegisterPort, C: Clock> {
    driver: ControllerDriver<P, C>,
    detector: GeometryDetector,
    options: ImagingOptions,
}

impl<P: RegisterPort, C: Clock> Imager<P, C> {
    pub fn new(driver: ControllerDriver<P, C>, options: ImagingOptions) -> Self {
        Self {
            driver,
            detector: GeometryDetector::new(),
            options,
        }
    }

    pub fn driver(&self) -> &ControllerDriver<P, C> {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut ControllerDriver<P, C> {
        &mut self.driver
    }

    pub fn detector(&self) -> &GeometryDetector {
        &self.detector
    }

    pub fn options(&self) -> &ImagingOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut ImagingOptions {
        &mut self.options
    }

    pub fn into_driver(self) -> ControllerDriver<P, C> {
        self.driver
    }

    /// Run `op` and put the configured parameters back afterwards. Fatal errors skip the
    /// cleanup, since the controller can't be trusted any more.
    fn with_saved_params<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, FdcError>,
    ) -> Result<T, FdcError> {
        let backup = self.driver.params().clone();
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                return result;
            }
        }
        self.driver.set_automatic_motor_off(true);
        *self.driver.params_mut() = backup;
        self.driver.seek_drive(0, 0)?;
        result
    }

    fn abort_reason(&self) -> Option<FdcError> {
        if self.driver.no_disk() {
            Some(FdcError::NoMediumPresent)
        }
        else if self.driver.write_protected() {
            Some(FdcError::WriteProtected)
        }
        else {
            None
        }
    }

    /// Probe step mode and side count on cylinder 0 where configured as automatic. Falls back
    /// to the configured values when they can't be told. False if there is no disk.
    fn detect_layout(&mut self) -> Result<bool, FdcError> {
        if !self.options.auto_double_step && !self.options.auto_heads {
            return Ok(true);
        }
        if !self.detector.autodetect_comm_rate(&mut self.driver)? {
            if self.driver.no_disk() {
                return Ok(false);
            }
            log::warn!("Cylinder 0 unreadable, using the configured step mode and sides");
            return Ok(true);
        }
        if self.options.auto_double_step && !self.detector.autodetect_double_step(&mut self.driver)? {
            log::warn!(
                "Could not detect the step mode, using {}",
                if self.driver.params().double_stepping { "double stepping" } else { "single stepping" }
            );
        }
        if self.options.auto_heads && !self.detector.autodetect_heads(&mut self.driver)? {
            log::warn!("Could not detect the number of sides, using {}", self.driver.head_count());
        }
        Ok(true)
    }

    /// Capture the whole disk and send it as an image stream.
    pub fn read_disk(&mut self, transport: &mut dyn Transport, header_comment: &str) -> Result<TransferReport, FdcError> {
        self.with_saved_params(|this| {
            this.driver.set_automatic_motor_off(false);
            this.driver.seek_drive(0, 0)?;
            if !this.detect_layout()? {
                let mut report = TransferReport::default();
                report.fail(FdcError::NoMediumPresent.to_string());
                return Ok(report);
            }

            let mut reader = ImageReader::new(this.options.stream_options(), header_comment);
            let mut fatal = None;
            let driver = &mut this.driver;
            let detector = &mut this.detector;
            let completed = transport.transmit(&mut |_, block| match reader.fill(driver, detector, block) {
                Ok(more) => more,
                Err(e) => {
                    fatal = Some(e);
                    false
                }
            });
            if let Some(e) = fatal {
                return Err(e);
            }

            let mut report = reader.into_report();
            if !completed {
                report.fail("Transfer cancelled");
            }
            log::info!("{}", report);
            Ok(report)
        })
    }

    /// Receive an image stream and write it to the disk.
    pub fn write_disk(&mut self, transport: &mut dyn Transport) -> Result<TransferReport, FdcError> {
        self.with_saved_params(|this| {
            this.driver.set_automatic_motor_off(false);
            let mut writer = ImageWriter::new(this.options.stream_options());
            let mut fatal = None;
            let driver = &mut this.driver;
            let completed = transport.receive(&mut |_, block| match writer.consume(driver, block) {
                Ok(more) => more,
                Err(e) => {
                    fatal = Some(e);
                    false
                }
            });
            if let Some(e) = fatal {
                return Err(e);
            }

            let mut report = writer.finish();
            if !completed {
                report.fail("Transfer cancelled");
            }
            log::info!("{}", report);
            Ok(report)
        })
    }

    /// Low level format every track and verify each sector. Returns the number of bad sectors.
    pub fn format_disk(&mut self, format: &FormatSpec) -> Result<u32, FdcError> {
        self.with_saved_params(|this| {
            let params = this.driver.params_mut();
            params.data_rate = format.data_rate;
            params.fm = format.fm;
            params.sectors_per_track = format.sectors_per_track;
            params.sector_size = format.sector_size;
            params.format_filler = params.default_filler();
            if this.options.auto_gaps {
                let (gap, format_gap) = compute_gaps(params);
                params.gap_length = gap;
                params.format_gap_length = format_gap;
            }
            this.driver.set_communication_rate()?;

            let interleave = this.options.format_interleave.max(1);
            log::info!("{}", this.geometry_report(0, 0, interleave));

            let spt = format.sectors_per_track;
            let mut bad_sectors = 0u32;
            for cylinder in 0..this.driver.cylinder_count() {
                for head in 0..this.driver.head_count() {
                    log::info!("Formatting cylinder {} head {}", cylinder, head);
                    this.driver.seek_drive(cylinder, head)?;
                    if !this.driver.format_track(false, interleave)? {
                        if let Some(reason) = this.abort_reason() {
                            return Err(reason);
                        }
                        bad_sectors += spt as u32;
                        continue;
                    }

                    for sector in 1..=spt {
                        let verified = this.driver.verify(sector, false, None, None)?;
                        if this.driver.no_disk() {
                            return Err(FdcError::NoMediumPresent);
                        }
                        if this.driver.last_error() || verified != format.sector_size as usize {
                            bad_sectors += 1;
                        }
                    }
                }
            }
            log::info!("Format complete, {} bad sectors", bad_sectors);
            Ok(bad_sectors)
        })
    }

    /// Overwrite every track with one oversized sector.
    pub fn erase_disk(&mut self) -> Result<(), FdcError> {
        self.with_saved_params(|this| {
            let params = this.driver.params_mut();
            params.data_rate = DataRate::Rate250;
            params.fm = false;
            params.sector_size = ERASE_SECTOR_SIZE;
            params.sectors_per_track = 1;
            let (gap, format_gap) = compute_gaps(params);
            params.gap_length = gap;
            params.format_gap_length = format_gap;
            this.driver.set_communication_rate()?;
            log::info!("{}", this.geometry_report(0, 0, 1));

            for cylinder in 0..this.driver.cylinder_count() {
                for head in 0..this.driver.head_count() {
                    log::info!("Erasing cylinder {} head {}", cylinder, head);
                    this.driver.seek_drive(cylinder, head)?;
                    if !this.driver.format_track(false, 1)? {
                        if let Some(reason) = this.abort_reason() {
                            return Err(reason);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Format, write and read back sector 1 of cylinder 0 in several formats. Destroys the
    /// contents of cylinder 0.
    pub fn test_controller(&mut self) -> Result<ControllerTestReport, FdcError> {
        let result = self.with_saved_params(|this| {
            this.driver.seek_drive(0, 0)?;
            let features = this.driver.features();
            let mut report = ControllerTestReport::default();

            for test in ControllerTest::iter() {
                if test == ControllerTest::Perpendicular && !(features.fifo && features.perpendicular) {
                    report.results.push((test, None));
                    continue;
                }
                let passed = this.run_controller_test(test)?;
                log::info!("{}: {}", test, if passed { "OK" } else { "FAIL" });
                if !passed {
                    if let Some(reason) = this.abort_reason() {
                        return Err(reason);
                    }
                }
                report.results.push((test, Some(passed)));
            }
            Ok(report)
        });

        match &result {
            Err(e) if e.is_fatal() => {}
            _ => self.driver.reset_controller()?,
        }
        result
    }

    fn run_controller_test(&mut self, test: ControllerTest) -> Result<bool, FdcError> {
        let params = self.driver.params_mut();
        params.perpendicular = false;
        match test {
            ControllerTest::HighDensity => {
                params.data_rate = DataRate::Rate500;
                params.fm = false;
                params.sectors_per_track = 15;
                params.sector_size = 512;
                params.format_filler = 0xF6;
            }
            ControllerTest::Perpendicular => {
                params.data_rate = DataRate::Rate1000;
                params.fm = false;
                params.sectors_per_track = 36;
                params.sector_size = 512;
                params.perpendicular = true;
            }
            ControllerTest::EightInchFm => {
                params.data_rate = DataRate::Rate500;
                params.fm = true;
                params.sectors_per_track = 26;
                params.sector_size = 128;
            }
            ControllerTest::Mfm128 => {
                params.data_rate = DataRate::Rate500;
                params.fm = false;
                params.sectors_per_track = 26;
                params.sector_size = 128;
            }
        }
        if test == ControllerTest::Perpendicular {
            params.gap_length = 0x1B;
            params.format_gap_length = 0x53;
        }
        else {
            let (gap, format_gap) = compute_gaps(params);
            params.gap_length = gap;
            params.format_gap_length = format_gap;
        }
        self.driver.set_communication_rate()?;

        let size = self.driver.sector_size();
        let pattern = test.pattern();
        let mut passed = false;
        if self.driver.format_track(false, 1)? {
            self.driver.buffer_mut()[..size].fill(pattern);
            if self.driver.write_sectors(1, 1)? > 0 {
                self.driver.buffer_mut()[..size].fill(0);
                passed = self.driver.read_sectors(1, 1)? > 0 && self.driver.buffer()[size - 1] == pattern;
            }
        }

        if test == ControllerTest::Perpendicular {
            self.driver.params_mut().perpendicular = false;
        }
        Ok(passed)
    }

    /// Seek test, then rotation speed from the interval between sector 1 IDs.
    pub fn test_drive(&mut self) -> Result<DriveTestReport, FdcError> {
        self.with_saved_params(|this| {
            let mut report = DriveTestReport::default();
            this.driver.seek_drive(0, 0)?;
            if !this.detector.autodetect_comm_rate(&mut this.driver)? {
                if this.driver.no_disk() {
                    return Err(FdcError::NoMediumPresent);
                }
                return Ok(report);
            }
            report.media_readable = true;

            if this.options.auto_double_step && !this.detector.autodetect_double_step(&mut this.driver)? {
                log::warn!("Could not detect the step mode, testing with the configured one");
            }

            let last = this.driver.cylinder_count().saturating_sub(1);
            report.seek_ok = this.driver.seek_test(last)?;
            this.driver.seek_drive(0, 0)?;

            this.driver.set_automatic_motor_off(false);
            report.rpm = this.measure_rpm()?;
            if let Some(rpm) = report.rpm {
                log::info!("Drive turns at {} RPM", rpm);
            }
            Ok(report)
        })
    }

    fn measure_rpm(&mut self) -> Result<Option<u32>, FdcError> {
        let deadline = self.driver.clock().deadline(RPM_SYNC_WINDOW_MS);
        let mut start: Option<u64> = None;
        let mut count = 0u32;

        while start.is_some() || self.driver.clock().now_ms() < deadline {
            let Some(id) = self.driver.read_sector_id()?
            else {
                if self.driver.no_disk() {
                    return Err(FdcError::NoMediumPresent);
                }
                return Ok(None);
            };
            if id.s() != 1 {
                continue;
            }

            let now = self.driver.clock().now_ms();
            match start {
                None => start = Some(now),
                Some(begin) => {
                    count += 1;
                    if count == RPM_REVOLUTIONS {
                        let elapsed = (now - begin).max(1);
                        return Ok(Some((count as u64 * RPM_CALIBRATION as u64 / elapsed) as u32));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Detect the format of one track. `None` if no sector IDs can be read there.
    pub fn detect_geometry(&mut self, cylinder: u8, head: u8) -> Result<Option<GeometryReport>, FdcError> {
        self.with_saved_params(|this| {
            this.driver.seek_drive(cylinder, head)?;
            if !this.detector.autodetect_comm_rate(&mut this.driver)? {
                if this.driver.no_disk() {
                    return Err(FdcError::NoMediumPresent);
                }
                return Ok(None);
            }
            if this.detector.autodetect_interleave(&mut this.driver)? {
                log::debug!("detect_geometry(): interleave 1:{}", this.detector.interleave());
            }
            if this.options.auto_gaps {
                let (gap, format_gap) = this.detector.autodetect_gaps(&this.driver);
                this.driver.params_mut().gap_length = gap;
                this.driver.params_mut().format_gap_length = format_gap;
            }
            Ok(Some(this.detector.geometry_report(&this.driver, this.options.auto_gaps)))
        })
    }

    pub fn geometry_report(&self, cylinder: u8, head: u8, interleave: u8) -> GeometryReport {
        GeometryReport::new(self.driver.params(), cylinder, head, interleave, self.options.auto_gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::VirtualClock,
        devices::fdc::sim::{FaultInjection, SimDisk, SimulatedController, TrackLayout},
        imagestream::parse_image,
        transport::{BlockSize, StreamTransport},
    };
    use std::io::Cursor;

    type SimImager = Imager<SimulatedController, VirtualClock>;

    fn small_params() -> DriveMediaParams {
        let mut params = DriveMediaParams::pc_360k(0);
        params.cylinders = 4;
        params
    }

    fn imager_with(disk: Option<SimDisk>, params: DriveMediaParams) -> SimImager {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = VirtualClock::new();
        let mut sim = SimulatedController::new(clock.clone());
        if let Some(disk) = disk {
            sim.insert_disk(0, disk);
        }
        let mut driver = ControllerDriver::new(sim, clock);
        driver.set_active_drive(params).unwrap();
        Imager::new(driver, ImagingOptions::default())
    }

    fn pattern_disk() -> SimDisk {
        let layout = TrackLayout::from_params(&small_params()).with_skew(2);
        SimDisk::formatted(4, 2, &layout).with_pattern()
    }

    #[test]
    fn test_read_then_write_disk() {
        let mut source = imager_with(Some(pattern_disk()), small_params());
        let configured = source.driver().params().clone();
        let mut out = StreamTransport::new(Cursor::new(Vec::new()), BlockSize::OneK);
        let report = source.read_disk(&mut out, "copy test").unwrap();
        assert!(report.success, "{:?}", report.message);
        assert_eq!(report.tracks, 8);
        assert_eq!(source.driver().params(), &configured);

        let image = out.into_inner().into_inner();
        assert_eq!(image.len() % 1024, 0);
        let parsed = parse_image(&image).unwrap();
        assert!(parsed.header.contains("copy test"));
        assert_eq!(parsed.sector_count(), 72);

        let mut target = imager_with(Some(SimDisk::unformatted(4)), small_params());
        target.options_mut().verify = true;
        let mut input = StreamTransport::new(Cursor::new(image), BlockSize::Standard);
        let report = target.write_disk(&mut input).unwrap();
        assert!(report.success, "{:?}", report.message);
        assert_eq!(report.bad_sectors_on_disk, 0);

        let original = pattern_disk();
        let written = target.driver().port().disk(0).unwrap();
        for c in 0..4 {
            for h in 0..2 {
                let a = original.track(c, h).unwrap();
                let b = written.track(c, h).unwrap();
                for (sa, sb) in a.sectors.iter().zip(b.sectors.iter()) {
                    assert_eq!(sa.id, sb.id);
                    assert_eq!(sa.data, sb.data);
                }
            }
        }
    }

    #[test]
    fn test_read_disk_without_disk() {
        let mut imager = imager_with(None, small_params());
        let mut out = StreamTransport::new(Cursor::new(Vec::new()), BlockSize::Standard);
        let report = imager.read_disk(&mut out, "").unwrap();
        assert!(!report.success);
        assert_eq!(report.message.as_deref(), Some("No disk in drive"));
    }

    #[test]
    fn test_write_disk_cancelled() {
        let mut data = vec![0x18, 0x18];
        data.resize(128, 0);
        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        let mut input = StreamTransport::new(Cursor::new(data), BlockSize::Standard);
        let report = imager.write_disk(&mut input).unwrap();
        assert!(!report.success);
        assert_eq!(report.message.as_deref(), Some("Transfer cancelled"));
    }

    #[test]
    fn test_format_disk() {
        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        imager.options_mut().format_interleave = 3;
        let configured = imager.driver().params().clone();
        let format = FormatSpec::from_params(&small_params());
        assert_eq!(imager.format_disk(&format).unwrap(), 0);

        let disk = imager.driver().port().disk(0).unwrap();
        let track = disk.track(3, 1).unwrap();
        let order: Vec<u8> = track.sectors.iter().map(|s| s.id.s()).collect();
        assert_eq!(order, vec![1, 4, 7, 2, 5, 8, 3, 6, 9]);
        assert!(track.sectors.iter().all(|s| s.data == vec![0xF6; 512]));
        assert_eq!(imager.driver().params(), &configured);
    }

    #[test]
    fn test_format_scenarios() {
        let mut params = small_params();
        params.cylinders = 1;
        params.heads = 1;
        let format = FormatSpec::from_params(&params);

        let mut imager = imager_with(Some(SimDisk::unformatted(1)), params.clone());
        assert_eq!(imager.format_disk(&format).unwrap(), 0);

        let mut imager = imager_with(Some(SimDisk::unformatted(1)), params.clone());
        imager.driver_mut().port_mut().faults_mut().fail_next = 2;
        assert_eq!(imager.format_disk(&format).unwrap(), 0);

        let mut imager = imager_with(Some(SimDisk::unformatted(1)), params.clone());
        imager.driver_mut().port_mut().set_faults(FaultInjection {
            always_fail: true,
            ..Default::default()
        });
        assert_eq!(imager.format_disk(&format).unwrap(), 9);
    }

    #[test]
    fn test_format_write_protected() {
        let disk = SimDisk::unformatted(4).with_write_protect(true);
        let mut imager = imager_with(Some(disk), small_params());
        let configured = imager.driver().params().clone();
        let format = FormatSpec::from_params(&small_params());
        assert!(matches!(imager.format_disk(&format), Err(FdcError::WriteProtected)));
        assert_eq!(imager.driver().params(), &configured);
    }

    #[test]
    fn test_erase_disk() {
        let mut imager = imager_with(Some(pattern_disk()), small_params());
        imager.erase_disk().unwrap();
        let disk = imager.driver().port().disk(0).unwrap();
        let track = disk.track(2, 1).unwrap();
        assert_eq!(track.sectors.len(), 1);
        assert_eq!(track.sectors[0].id.n(), 6);
        assert_eq!(track.rate, DataRate::Rate250);
    }

    #[test]
    fn test_controller_scenarios() {
        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        let configured = imager.driver().params().clone();
        let report = imager.test_controller().unwrap();
        assert!(report.passed());
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.results[1], (ControllerTest::Perpendicular, Some(true)));
        assert_eq!(imager.driver().params(), &configured);

        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        imager.driver_mut().port_mut().faults_mut().fail_next = 2;
        assert!(imager.test_controller().unwrap().passed());

        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        imager.driver_mut().port_mut().set_faults(FaultInjection {
            always_fail: true,
            ..Default::default()
        });
        let report = imager.test_controller().unwrap();
        assert!(!report.passed());
        assert!(report.to_string().contains("FAIL"));
    }

    #[test]
    fn test_controller_without_perpendicular() {
        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        imager.driver_mut().port_mut().set_features(false, false);
        imager.driver_mut().reset_controller().unwrap();
        let report = imager.test_controller().unwrap();
        assert_eq!(report.results[1], (ControllerTest::Perpendicular, None));
        assert!(report.passed());
    }

    #[test]
    fn test_controller_no_disk() {
        let mut imager = imager_with(None, small_params());
        assert!(matches!(imager.test_controller(), Err(FdcError::NoMediumPresent)));
    }

    #[test]
    fn test_drive() {
        let mut imager = imager_with(Some(pattern_disk()), small_params());
        imager.options_mut().auto_double_step = false;
        let report = imager.test_drive().unwrap();
        assert!(report.media_readable);
        assert!(report.seek_ok);
        // 200ms per revolution less the index pulse allowance
        assert_eq!(report.rpm, Some(297));
    }

    #[test]
    fn test_drive_unreadable() {
        let mut imager = imager_with(Some(SimDisk::unformatted(4)), small_params());
        let report = imager.test_drive().unwrap();
        assert!(!report.media_readable);
        assert_eq!(report.to_string(), "Unable to read the disk");
    }

    #[test]
    fn test_detect_geometry() {
        let mut imager = imager_with(Some(pattern_disk()), small_params());
        let configured = imager.driver().params().clone();
        let report = imager.detect_geometry(1, 1).unwrap().unwrap();
        let text = report.to_string();
        assert!(text.contains("9 x 512"), "{}", text);
        assert!(text.contains("1:2"), "{}", text);
        assert_eq!(imager.driver().params(), &configured);

        let mut blank = imager_with(Some(SimDisk::unformatted(4)), small_params());
        assert!(blank.detect_geometry(0, 0).unwrap().is_none());

        let mut empty = imager_with(None, small_params());
        assert!(matches!(empty.detect_geometry(0, 0), Err(FdcError::NoMediumPresent)));
    }

    #[test]
    fn test_geometry_report() {
        let imager = imager_with(Some(pattern_disk()), small_params());
        let text = imager.geometry_report(0, 0, 2).to_string();
        assert!(text.contains("MFM"));
    }
}
