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

    geometry::detector.rs

    Geometry autodetection built on the driver's Read ID primitive.
    
    Every probe works from whatever ID fields pass under the head within a time
    window, so nothing here needs to know the disk's contents. A missing disk
    aborts a probe at once; other failures just report that detection did not
    succeed and leave the configured values to the caller.
*/

use crate::{
    clock::Clock,
    device_types::{
        chs::SectorAddress,
        media::{sector_size_bytes, DataRate, MAX_SECTOR_SIZE_CODE},
    },
    devices::fdc::{driver::ControllerDriver, error::FdcError, registers::RegisterPort},
    geometry::{gaps::compute_gaps, interleave::skew_factor, report::GeometryReport},
};

pub const ID_SEARCH_WINDOW_MS: u64 = 2500;
/// Long enough for 25 revolutions at 300 RPM.
pub const SECTOR_SCAN_WINDOW_MS: u64 = 5000;
pub const SECTORS_TABLE_COUNT: usize = 128;
pub const INTERLEAVE_SCAN_ATTEMPTS: usize = 3;

const RATE_SEARCH_ORDER: [DataRate; 3] = [DataRate::Rate500, DataRate::Rate250, DataRate::Rate300];
const FM_SEARCH_ORDER: [bool; 2] = [false, true];

/// Sector IDs sampled from one track in the order they passed under the head.
#[derive(Clone, Debug)]
pub struct SectorScan {
    /// Packed entries as made by [SectorAddress::table_entry]. Unused entries are 0.
    pub table: Vec<u16>,
    /// IDs seen before the first sector came around again.
    pub observed: u8,
    /// Highest sector number seen.
    pub maximum: u8,
}

impl SectorScan {
    pub fn sector_numbers(&self) -> Vec<u8> {
        self.table.iter().map(|&e| (e & 0x7F) as u8).collect()
    }
}

#[derive(Debug)]
pub struct GeometryDetector {
    last_good: Option<(DataRate, bool)>,
    interleave: u8,
    sectors_table: Option<Vec<u16>>,
}

impl Default for GeometryDetector {
    fn default() -> Self {
        Self {
            last_good: None,
            interleave: 1,
            sectors_table: None,
        }
    }
}

impl GeometryDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interleave(&self) -> u8 {
        self.interleave
    }

    pub fn set_interleave(&mut self, interleave: u8) {
        self.interleave = interleave.max(1);
    }

    /// Rate and encoding of the last successful rate probe, tried first next time.
    pub fn last_good(&self) -> Option<(DataRate, bool)> {
        self.last_good
    }

    /// Table from the scan used by the last [GeometryDetector::autodetect_interleave].
    pub fn sectors_table(&self) -> Option<&[u16]> {
        self.sectors_table.as_deref()
    }

    /// Find the rate and encoding the current track was recorded with. On success the sector
    /// size is taken from the ID that was read.
    pub fn autodetect_comm_rate<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<bool, FdcError> {
        let candidates = self.last_good.take().into_iter().chain(
            FM_SEARCH_ORDER
                .iter()
                .flat_map(|&fm| RATE_SEARCH_ORDER.iter().map(move |&rate| (rate, fm))),
        );

        for (rate, fm) in candidates {
            driver.params_mut().data_rate = rate;
            driver.params_mut().fm = fm;
            driver.set_communication_rate()?;

            if let Some(id) = driver.read_sector_id()? {
                log::debug!(
                    "autodetect_comm_rate(): {} {} id {}",
                    rate,
                    if fm { "FM" } else { "MFM" },
                    id
                );
                self.last_good = Some((rate, fm));
                if id.n() <= MAX_SECTOR_SIZE_CODE {
                    driver.params_mut().sector_size = sector_size_bytes(id.n()) as u16;
                }
                return Ok(true);
            }
            if driver.no_disk() {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Look for sector 1 within [ID_SEARCH_WINDOW_MS]. Returns its ID cylinder.
    fn find_sector_one<P: RegisterPort, C: Clock>(
        &self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<Option<u8>, FdcError> {
        if !driver.drive_active() {
            return Ok(None);
        }
        let deadline = driver.clock().deadline(ID_SEARCH_WINDOW_MS);
        while driver.clock().now_ms() < deadline {
            match driver.read_sector_id()? {
                Some(id) if id.s() == 1 => return Ok(Some(id.c())),
                None if driver.no_disk() => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    fn find_any_id<P: RegisterPort, C: Clock>(
        &self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<Option<SectorAddress>, FdcError> {
        if !driver.drive_active() {
            return Ok(None);
        }
        let deadline = driver.clock().deadline(ID_SEARCH_WINDOW_MS);
        while driver.clock().now_ms() < deadline {
            match driver.read_sector_id()? {
                Some(id) => return Ok(Some(id)),
                None if driver.no_disk() => return Ok(None),
                None => {}
            }
        }
        Ok(None)
    }

    /// Tell a 40 track recording in an 80 track drive from a native one, by the cylinder ID
    /// found two physical steps out. The rate must already be right.
    pub fn autodetect_double_step<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<bool, FdcError> {
        let (save_cylinder, save_head) = (driver.current_cylinder(), driver.current_head());

        driver.params_mut().double_stepping = false;
        driver.recalibrate_drive()?;
        driver.seek_drive(0, save_head)?;

        if self.find_sector_one(driver)? != Some(0) {
            if !driver.no_disk() {
                log::debug!("autodetect_double_step(): sector 1 not found on cylinder 0");
            }
            driver.seek_drive(save_cylinder, save_head)?;
            return Ok(false);
        }

        driver.seek_drive(2, save_head)?;
        match self.find_sector_one(driver)? {
            Some(2) => {
                driver.seek_drive(save_cylinder, save_head)?;
                Ok(true)
            }
            Some(1) => {
                log::debug!("autodetect_double_step(): physical cylinder 2 holds cylinder 1");
                driver.params_mut().double_stepping = true;
                driver.recalibrate_drive()?;
                driver.seek_drive(save_cylinder / 2, save_head)?;
                Ok(true)
            }
            _ if driver.no_disk() => {
                driver.seek_drive(save_cylinder, save_head)?;
                Ok(false)
            }
            _ => {
                driver.recalibrate_drive()?;
                driver.seek_drive(save_cylinder, save_head)?;
                Ok(false)
            }
        }
    }

    /// Decide between one and two recorded sides. The second side may use another rate, so
    /// the rate probe is repeated there; the side 0 settings are kept afterwards.
    pub fn autodetect_heads<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<bool, FdcError> {
        let (save_cylinder, save_head) = (driver.current_cylinder(), driver.current_head());

        driver.seek_drive(save_cylinder, 0)?;
        if self.find_any_id(driver)?.map(|id| id.h()) != Some(0) {
            driver.seek_drive(save_cylinder, save_head)?;
            return Ok(false);
        }

        driver.seek_drive(save_cylinder, 1)?;
        let backup = driver.params().clone();
        let mut side_one = None;
        if self.autodetect_comm_rate(driver)? {
            side_one = self.find_any_id(driver)?;
        }
        if side_one.is_none() && driver.no_disk() {
            *driver.params_mut() = backup;
            return Ok(false);
        }

        let heads = if side_one.map(|id| id.h()) == Some(1) { 2 } else { 1 };
        log::debug!("autodetect_heads(): {} head(s)", heads);

        self.last_good = Some((backup.data_rate, backup.fm));
        *driver.params_mut() = backup;
        driver.params_mut().heads = heads;
        driver.set_communication_rate()?;
        driver.seek_drive(save_cylinder, save_head)?;
        Ok(true)
    }

    /// Sample sector IDs on the current track for up to [SECTOR_SCAN_WINDOW_MS] or until the
    /// table is full. `None` if there is no disk.
    pub fn autodetect_sectors_per_track<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<Option<SectorScan>, FdcError> {
        if !driver.drive_active() {
            return Ok(None);
        }

        let mut table = Vec::with_capacity(SECTORS_TABLE_COUNT);
        let mut counting: Option<u8> = None;
        let mut observed: u8 = 0;
        let mut maximum: u8 = 0;

        let deadline = driver.clock().deadline(SECTOR_SCAN_WINDOW_MS);
        while driver.clock().now_ms() < deadline && table.len() < SECTORS_TABLE_COUNT {
            match driver.read_sector_id()? {
                Some(id) if id.s() != 0 => {
                    if table.is_empty() {
                        counting = Some(id.s());
                    }
                    else if counting == Some(id.s()) {
                        counting = None;
                    }
                    if counting.is_some() {
                        observed = observed.saturating_add(1);
                    }
                    maximum = maximum.max(id.s());
                    table.push(id.table_entry());
                }
                None if driver.no_disk() => return Ok(None),
                _ => {}
            }
        }

        table.resize(SECTORS_TABLE_COUNT, 0);
        Ok(Some(SectorScan {
            table,
            observed: observed.min(maximum),
            maximum,
        }))
    }

    /// Find sectors per track and the skew of the current track, and set both. Falls back to
    /// sequential (keeping the sectors per track) when the skew can't be confirmed.
    pub fn autodetect_interleave<P: RegisterPort, C: Clock>(
        &mut self,
        driver: &mut ControllerDriver<P, C>,
    ) -> Result<bool, FdcError> {
        self.sectors_table = None;
        let mut best: Option<SectorScan> = None;
        let mut spt: u8 = 0;

        for _ in 0..INTERLEAVE_SCAN_ATTEMPTS {
            let Some(scan) = self.autodetect_sectors_per_track(driver)?
            else {
                best = None;
                break;
            };
            if scan.observed == scan.maximum && scan.observed > 0 {
                spt = scan.observed;
                best = Some(scan);
                break;
            }
            if scan.observed > spt {
                spt = scan.observed;
                best = Some(scan);
            }
            // Missing IDs, likely bad sectors. Try again from a fresh seek.
            driver.recalibrate_drive()?;
            driver.seek_drive(driver.current_cylinder(), driver.current_head())?;
        }

        let Some(scan) = best
        else {
            return Ok(false);
        };
        if spt == 0 {
            return Ok(false);
        }

        let numbers = scan.sector_numbers();
        self.sectors_table = Some(scan.table);
        driver.params_mut().sectors_per_track = spt;

        match skew_factor(&numbers, spt) {
            Some(factor) => {
                log::debug!("autodetect_interleave(): {} sectors, 1:{}", spt, factor);
                self.interleave = factor;
                Ok(true)
            }
            None => {
                log::warn!(
                    "autodetect_interleave(): could not confirm skew on {} sectors, using 1:1",
                    spt
                );
                self.interleave = 1;
                Ok(false)
            }
        }
    }

    /// Sector gap and format gap for the driver's current format.
    pub fn autodetect_gaps<P: RegisterPort, C: Clock>(&self, driver: &ControllerDriver<P, C>) -> (u8, u8) {
        compute_gaps(driver.params())
    }

    pub fn geometry_report<P: RegisterPort, C: Clock>(
        &self,
        driver: &ControllerDriver<P, C>,
        auto_gaps: bool,
    ) -> GeometryReport {
        GeometryReport::new(
            driver.params(),
            driver.current_cylinder(),
            driver.current_head(),
            self.interleave,
            auto_gaps,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::VirtualClock,
        device_types::media::DriveMediaParams,
        devices::fdc::sim::{SimDisk, SimulatedController, TrackLayout},
    };

    type SimDriver = ControllerDriver<SimulatedController, VirtualClock>;

    fn driver_with(disk: Option<SimDisk>, params: DriveMediaParams) -> SimDriver {
        let clock = VirtualClock::new();
        let mut sim = SimulatedController::new(clock.clone());
        if let Some(disk) = disk {
            sim.insert_disk(params.drive_number as usize, disk);
        }
        let mut driver = ControllerDriver::new(sim, clock);
        driver.set_active_drive(params).unwrap();
        driver
    }

    #[test]
    fn test_comm_rate_every_pair() {
        for fm in [false, true] {
            for rate in [DataRate::Rate500, DataRate::Rate250, DataRate::Rate300] {
                let mut layout = TrackLayout::from_params(&DriveMediaParams::pc_360k(0));
                layout.rate = rate;
                layout.fm = fm;
                layout.size_code = 1;
                let mut driver = driver_with(Some(SimDisk::formatted(40, 2, &layout)), DriveMediaParams::pc_1440k(0));

                let mut detector = GeometryDetector::new();
                assert!(detector.autodetect_comm_rate(&mut driver).unwrap(), "{} fm {}", rate, fm);
                assert_eq!(driver.params().data_rate, rate);
                assert_eq!(driver.params().fm, fm);
                assert_eq!(driver.params().sector_size, 256);
                assert_eq!(detector.last_good(), Some((rate, fm)));
            }
        }
    }

    #[test]
    fn test_comm_rate_no_disk() {
        let mut driver = driver_with(None, DriveMediaParams::pc_1440k(0));
        let mut detector = GeometryDetector::new();
        assert!(!detector.autodetect_comm_rate(&mut driver).unwrap());
        assert!(driver.no_disk());
        assert!(driver.clock().now_ms() < 20_000);
    }

    #[test]
    fn test_comm_rate_unformatted() {
        let mut driver = driver_with(Some(SimDisk::unformatted(80)), DriveMediaParams::pc_1440k(0));
        let mut detector = GeometryDetector::new();
        assert!(!detector.autodetect_comm_rate(&mut driver).unwrap());
        assert!(!driver.no_disk());
    }

    #[test]
    fn test_double_step() {
        let mut params = DriveMediaParams::pc_360k(0);
        params.cylinders = 80;
        let layout = TrackLayout::from_params(&params);

        let disk = SimDisk::formatted_double_stepped(40, 2, &layout);
        let mut driver = driver_with(Some(disk), params.clone());
        let mut detector = GeometryDetector::new();
        assert!(detector.autodetect_double_step(&mut driver).unwrap());
        assert!(driver.params().double_stepping);
        assert_eq!(driver.cylinder_count(), 40);

        let disk = SimDisk::formatted(80, 2, &layout);
        let mut driver = driver_with(Some(disk), params);
        assert!(detector.autodetect_double_step(&mut driver).unwrap());
        assert!(!driver.params().double_stepping);
    }

    #[test]
    fn test_heads() {
        let params = DriveMediaParams::pc_360k(0);
        let layout = TrackLayout::from_params(&params);
        let mut detector = GeometryDetector::new();

        let mut driver = driver_with(Some(SimDisk::formatted(40, 1, &layout)), params.clone());
        assert!(detector.autodetect_heads(&mut driver).unwrap());
        assert_eq!(driver.head_count(), 1);
        assert_eq!(driver.params().data_rate, DataRate::Rate250);

        let mut driver = driver_with(Some(SimDisk::formatted(40, 2, &layout)), params);
        driver.params_mut().heads = 1;
        assert!(detector.autodetect_heads(&mut driver).unwrap());
        assert_eq!(driver.head_count(), 2);
    }

    #[test]
    fn test_cpm_interleave() {
        let params = DriveMediaParams::ibm_3740(0);
        let layout = TrackLayout::from_params(&params).with_skew(6);
        let mut driver = driver_with(Some(SimDisk::formatted(77, 1, &layout)), params);
        driver.params_mut().sectors_per_track = 9;

        let mut detector = GeometryDetector::new();
        assert!(detector.autodetect_interleave(&mut driver).unwrap());
        assert_eq!(detector.interleave(), 6);
        assert_eq!(driver.sectors_per_track(), 26);
        assert_eq!(detector.sectors_table().map(|t| t.len()), Some(SECTORS_TABLE_COUNT));
    }

    #[test]
    fn test_sectors_per_track_scan() {
        let params = DriveMediaParams::pc_1440k(0);
        let layout = TrackLayout::from_params(&params);
        let mut driver = driver_with(Some(SimDisk::formatted(80, 2, &layout)), params);

        let mut detector = GeometryDetector::new();
        let scan = detector.autodetect_sectors_per_track(&mut driver).unwrap().unwrap();
        assert_eq!(scan.observed, 18);
        assert_eq!(scan.maximum, 18);
        assert!(scan.sector_numbers().iter().all(|&s| s <= 18));

        let mut empty = driver_with(None, DriveMediaParams::pc_1440k(0));
        assert!(detector.autodetect_sectors_per_track(&mut empty).unwrap().is_none());
    }
}
