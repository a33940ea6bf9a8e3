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

    devices::fdc::driver.rs

    Polled driver for µPD765 / DP8473 compatible floppy disk controllers.
    
    The driver owns the register port, a clock, the active drive parameters and
    the shared sector buffer. Every operation is synchronous: it sends a command,
    pumps the execution phase through DataPhase, reads the result phase and
    retries media errors with a recalibrate and reseek in between.
*/

use crate::{
    clock::Clock,
    device_types::{
        chs::SectorAddress,
        media::{DataRate, DriveMediaParams, DriveSize},
    },
    devices::fdc::{
        data_phase::{DataPhase, PhaseMode, SECTOR_BUFFER_SIZE},
        error::{FdcError, IoFault},
        registers::*,
    },
    geometry::interleave::skew_table,
};

pub const DISK_OPERATION_RETRIES: u32 = 5;
pub const IO_TIMEOUT_MS: u64 = 5000;
pub const MOTOR_SPINUP_MS: u64 = 500;
pub const MOTOR_IDLE_OFF_MS: u64 = 2000;
pub const RESET_HOLD_MS: u64 = 1;
/// 8" drives want reduced write current on cylinders above this one.
pub const REDUCED_WRITE_CURRENT_CYLINDER: u8 = 43;
/// Largest size code the sector buffer can hold for a read or write.
pub const MAX_TRANSFER_SIZE_CODE: u8 = 4;

/// Optional commands found by probing after each reset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpecialFeatures {
    /// Configure (0x13) accepted: FIFO and 1Mbps capable part.
    pub fifo: bool,
    /// Perpendicular Mode (0x12) accepted.
    pub perpendicular: bool,
}

/// Optional parts of a sector transfer.
#[derive(Copy, Clone, Debug, Default)]
pub struct TransferOptions {
    /// Offset into the sector buffer of the first byte.
    pub buffer_offset: usize,
    /// Use Read/Write Deleted Data instead of Read/Write Data.
    pub deleted_mark: bool,
    /// Cylinder to put in the command instead of the current one, for media whose IDs do not
    /// match the physical position.
    pub logical_cylinder: Option<u8>,
    pub logical_head: Option<u8>,
}

impl TransferOptions {
    pub fn logical(cylinder: u8, head: u8) -> Self {
        Self {
            logical_cylinder: Some(cylinder),
            logical_head: Some(head),
            ..Default::default()
        }
    }

    pub fn with_deleted_mark(mut self, deleted_mark: bool) -> Self {
        self.deleted_mark = deleted_mark;
        self
    }
}

/// Step rate, head load and head unload times in ms, and the two Specify operand bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpecifyTimings {
    pub srt: u8,
    pub hlt: u16,
    pub hut: u16,
    pub bytes: [u8; 2],
}

impl SpecifyTimings {
    pub fn for_drive(size: DriveSize, rate: DataRate) -> Self {
        let (srt, hlt, hut, bytes) = match (size, rate) {
            (DriveSize::Eight, _) => (8, 256, 256, [0x80, 0x01]),
            (DriveSize::FiveQuarter, DataRate::Rate250) => (6, 64, 256, [0xD8, 0x21]),
            (DriveSize::FiveQuarter, DataRate::Rate300) => (7, 63, 267, [0xCA, 0x27]),
            (DriveSize::FiveQuarter, _) => (6, 64, 256, [0xA0, 0x41]),
            (DriveSize::ThreeHalf, DataRate::Rate250) => (4, 32, 256, [0xE8, 0x11]),
            (DriveSize::ThreeHalf, DataRate::Rate1000) => (4, 32, 128, [0x80, 0x41]),
            (DriveSize::ThreeHalf, _) => (4, 32, 256, [0xC0, 0x21]),
        };
        Self { srt, hlt, hut, bytes }
    }
}

pub struct ControllerDriver<P: RegisterPort, C: Clock> {
    port: P,
    clock: C,
    params: DriveMediaParams,
    drive_active: bool,
    phase: DataPhase,
    features: SpecialFeatures,

    current_cylinder: u8,
    current_head: u8,
    current_sector: u8,

    idle: bool,
    initialized: bool,
    motor_on: bool,
    auto_motor_off: bool,
    idle_since: u64,

    last_error: bool,
    no_disk: bool,
    write_protected: bool,
    control_mark: bool,
    disk_change_inquired: bool,
    last_fault: Option<IoFault>,
    last_error_message: Option<String>,
}

impl<P: RegisterPort, C: Clock> ControllerDriver<P, C> {
    pub fn new(port: P, clock: C) -> Self {
        Self {
            port,
            clock,
            params: DriveMediaParams::default(),
            drive_active: false,
            phase: DataPhase::new(),
            features: SpecialFeatures::default(),
            current_cylinder: 0,
            current_head: 0,
            current_sector: 1,
            idle: true,
            initialized: false,
            motor_on: false,
            auto_motor_off: true,
            idle_since: 0,
            last_error: false,
            no_disk: false,
            write_protected: false,
            control_mark: false,
            disk_change_inquired: false,
            last_fault: None,
            last_error_message: None,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn params(&self) -> &DriveMediaParams {
        &self.params
    }

    /// Mutable access to the active parameters. Changes to rate or encoding take effect on the
    /// next [ControllerDriver::set_communication_rate].
    pub fn params_mut(&mut self) -> &mut DriveMediaParams {
        &mut self.params
    }

    pub fn drive_active(&self) -> bool {
        self.drive_active
    }

    pub fn features(&self) -> SpecialFeatures {
        self.features
    }

    /// The shared sector buffer. Reads land here and writes are taken from here.
    pub fn buffer(&self) -> &[u8] {
        self.phase.buffer()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.phase.buffer_mut()
    }

    // Inquire status
    // --------------------------------------------------------------------------------
    pub fn is_idle(&self) -> bool {
        self.idle
    }
    pub fn is_motor_on(&self) -> bool {
        self.motor_on
    }
    pub fn last_error(&self) -> bool {
        self.last_error
    }
    pub fn no_disk(&self) -> bool {
        self.no_disk
    }
    pub fn write_protected(&self) -> bool {
        self.write_protected
    }
    /// Deleted data address mark seen by the last completed data command.
    pub fn control_mark(&self) -> bool {
        self.control_mark
    }
    pub fn disk_change_inquired(&self) -> bool {
        self.disk_change_inquired
    }
    pub fn last_fault(&self) -> Option<IoFault> {
        self.last_fault
    }
    pub fn last_error_message(&self) -> Option<&str> {
        self.last_error_message.as_deref()
    }

    // Geometry
    // --------------------------------------------------------------------------------
    /// Cylinder of the last successful seek, in media (logical) terms.
    pub fn current_cylinder(&self) -> u8 {
        self.current_cylinder
    }
    pub fn current_head(&self) -> u8 {
        self.current_head
    }
    pub fn current_sector(&self) -> u8 {
        self.current_sector
    }
    /// Cylinders on the media, which is half the drive's cylinders when double stepping.
    pub fn cylinder_count(&self) -> u8 {
        self.params.logical_cylinders()
    }
    pub fn head_count(&self) -> u8 {
        self.params.heads
    }
    pub fn sectors_per_track(&self) -> u8 {
        self.params.sectors_per_track
    }
    pub fn sector_size(&self) -> usize {
        self.params.sector_size as usize
    }

    pub fn total_sector_count(&self) -> u32 {
        if !self.drive_active {
            return 0;
        }
        self.params.logical_cylinders() as u32 * self.params.sectors_per_track as u32 * self.params.heads as u32
    }

    /// Number of sectors from `start` that fit in `operation_bytes` (or the whole sector buffer
    /// when 0) without running past the end of the track.
    pub fn maximum_sector_count_for_rw(&self, start: u8, operation_bytes: usize) -> u8 {
        let spt = self.params.sectors_per_track;
        if !self.drive_active || start == 0 || start > spt || self.params.sector_size == 0 {
            return 0;
        }
        let max_bytes = match operation_bytes {
            0 => SECTOR_BUFFER_SIZE,
            n => n,
        };
        let end = (start as usize - 1 + max_bytes / self.params.sector_size as usize).min(spt as usize);
        if end < start as usize {
            return 0;
        }
        (end - start as usize + 1) as u8
    }

    /// Convert a zero based logical sector number into a media address. The cylinder is a
    /// logical one; [ControllerDriver::seek_drive] applies double stepping.
    pub fn convert_logical_sector_to_chs(&self, lba: u32) -> SectorAddress {
        let spt = self.params.sectors_per_track.max(1) as u32;
        let heads = self.params.heads.max(1) as u32;
        let track = lba / spt;
        SectorAddress::new(
            (track / heads) as u8,
            (track % heads) as u8,
            (lba % spt) as u8 + 1,
            self.params.sector_size_code(),
        )
    }

    // Register handshake
    // --------------------------------------------------------------------------------
    fn drive_select(&self) -> u8 {
        if self.drive_active {
            self.params.drive_number & DCR_DRIVE_MASK
        }
        else {
            0
        }
    }

    fn motor_bits(&self) -> u8 {
        if self.motor_on {
            1 << (self.drive_select() + DCR_MOTOR_SHIFT)
        }
        else {
            0
        }
    }

    fn write_dcr(&mut self) {
        let dcr = self.drive_select() | DCR_NOT_RESET | DCR_DMA_INT | self.motor_bits();
        self.port.write(Register::Dcr, dcr);
    }

    /// Receive a result byte.
    fn get_data(&mut self) -> Result<u8, FdcError> {
        let deadline = self.clock.deadline(IO_TIMEOUT_MS);
        loop {
            if self.port.read(Register::Msr) & (MSR_RQM | MSR_DIO) == (MSR_RQM | MSR_DIO) {
                return Ok(self.port.read(Register::Dtr));
            }
            if self.clock.now_ms() >= deadline {
                return Err(self.fatal(FdcError::HardwareTimeout));
            }
            self.clock.sleep_ms(1);
        }
    }

    /// Send a command or operand byte.
    fn send_data(&mut self, data: u8) -> Result<(), FdcError> {
        let deadline = self.clock.deadline(IO_TIMEOUT_MS);
        loop {
            if self.port.read(Register::Msr) & (MSR_RQM | MSR_DIO) == MSR_RQM {
                self.port.write(Register::Dtr, data);
                return Ok(());
            }
            if self.clock.now_ms() >= deadline {
                return Err(self.fatal(FdcError::HardwareTimeout));
            }
            self.clock.sleep_ms(1);
        }
    }

    fn send_command(&mut self, command: u8) -> Result<(), FdcError> {
        let command = if self.drive_active && self.params.fm {
            command & !COMMAND_MFM_BIT
        }
        else {
            command
        };
        log::trace!("send_command(): {:02X}", command);
        self.send_data(command)
    }

    /// Wait for the interrupt that ends a seek, recalibrate or reset.
    fn wait_for_int(&mut self) -> Result<(), FdcError> {
        self.phase.arm(PhaseMode::Acknowledge, 0);
        if self.pump_phase() {
            self.last_error = false;
            Ok(())
        }
        else {
            Err(self.fatal(FdcError::HardwareTimeout))
        }
    }

    /// Pump the execution phase until it completes. False on timeout.
    fn pump_phase(&mut self) -> bool {
        let deadline = self.clock.deadline(IO_TIMEOUT_MS);
        loop {
            if self.phase.service(&mut self.port) {
                if self.phase.completed() {
                    return true;
                }
                continue;
            }
            if self.clock.now_ms() >= deadline {
                return false;
            }
            self.clock.sleep_ms(1);
        }
    }

    fn fatal(&mut self, error: FdcError) -> FdcError {
        log::error!("{}", error);
        self.idle = true;
        self.auto_motor_off = true;
        self.motor_off();
        error
    }

    // Motor
    // --------------------------------------------------------------------------------
    fn motor_on(&mut self) {
        self.idle_since = self.clock.now_ms();
        if self.motor_on {
            return;
        }
        self.motor_on = true;
        self.write_dcr();
        self.clock.sleep_ms(MOTOR_SPINUP_MS);
    }

    fn motor_off(&mut self) {
        if !self.motor_on {
            return;
        }
        self.motor_on = false;
        self.write_dcr();
    }

    /// Turn the motor off if the driver has been idle long enough.
    pub fn service_motor(&mut self) {
        if self.motor_on
            && self.auto_motor_off
            && self.idle
            && self.clock.now_ms().saturating_sub(self.idle_since) > MOTOR_IDLE_OFF_MS
        {
            log::debug!("service_motor(): idle shut-off");
            self.motor_off();
        }
    }

    pub fn set_automatic_motor_off(&mut self, enabled: bool) {
        self.auto_motor_off = enabled;
        self.idle_since = self.clock.now_ms();
    }

    // Controller operations
    // --------------------------------------------------------------------------------

    /// Make `params` the active drive, clear all state and recalibrate.
    pub fn set_active_drive(&mut self, params: DriveMediaParams) -> Result<(), FdcError> {
        self.motor_off();
        log::debug!(
            "set_active_drive(): drive {} {} {}",
            params.drive_letter(),
            params.drive_size,
            params.data_rate
        );
        self.params = params;
        self.drive_active = true;
        self.current_cylinder = 0;
        self.current_head = 0;
        self.current_sector = 1;
        self.initialized = false;
        self.last_error = false;
        self.no_disk = false;
        self.write_protected = false;
        self.control_mark = false;
        self.disk_change_inquired = false;
        self.idle = false;
        self.recalibrate_drive()
    }

    pub fn reset_controller(&mut self) -> Result<(), FdcError> {
        self.idle = false;
        let motor_bits = self.motor_bits();
        self.port.write(Register::Dcr, motor_bits);
        self.clock.sleep_ms(RESET_HOLD_MS);
        self.port
            .write(Register::Dcr, self.drive_select() | DCR_NOT_RESET | DCR_DMA_INT | motor_bits);
        self.wait_for_int()?;

        for _ in 0..3 {
            self.send_command(COMMAND_SENSE_INT_STATUS)?;
            self.get_data()?;
            self.get_data()?;
        }

        self.features = SpecialFeatures {
            fifo: self.probe_command(COMMAND_CONFIGURE, &[0x00, CONFIGURE_FLAGS, 0x00])?,
            perpendicular: self.probe_command(COMMAND_PERPENDICULAR_MODE, &[0x00])?,
        };
        log::debug!("reset_controller(): features: {:?}", self.features);

        if self.drive_active {
            self.set_communication_rate()?;
        }
        self.idle = true;
        Ok(())
    }

    /// Send an optional command byte. A controller that lacks it answers with a single 0x80
    /// result byte, which is consumed; otherwise the operands are sent.
    fn probe_command(&mut self, command: u8, operands: &[u8]) -> Result<bool, FdcError> {
        self.send_data(command)?;
        self.clock.sleep_ms(1);
        if self.port.read(Register::Msr) & (MSR_RQM | MSR_DIO) == (MSR_RQM | MSR_DIO) {
            let st0 = self.get_data()?;
            log::debug!("probe_command(): {:02X} rejected with {:02X}", command, st0);
            return Ok(false);
        }
        for &operand in operands {
            self.send_data(operand)?;
        }
        Ok(true)
    }

    /// Program the data rate and the Specify timings for the active drive.
    pub fn set_communication_rate(&mut self) -> Result<(), FdcError> {
        if !self.drive_active {
            return Ok(());
        }
        if self.params.data_rate == DataRate::Rate1000 && !self.features.perpendicular {
            log::warn!("set_communication_rate(): controller does not support 1Mbps");
        }

        self.port.write(Register::Drr, self.params.data_rate.drr_bits());

        let timings = SpecifyTimings::for_drive(self.params.drive_size, self.params.data_rate);
        self.params.srt = timings.srt;
        self.params.hlt = timings.hlt;
        self.params.hut = timings.hut;

        self.send_command(COMMAND_SPECIFY)?;
        self.send_data(timings.bytes[0])?;
        self.send_data(timings.bytes[1])?;

        if self.features.perpendicular {
            self.send_command(COMMAND_PERPENDICULAR_MODE)?;
            self.send_data(if self.params.perpendicular { PERPENDICULAR_ENABLE } else { 0x00 })?;
        }
        Ok(())
    }

    pub fn recalibrate_drive(&mut self) -> Result<(), FdcError> {
        if !self.drive_active {
            return Ok(());
        }
        if !self.initialized || self.last_error {
            self.reset_controller()?;
        }

        self.idle = false;
        self.motor_on();
        let drive = self.drive_select();

        for attempt in 0..DISK_OPERATION_RETRIES * 2 {
            if attempt > 0 {
                self.reset_controller()?;
                self.idle = false;
            }
            self.send_command(COMMAND_RECALIBRATE)?;
            self.send_data(drive)?;
            self.wait_for_int()?;

            self.send_command(COMMAND_SENSE_INT_STATUS)?;
            let st0 = self.get_data()?;
            let cylinder = self.get_data()?;

            if (st0 & ST0_SEEK_END != 0) && (st0 & ST0_UNIT_CHECK == 0) && cylinder == 0 {
                self.initialized = true;
                self.idle = true;
                return Ok(());
            }
            log::debug!("recalibrate_drive(): attempt {} st0: {:02X} cyl: {}", attempt + 1, st0, cylinder);
        }

        Err(self.fatal(FdcError::RecalibrationFailure {
            drive: self.params.drive_letter(),
        }))
    }

    /// Seek to a media cylinder and select a head. With double stepping the drive is stepped to
    /// twice `cylinder`.
    pub fn seek_drive(&mut self, cylinder: u8, head: u8) -> Result<(), FdcError> {
        if !self.drive_active {
            return Ok(());
        }
        self.service_motor();
        if !self.initialized || self.last_error {
            self.recalibrate_drive()?;
        }

        let physical = if self.params.double_stepping {
            debug_assert!(
                cylinder < self.params.logical_cylinders().max(1),
                "seek_drive() takes media cylinders, got {} with double stepping",
                cylinder
            );
            cylinder.saturating_mul(2)
        }
        else {
            cylinder
        };

        if self.params.drive_size == DriveSize::Eight {
            self.port
                .set_reduced_write_current(physical > REDUCED_WRITE_CURRENT_CYLINDER);
        }

        self.idle = false;
        self.motor_on();

        for attempt in 0..DISK_OPERATION_RETRIES {
            if attempt > 0 {
                self.recalibrate_drive()?;
                self.idle = false;
            }
            self.send_command(COMMAND_SEEK)?;
            self.send_data(DriveHeadSelect::encode(self.drive_select(), head))?;
            self.send_data(physical)?;
            self.wait_for_int()?;

            self.send_command(COMMAND_SENSE_INT_STATUS)?;
            let st0 = self.get_data()?;
            let sensed = self.get_data()?;

            if (st0 & ST0_SEEK_END != 0) && (st0 & ST0_UNIT_CHECK == 0) && sensed == physical {
                self.current_cylinder = cylinder;
                self.current_head = head;
                self.idle = true;
                return Ok(());
            }
            log::debug!(
                "seek_drive(): attempt {} to {} st0: {:02X} cyl: {}",
                attempt + 1,
                physical,
                st0,
                sensed
            );
        }

        Err(self.fatal(FdcError::SeekFailure {
            drive: self.params.drive_letter(),
        }))
    }

    /// Sense Drive Status. Returns ST3.
    pub fn sense_drive_status(&mut self) -> Result<u8, FdcError> {
        self.send_command(COMMAND_SENSE_DRIVE_STATUS)?;
        self.send_data(DriveHeadSelect::encode(self.drive_select(), self.current_head))?;
        self.get_data()
    }

    /// Seek to `last_cylinder`, then step back one cylinder at a time until the drive reports
    /// track 0. Passes if that happens exactly at cylinder 0.
    pub fn seek_test(&mut self, last_cylinder: u8) -> Result<bool, FdcError> {
        self.seek_drive(last_cylinder, 0)?;
        let mut cylinder = last_cylinder;
        loop {
            let st3 = self.sense_drive_status()?;
            if st3 & ST3_TRACK0 != 0 {
                log::debug!("seek_test(): track 0 at cylinder {}", cylinder);
                return Ok(cylinder == 0);
            }
            if cylinder == 0 {
                return Ok(false);
            }
            cylinder -= 1;
            self.seek_drive(cylinder, 0)?;
        }
    }

    /// Read a single sector ID from whatever passes under the head. `None` if no ID could be
    /// read; the no-disk flag tells a missing disk apart from unreadable media.
    pub fn read_sector_id(&mut self) -> Result<Option<SectorAddress>, FdcError> {
        if !self.drive_active {
            return Ok(None);
        }
        self.service_motor();
        if !self.initialized || self.last_error {
            self.recalibrate_drive()?;
            self.seek_drive(self.current_cylinder, self.current_head)?;
        }
        self.motor_on();
        self.idle = false;
        self.no_disk = false;

        self.phase.arm(PhaseMode::Acknowledge, 0);
        self.send_command(COMMAND_READ_ID)?;
        self.send_data(DriveHeadSelect::encode(self.drive_select(), self.current_head))?;

        if !self.pump_phase() {
            self.signal_no_disk();
            return Ok(None);
        }

        let mut result = [0u8; 7];
        for byte in result.iter_mut() {
            *byte = self.get_data()?;
        }
        self.idle = true;

        if result[0] & ST0_INTERRUPT_CODE != 0 {
            return Ok(None);
        }
        Ok(Some(SectorAddress::new(result[3], result[4], result[5], result[6])))
    }

    fn signal_no_disk(&mut self) {
        self.idle = true;
        self.last_error = true;
        self.no_disk = true;
        self.last_fault = None;
        self.last_error_message = Some(FdcError::NoMediumPresent.to_string());
        self.motor_off();
    }

    fn transfer_allowed(&self, start: u8, end: u8, offset: usize) -> bool {
        let spt = self.params.sectors_per_track;
        if !self.drive_active || start == 0 || start > end || end > spt {
            return false;
        }
        let count = end - start + 1;
        if count > self.maximum_sector_count_for_rw(start, 0) {
            return false;
        }
        if self.params.sector_size_code() > MAX_TRANSFER_SIZE_CODE {
            return false;
        }
        offset + count as usize * self.sector_size() <= SECTOR_BUFFER_SIZE
    }

    fn data_operands(&self, start: u8, end: u8, cylinder: u8, head: u8) -> [u8; 8] {
        let size_code = self.params.sector_size_code();
        [
            DriveHeadSelect::encode(self.drive_select(), self.current_head),
            cylinder,
            head,
            start,
            size_code,
            end,
            self.params.gap_length,
            if size_code == 0 { 0x80 } else { 0xFF },
        ]
    }

    /// Read or write sectors `start..=end` of the current track through the sector buffer.
    /// Returns the number of bytes moved, or 0 on failure with the error flags set.
    pub fn read_write_sectors(
        &mut self,
        write: bool,
        start: u8,
        end: u8,
        options: TransferOptions,
    ) -> Result<usize, FdcError> {
        if !self.transfer_allowed(start, end, options.buffer_offset) {
            log::debug!("read_write_sectors(): rejected {}..={} @ {}", start, end, options.buffer_offset);
            return Ok(0);
        }

        let command = match (write, options.deleted_mark) {
            (false, false) => COMMAND_READ_DATA,
            (false, true) => COMMAND_READ_DELETED_DATA,
            (true, false) => COMMAND_WRITE_DATA,
            (true, true) => COMMAND_WRITE_DELETED_DATA,
        };
        let mode = if write { PhaseMode::Write } else { PhaseMode::Read };
        let cylinder = options.logical_cylinder.unwrap_or(self.current_cylinder);
        let head = options.logical_head.unwrap_or(self.current_head);
        let operands = self.data_operands(start, end, cylinder, head);

        let moved = self.run_data_command(mode, options.buffer_offset, command, &operands, start, end)?;
        if write && !self.last_error {
            self.disk_change_inquired = false;
        }
        Ok(moved)
    }

    /// Convenience wrapper for a plain read into the start of the buffer.
    pub fn read_sectors(&mut self, start: u8, end: u8) -> Result<usize, FdcError> {
        self.read_write_sectors(false, start, end, TransferOptions::default())
    }

    /// Convenience wrapper for a plain write from the start of the buffer.
    pub fn write_sectors(&mut self, start: u8, end: u8) -> Result<usize, FdcError> {
        self.read_write_sectors(true, start, end, TransferOptions::default())
    }

    /// Read sectors without storing them, to check they can be read back.
    pub fn verify(
        &mut self,
        sector: u8,
        whole_track: bool,
        logical_cylinder: Option<u8>,
        logical_head: Option<u8>,
    ) -> Result<usize, FdcError> {
        let (start, end) = if whole_track {
            (1, self.params.sectors_per_track)
        }
        else {
            (sector, sector)
        };
        if !self.drive_active || start == 0 || start > end || end > self.params.sectors_per_track {
            return Ok(0);
        }
        let operands = self.data_operands(
            start,
            end,
            logical_cylinder.unwrap_or(self.current_cylinder),
            logical_head.unwrap_or(self.current_head),
        );
        self.run_data_command(PhaseMode::Verify, 0, COMMAND_READ_DATA, &operands, start, end)
    }

    /// Seek to cylinder 0 head 0 and verify the whole track.
    pub fn verify_track0(&mut self, before_write: bool) -> Result<bool, FdcError> {
        self.seek_drive(0, 0)?;
        self.verify(1, true, None, None)?;
        if !self.last_error {
            return Ok(true);
        }

        let message = if self.no_disk {
            FdcError::NoMediumPresent.to_string()
        }
        else if before_write {
            "Bad Track0 or wrong drive setup. Try low-level format first".to_string()
        }
        else {
            "Bad Track0 or wrong drive setup".to_string()
        };
        log::warn!("verify_track0(): {}", message);
        self.last_error_message = Some(message);
        Ok(false)
    }

    /// Format the current track. With `custom_table` the C,H,R,N table must already be in the
    /// buffer; otherwise one is generated from the current position and `interleave`.
    pub fn format_track(&mut self, custom_table: bool, interleave: u8) -> Result<bool, FdcError> {
        if !self.drive_active {
            return Ok(false);
        }
        let spt = self.params.sectors_per_track;
        if spt == 0 || spt as usize * 4 > SECTOR_BUFFER_SIZE {
            return Ok(false);
        }
        let size_code = self.params.sector_size_code();

        if !custom_table {
            let (cylinder, head) = (self.current_cylinder, self.current_head);
            let order = skew_table(spt, interleave);
            for (entry, sector) in self.phase.buffer_mut().chunks_exact_mut(4).zip(order) {
                entry.copy_from_slice(&[cylinder, head, sector, size_code]);
            }
        }

        let operands = [
            DriveHeadSelect::encode(self.drive_select(), self.current_head),
            size_code,
            spt,
            self.params.format_gap_length,
            self.params.format_filler,
        ];
        self.run_data_command(PhaseMode::Write, 0, COMMAND_FORMAT_TRACK, &operands, 1, spt)?;
        if !self.last_error {
            self.disk_change_inquired = false;
        }
        Ok(!self.last_error)
    }

    /// Shared retry loop for every command with an execution phase.
    fn run_data_command(
        &mut self,
        mode: PhaseMode,
        offset: usize,
        command: u8,
        operands: &[u8],
        start: u8,
        end: u8,
    ) -> Result<usize, FdcError> {
        self.service_motor();
        if !self.initialized || self.last_error {
            self.recalibrate_drive()?;
            self.seek_drive(self.current_cylinder, self.current_head)?;
        }

        self.current_sector = start;
        self.no_disk = false;
        self.motor_on();

        for attempt in 0..DISK_OPERATION_RETRIES {
            if attempt > 0 {
                log::debug!("run_data_command(): {:02X} retry {}", command, attempt);
                self.recalibrate_drive()?;
                self.seek_drive(self.current_cylinder, self.current_head)?;
            }
            self.idle = false;
            self.phase.arm(mode, offset);

            self.send_command(command)?;
            for &operand in operands {
                self.send_data(operand)?;
            }

            if !self.pump_phase() {
                self.signal_no_disk();
                log::warn!("{}", FdcError::NoMediumPresent);
                return Ok(0);
            }

            let mut result = [0u8; 7];
            for byte in result.iter_mut() {
                *byte = self.get_data()?;
            }
            if self.phase.overflowed() {
                log::warn!("run_data_command(): controller sent more bytes than the buffer holds");
            }
            if self.process_io_result(result[0], result[1], result[2], end) {
                return Ok(self.phase.position().saturating_sub(offset));
            }
        }

        if let Some(message) = &self.last_error_message {
            log::warn!("{}", message);
        }
        Ok(0)
    }

    /// Classify the status bytes of a completed command. Returns true on success.
    pub fn process_io_result(&mut self, st0: u8, st1: u8, st2: u8, end_sector: u8) -> bool {
        self.idle = true;
        self.last_error = false;
        self.write_protected = false;
        self.control_mark = st2 & ST2_CONTROL_MARK != 0;

        if (st0 & ST0_INTERRUPT_CODE == 0) || (st1 & ST1_END_OF_CYLINDER != 0) {
            self.last_fault = None;
            return true;
        }

        self.last_error = true;
        let fault = IoFault::classify(st0, st1, st2);
        let message = match fault {
            IoFault::WriteProtected => {
                self.write_protected = true;
                fault.to_string()
            }
            _ => format!("{}{}", self.chs_prefix(end_sector), fault),
        };
        self.last_fault = Some(fault);
        self.last_error_message = Some(message);
        false
    }

    fn chs_prefix(&self, end_sector: u8) -> String {
        if end_sector > self.current_sector {
            format!(
                "CHS {:02}/{}/{:02}-{:02} ",
                self.current_cylinder, self.current_head, self.current_sector, end_sector
            )
        }
        else {
            format!(
                "CHS {:02}/{}/{:02} ",
                self.current_cylinder, self.current_head, self.current_sector
            )
        }
    }

    /// True if the disk may have been changed since the last call. Always true for drives
    /// without a change line, and true once after a drive switch, write or format.
    pub fn is_disk_changed(&mut self) -> Result<bool, FdcError> {
        if !self.drive_active || !self.params.disk_change_line {
            return Ok(true);
        }
        if !self.disk_change_inquired {
            self.disk_change_inquired = true;
            return Ok(true);
        }

        self.motor_on();
        let changed = self.port.read(Register::Drr) & DRR_DISK_CHANGE != 0;

        // The latch only clears on a step pulse.
        let (cylinder, head) = (self.current_cylinder, self.current_head);
        let away = if cylinder + 1 < self.cylinder_count() {
            cylinder + 1
        }
        else {
            cylinder.saturating_sub(1)
        };
        self.seek_drive(away, head)?;
        self.seek_drive(cylinder, head)?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::VirtualClock,
        devices::fdc::sim::{FaultInjection, SimDisk, SimulatedController, TrackLayout},
    };

    type SimDriver = ControllerDriver<SimulatedController, VirtualClock>;

    fn driver_with(disk: Option<SimDisk>, params: DriveMediaParams) -> SimDriver {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = VirtualClock::new();
        let mut sim = SimulatedController::new(clock.clone());
        if let Some(disk) = disk {
            sim.insert_disk(params.drive_number as usize, disk);
        }
        let mut driver = ControllerDriver::new(sim, clock);
        driver.set_active_drive(params).unwrap();
        driver
    }

    fn formatted_360k() -> SimDriver {
        let params = DriveMediaParams::pc_360k(0);
        let disk = SimDisk::formatted(40, 2, &TrackLayout::from_params(&params)).with_pattern();
        driver_with(Some(disk), params)
    }

    #[test]
    fn test_seek_idempotent() {
        let mut driver = formatted_360k();
        driver.seek_drive(5, 1).unwrap();
        driver.port_mut().reset_stats();

        driver.seek_drive(5, 1).unwrap();
        assert_eq!(driver.port().stats().recalibrates, 0);
        assert_eq!(driver.port().stats().seeks, 1);
        assert_eq!((driver.current_cylinder(), driver.current_head()), (5, 1));
        assert_eq!(driver.port().drive_cylinder(0), 5);
    }

    #[test]
    fn test_double_step_seek() {
        let mut params = DriveMediaParams::pc_360k(0);
        params.cylinders = 80;
        params.double_stepping = true;
        let layout = TrackLayout::from_params(&params);
        let mut driver = driver_with(Some(SimDisk::formatted_double_stepped(40, 2, &layout)), params);

        assert_eq!(driver.cylinder_count(), 40);
        driver.seek_drive(7, 0).unwrap();
        assert_eq!(driver.current_cylinder(), 7);
        assert_eq!(driver.port().drive_cylinder(0), 14);
        assert_eq!(driver.read_sector_id().unwrap().map(|id| id.c()), Some(7));
    }

    #[test]
    fn test_retry_bound() {
        let mut driver = formatted_360k();
        driver.port_mut().set_faults(FaultInjection {
            always_fail: true,
            ..Default::default()
        });
        driver.port_mut().reset_stats();

        assert_eq!(driver.read_sectors(1, 1).unwrap(), 0);
        let stats = driver.port().stats();
        assert_eq!(stats.data_commands, DISK_OPERATION_RETRIES);
        assert_eq!(stats.recalibrates, DISK_OPERATION_RETRIES - 1);
        assert_eq!(stats.seeks, DISK_OPERATION_RETRIES - 1);
        assert!(driver.last_error());
        assert_eq!(driver.last_fault(), Some(IoFault::Crc));
        assert_eq!(driver.last_error_message(), Some("CHS 00/0/01 CRC error"));

        assert_eq!(driver.read_sectors(2, 4).unwrap(), 0);
        assert_eq!(driver.last_error_message(), Some("CHS 00/0/02-04 CRC error"));
    }

    #[test]
    fn test_transient_failure_recovers() {
        let mut driver = formatted_360k();
        driver.port_mut().faults_mut().fail_next = 2;
        assert_eq!(driver.read_sectors(1, 1).unwrap(), 512);
        assert!(!driver.last_error());
        assert_eq!(driver.port().stats().data_commands, 3);
    }

    #[test]
    fn test_no_disk_times_out() {
        let mut driver = driver_with(None, DriveMediaParams::pc_360k(0));
        let before = driver.clock().now_ms();
        assert_eq!(driver.read_sectors(1, 1).unwrap(), 0);
        assert!(driver.no_disk());
        assert!(driver.last_error());
        assert_eq!(driver.last_error_message(), Some("No disk in drive"));
        assert!(driver.clock().now_ms() - before >= IO_TIMEOUT_MS);
        assert!(!driver.is_motor_on());

        assert_eq!(driver.read_sector_id().unwrap(), None);
        assert!(driver.no_disk());
    }

    #[test]
    fn test_write_protected() {
        let params = DriveMediaParams::pc_360k(0);
        let disk = SimDisk::formatted(40, 2, &TrackLayout::from_params(&params)).with_write_protect(true);
        let mut driver = driver_with(Some(disk), params);

        assert_eq!(driver.write_sectors(1, 1).unwrap(), 0);
        assert!(driver.write_protected());
        assert_eq!(driver.last_error_message(), Some("Disk is write protected"));
        assert!(!driver.format_track(false, 1).unwrap());
        assert!(driver.write_protected());
    }

    #[test]
    fn test_read_write_round_trip() {
        let mut driver = formatted_360k();
        driver.seek_drive(3, 1).unwrap();
        driver.buffer_mut()[..1024].fill(0x5A);
        assert_eq!(driver.write_sectors(2, 3).unwrap(), 1024);

        driver.buffer_mut().fill(0);
        assert_eq!(driver.read_sectors(2, 3).unwrap(), 1024);
        assert!(driver.buffer()[..1024].iter().all(|&b| b == 0x5A));

        let disk = driver.port().disk(0).unwrap();
        assert_eq!(disk.track(3, 1).unwrap().sector(3).unwrap().data, vec![0x5A; 512]);
        assert_ne!(disk.track(3, 1).unwrap().sector(4).unwrap().data, vec![0x5A; 512]);

        assert_eq!(driver.verify(2, false, None, None).unwrap(), 512);
        assert_eq!(driver.verify(0, true, None, None).unwrap(), 9 * 512);
        assert!(driver.verify_track0(false).unwrap());
    }

    #[test]
    fn test_transfer_limits() {
        let mut driver = formatted_360k();
        driver.port_mut().reset_stats();
        assert_eq!(driver.read_sectors(0, 1).unwrap(), 0);
        assert_eq!(driver.read_sectors(1, 10).unwrap(), 0);
        assert_eq!(driver.read_sectors(3, 2).unwrap(), 0);
        // more than the sector buffer holds
        assert_eq!(driver.read_sectors(1, 9).unwrap(), 0);
        driver.params_mut().sector_size = 4096;
        assert_eq!(driver.read_sectors(1, 1).unwrap(), 0);
        assert_eq!(driver.port().stats().data_commands, 0);
        assert!(!driver.last_error());
    }

    #[test]
    fn test_buffer_offset() {
        let mut driver = formatted_360k();
        let options = TransferOptions {
            buffer_offset: 1024,
            ..Default::default()
        };
        assert_eq!(driver.read_write_sectors(false, 5, 5, options).unwrap(), 512);
        let expected = driver.port().disk(0).unwrap().track(0, 0).unwrap().sector(5).unwrap().data.clone();
        assert_eq!(&driver.buffer()[1024..1536], &expected[..]);
    }

    #[test]
    fn test_format_track() {
        let mut driver = formatted_360k();
        driver.seek_drive(1, 0).unwrap();
        assert!(driver.format_track(false, 2).unwrap());

        let track = driver.port().disk(0).unwrap().track(1, 0).unwrap();
        let order: Vec<u8> = track.sectors.iter().map(|s| s.id.s()).collect();
        assert_eq!(order, vec![1, 3, 5, 7, 9, 2, 4, 6, 8]);
        assert!(track.sectors.iter().all(|s| s.id.c() == 1 && s.data == vec![0xF6; 512]));

        for (i, entry) in driver.buffer_mut().chunks_exact_mut(4).take(9).enumerate() {
            entry.copy_from_slice(&[20, 1, 9 - i as u8, 2]);
        }
        assert!(driver.format_track(true, 1).unwrap());
        let track = driver.port().disk(0).unwrap().track(1, 0).unwrap();
        assert_eq!(track.sectors[0].id, SectorAddress::new(20, 1, 9, 2));
        assert_eq!(track.sectors[8].id, SectorAddress::new(20, 1, 1, 2));

        let moved = driver
            .read_write_sectors(false, 4, 4, TransferOptions::logical(20, 1))
            .unwrap();
        assert_eq!(moved, 512);
        assert_eq!(driver.read_sectors(4, 4).unwrap(), 0);
    }

    #[test]
    fn test_deleted_mark() {
        let mut driver = formatted_360k();
        driver.buffer_mut()[..512].fill(0x33);
        let options = TransferOptions::default().with_deleted_mark(true);
        assert_eq!(driver.read_write_sectors(true, 4, 4, options).unwrap(), 512);
        assert!(driver.port().disk(0).unwrap().track(0, 0).unwrap().sector(4).unwrap().deleted);

        assert_eq!(driver.read_sectors(4, 4).unwrap(), 512);
        assert!(driver.control_mark());
        assert_eq!(driver.buffer()[0], 0x33);

        assert_eq!(driver.read_sectors(5, 5).unwrap(), 512);
        assert!(!driver.control_mark());
    }

    #[test]
    fn test_geometry_helpers() {
        let driver = formatted_360k();
        assert_eq!(driver.total_sector_count(), 720);
        assert_eq!(driver.convert_logical_sector_to_chs(0), SectorAddress::new(0, 0, 1, 2));
        assert_eq!(driver.convert_logical_sector_to_chs(9), SectorAddress::new(0, 1, 1, 2));
        assert_eq!(driver.convert_logical_sector_to_chs(20), SectorAddress::new(1, 0, 3, 2));
        assert_eq!(driver.maximum_sector_count_for_rw(1, 0), 6);
        assert_eq!(driver.maximum_sector_count_for_rw(8, 0), 2);
        assert_eq!(driver.maximum_sector_count_for_rw(1, 1024), 2);
        assert_eq!(driver.maximum_sector_count_for_rw(0, 0), 0);
        assert_eq!(driver.maximum_sector_count_for_rw(10, 0), 0);
    }

    #[test]
    fn test_io_result_messages() {
        let mut driver = formatted_360k();
        driver.seek_drive(1, 0).unwrap();
        driver.current_sector = 3;
        assert!(!driver.process_io_result(0x40, ST1_CRC_ERROR, 0, 3));
        assert_eq!(driver.last_error_message(), Some("CHS 01/0/03 CRC error"));
        assert!(!driver.process_io_result(0x40, ST1_WRITE_PROTECT, 0, 5));
        assert_eq!(driver.last_error_message(), Some("Disk is write protected"));
        assert!(driver.process_io_result(0x40, ST1_END_OF_CYLINDER, 0, 5));
        assert!(!driver.last_error());
        assert!(driver.process_io_result(0, 0, ST2_CONTROL_MARK, 5));
        assert!(driver.control_mark());
    }

    #[test]
    fn test_recalibration_failure_is_fatal() {
        let mut driver = formatted_360k();
        driver.port_mut().faults_mut().recalibrate_failures = 100;
        let err = driver.recalibrate_drive().unwrap_err();
        assert!(matches!(err, FdcError::RecalibrationFailure { drive: 'A' }));
        assert!(err.is_fatal());
        assert!(!driver.is_motor_on());
    }

    #[test]
    fn test_seek_failure_is_fatal() {
        let mut driver = formatted_360k();
        driver.port_mut().faults_mut().seek_failures = DISK_OPERATION_RETRIES;
        let err = driver.seek_drive(10, 0).unwrap_err();
        assert!(matches!(err, FdcError::SeekFailure { drive: 'A' }));

        let mut driver = formatted_360k();
        driver.port_mut().faults_mut().seek_failures = DISK_OPERATION_RETRIES - 1;
        driver.seek_drive(10, 0).unwrap();
        assert_eq!(driver.current_cylinder(), 10);
    }

    #[test]
    fn test_probe_features() {
        let mut driver = formatted_360k();
        assert_eq!(
            driver.features(),
            SpecialFeatures {
                fifo: true,
                perpendicular: true
            }
        );
        driver.port_mut().set_features(false, false);
        driver.reset_controller().unwrap();
        assert_eq!(driver.features(), SpecialFeatures::default());
    }

    #[test]
    fn test_disk_change() {
        let params = DriveMediaParams::pc_1440k(0);
        let disk = SimDisk::formatted(80, 2, &TrackLayout::from_params(&params));
        let mut driver = driver_with(Some(disk), params);

        assert!(driver.is_disk_changed().unwrap());
        assert!(driver.is_disk_changed().unwrap());
        assert!(!driver.is_disk_changed().unwrap());

        driver.buffer_mut()[..512].fill(1);
        driver.write_sectors(1, 1).unwrap();
        assert!(driver.is_disk_changed().unwrap());

        let mut driver = formatted_360k();
        assert!(driver.is_disk_changed().unwrap());
        assert!(driver.is_disk_changed().unwrap());
    }

    #[test]
    fn test_motor_idle_off() {
        let mut driver = formatted_360k();
        driver.read_sectors(1, 1).unwrap();
        assert!(driver.is_motor_on());
        driver.clock_mut().sleep_ms(MOTOR_IDLE_OFF_MS + 1);
        driver.service_motor();
        assert!(!driver.is_motor_on());

        driver.set_automatic_motor_off(false);
        driver.read_sectors(1, 1).unwrap();
        driver.clock_mut().sleep_ms(MOTOR_IDLE_OFF_MS + 1);
        driver.service_motor();
        assert!(driver.is_motor_on());
    }
}
