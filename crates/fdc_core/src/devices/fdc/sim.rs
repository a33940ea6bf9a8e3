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

    devices::fdc::sim.rs

    A software model of a µPD765 style controller with four drives and in-memory
    disks. It implements RegisterPort, so the driver cannot tell it apart from a
    real board, and it runs on a VirtualClock so rotation and timeouts cost no
    wall time.
    
    The model follows the command / execution / result phase sequence of the
    real part closely enough for the driver's handshake, including the things
    that go wrong: missing media stalls the execution phase, invalid commands
    answer 0x80, and a reset leaves four interrupt entries to be sensed.
*/

use std::collections::VecDeque;

use fdc_common::{util::hex_bytes, CommandLog};
use serde_derive::Deserialize;

use crate::{
    clock::{Clock, VirtualClock},
    device_types::{
        chs::SectorAddress,
        media::{sector_size_bytes, DataRate, DriveMediaParams},
    },
    devices::fdc::registers::*,
    geometry::interleave::skew_table,
};

pub const SIM_DRIVE_COUNT: usize = 4;
/// One revolution at 300 RPM.
pub const REVOLUTION_MS: u64 = 200;
pub const DEFAULT_DRIVE_CYLINDERS: u8 = 80;
const COMMAND_LOG_LEN: usize = 64;

type CommandDispatchFn = fn(&mut SimulatedController) -> Continuation;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    NoCommand,
    Specify,
    SenseDriveStatus,
    Recalibrate,
    SenseIntStatus,
    Seek,
    PerpendicularMode,
    Configure,
    ReadData,
    ReadDeletedData,
    WriteData,
    WriteDeletedData,
    ReadId,
    FormatTrack,
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ControllerPhase {
    Command,
    Execution(Transfer),
    Result,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Transfer {
    ToHost,
    FromHost,
    /// Waiting on media that will never arrive. Only a reset gets out of this.
    Stalled,
}

enum Continuation {
    CommandComplete,
    ContinueAsOperation,
}

enum Operation {
    NoOperation,
    WriteData {
        drive: usize,
        head: u8,
        id: SectorAddress,
        eot: u8,
        deleted: bool,
        collected: Vec<u8>,
    },
    FormatTrack {
        drive: usize,
        head: u8,
        size_code: u8,
        spt: u8,
        filler: u8,
        table: Vec<u8>,
    },
}

/// Failures the model produces on request.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FaultInjection {
    /// Fail this many upcoming read, write and format commands with a CRC error.
    pub fail_next: u32,
    /// Fail every read, write and format command.
    pub always_fail: bool,
    /// Report this many upcoming recalibrates as failed.
    pub recalibrate_failures: u32,
    /// Report this many upcoming seeks as failed.
    pub seek_failures: u32,
}

/// Counts of commands executed, for checking retry behavior.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub resets: u32,
    pub recalibrates: u32,
    pub seeks: u32,
    pub data_commands: u32,
    pub read_ids: u32,
    pub formats: u32,
}

#[derive(Clone, Debug)]
pub struct SimSector {
    pub id: SectorAddress,
    pub data: Vec<u8>,
    pub deleted: bool,
    pub crc_error: bool,
}

/// One physical track. A track with no sectors is unformatted.
#[derive(Clone, Debug)]
pub struct SimTrack {
    pub rate: DataRate,
    pub fm: bool,
    /// Sectors in rotational order.
    pub sectors: Vec<SimSector>,
}

impl Default for SimTrack {
    fn default() -> Self {
        Self {
            rate: DataRate::Rate500,
            fm: false,
            sectors: Vec::new(),
        }
    }
}

impl SimTrack {
    fn readable(&self, rate: DataRate, fm: bool) -> bool {
        !self.sectors.is_empty() && self.rate == rate && self.fm == fm
    }

    pub fn sector(&self, number: u8) -> Option<&SimSector> {
        self.sectors.iter().find(|s| s.id.s() == number)
    }

    pub fn sector_mut(&mut self, number: u8) -> Option<&mut SimSector> {
        self.sectors.iter_mut().find(|s| s.id.s() == number)
    }

    fn find(&self, id: &SectorAddress) -> Option<usize> {
        self.sectors.iter().position(|s| s.id == *id)
    }
}

/// How to lay out the tracks of a freshly formatted [SimDisk].
#[derive(Copy, Clone, Debug)]
pub struct TrackLayout {
    pub rate: DataRate,
    pub fm: bool,
    pub sectors_per_track: u8,
    pub size_code: u8,
    pub skew: u8,
    pub filler: u8,
}

impl TrackLayout {
    pub fn from_params(params: &DriveMediaParams) -> Self {
        Self {
            rate: params.data_rate,
            fm: params.fm,
            sectors_per_track: params.sectors_per_track,
            size_code: params.sector_size_code(),
            skew: 1,
            filler: params.format_filler,
        }
    }

    pub fn with_skew(mut self, skew: u8) -> Self {
        self.skew = skew;
        self
    }

    fn build(&self, cylinder: u8, head: u8) -> SimTrack {
        let size = sector_size_bytes(self.size_code);
        SimTrack {
            rate: self.rate,
            fm: self.fm,
            sectors: skew_table(self.sectors_per_track, self.skew)
                .into_iter()
                .map(|s| SimSector {
                    id: SectorAddress::new(cylinder, head, s, self.size_code),
                    data: vec![self.filler; size],
                    deleted: false,
                    crc_error: false,
                })
                .collect(),
        }
    }
}

/// A disk: `cylinders` physical tracks per side, always two sides.
#[derive(Clone, Debug)]
pub struct SimDisk {
    cylinders: u8,
    tracks: Vec<SimTrack>,
    pub write_protected: bool,
}

impl SimDisk {
    pub fn unformatted(cylinders: u8) -> Self {
        Self {
            cylinders,
            tracks: vec![SimTrack::default(); cylinders as usize * 2],
            write_protected: false,
        }
    }

    /// Format `heads` sides of every cylinder with `layout`.
    pub fn formatted(cylinders: u8, heads: u8, layout: &TrackLayout) -> Self {
        let mut disk = Self::unformatted(cylinders);
        for c in 0..cylinders {
            for h in 0..heads.min(2) {
                disk.tracks[Self::index(c, h)] = layout.build(c, h);
            }
        }
        disk
    }

    /// A disk written in a drive with half the tracks: `media_cylinders` cylinders spread over
    /// twice as many physical tracks, each pair carrying the same cylinder ID.
    pub fn formatted_double_stepped(media_cylinders: u8, heads: u8, layout: &TrackLayout) -> Self {
        let physical = media_cylinders.saturating_mul(2);
        let mut disk = Self::unformatted(physical);
        for p in 0..physical {
            for h in 0..heads.min(2) {
                disk.tracks[Self::index(p, h)] = layout.build(p / 2, h);
            }
        }
        disk
    }

    /// Fill every sector with bytes derived from its ID, so misplaced data shows up.
    pub fn with_pattern(mut self) -> Self {
        for track in self.tracks.iter_mut() {
            for sector in track.sectors.iter_mut() {
                let seed = sector.id.c() ^ (sector.id.h() << 6) ^ sector.id.s();
                for (i, byte) in sector.data.iter_mut().enumerate() {
                    *byte = seed.wrapping_add(i as u8);
                }
            }
        }
        self
    }

    pub fn with_write_protect(mut self, write_protected: bool) -> Self {
        self.write_protected = write_protected;
        self
    }

    fn index(cylinder: u8, head: u8) -> usize {
        cylinder as usize * 2 + (head & 1) as usize
    }

    pub fn cylinders(&self) -> u8 {
        self.cylinders
    }

    pub fn track(&self, cylinder: u8, head: u8) -> Option<&SimTrack> {
        self.tracks.get(Self::index(cylinder, head)).filter(|_| cylinder < self.cylinders)
    }

    pub fn track_mut(&mut self, cylinder: u8, head: u8) -> Option<&mut SimTrack> {
        if cylinder >= self.cylinders {
            return None;
        }
        self.tracks.get_mut(Self::index(cylinder, head))
    }
}

#[derive(Clone, Debug)]
pub struct SimDrive {
    /// Physical head position.
    cylinder: u8,
    max_cylinders: u8,
    motor: bool,
    disk_changed: bool,
    disk: Option<SimDisk>,
}

impl Default for SimDrive {
    fn default() -> Self {
        Self {
            cylinder: 0,
            max_cylinders: DEFAULT_DRIVE_CYLINDERS,
            motor: false,
            disk_changed: true,
            disk: None,
        }
    }
}

impl SimDrive {
    fn ready(&self) -> bool {
        self.motor && self.disk.is_some()
    }

    fn track(&self, head: u8) -> Option<&SimTrack> {
        self.disk.as_ref().and_then(|d| d.track(self.cylinder, head))
    }
}

pub struct SimulatedController {
    clock: VirtualClock,
    drives: [SimDrive; SIM_DRIVE_COUNT],
    dcr: u8,
    in_reset: bool,
    rate: DataRate,
    reduced_write_current: bool,
    supports_fifo: bool,
    supports_perpendicular: bool,

    phase: ControllerPhase,
    command: Command,
    command_fn: Option<CommandDispatchFn>,
    command_byte_n: u32,
    command_mfm: bool,
    data_register_in: VecDeque<u8>,
    data_register_out: VecDeque<u8>,
    result_bytes: VecDeque<u8>,
    operation: Operation,

    pending_interrupt: bool,
    reset_pending: u8,
    pending_seek: Option<[u8; 2]>,

    faults: FaultInjection,
    stats: SimStats,
    log: CommandLog,
}

impl SimulatedController {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            drives: Default::default(),
            dcr: 0,
            in_reset: false,
            rate: DataRate::Rate500,
            reduced_write_current: false,
            supports_fifo: true,
            supports_perpendicular: true,
            phase: ControllerPhase::Command,
            command: Command::NoCommand,
            command_fn: None,
            command_byte_n: 0,
            command_mfm: true,
            data_register_in: VecDeque::new(),
            data_register_out: VecDeque::new(),
            result_bytes: VecDeque::new(),
            operation: Operation::NoOperation,
            pending_interrupt: false,
            reset_pending: 0,
            pending_seek: None,
            faults: FaultInjection::default(),
            stats: SimStats::default(),
            log: CommandLog::new(COMMAND_LOG_LEN),
        }
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// Model a plain µPD765 that lacks Configure and Perpendicular Mode.
    pub fn set_features(&mut self, fifo: bool, perpendicular: bool) {
        self.supports_fifo = fifo;
        self.supports_perpendicular = perpendicular;
    }

    pub fn insert_disk(&mut self, drive: usize, disk: SimDisk) {
        if let Some(d) = self.drives.get_mut(drive) {
            d.disk = Some(disk);
            d.disk_changed = true;
        }
    }

    pub fn eject_disk(&mut self, drive: usize) -> Option<SimDisk> {
        let d = self.drives.get_mut(drive)?;
        d.disk_changed = true;
        d.disk.take()
    }

    pub fn disk(&self, drive: usize) -> Option<&SimDisk> {
        self.drives.get(drive).and_then(|d| d.disk.as_ref())
    }

    pub fn disk_mut(&mut self, drive: usize) -> Option<&mut SimDisk> {
        self.drives.get_mut(drive).and_then(|d| d.disk.as_mut())
    }

    pub fn set_drive_cylinders(&mut self, drive: usize, cylinders: u8) {
        if let Some(d) = self.drives.get_mut(drive) {
            d.max_cylinders = cylinders.max(1);
        }
    }

    /// Physical head position of a drive.
    pub fn drive_cylinder(&self, drive: usize) -> u8 {
        self.drives.get(drive).map(|d| d.cylinder).unwrap_or(0)
    }

    pub fn motor_on(&self, drive: usize) -> bool {
        self.drives.get(drive).map(|d| d.motor).unwrap_or(false)
    }

    pub fn data_rate(&self) -> DataRate {
        self.rate
    }

    pub fn reduced_write_current(&self) -> bool {
        self.reduced_write_current
    }

    pub fn faults_mut(&mut self) -> &mut FaultInjection {
        &mut self.faults
    }

    pub fn set_faults(&mut self, faults: FaultInjection) {
        self.faults = faults;
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SimStats::default();
    }

    pub fn command_log(&self) -> &CommandLog {
        &self.log
    }

    fn selected_drive(&self) -> usize {
        (self.dcr & DCR_DRIVE_MASK) as usize
    }

    fn handle_status_register_read(&self) -> u8 {
        if self.in_reset {
            return 0;
        }
        match self.phase {
            ControllerPhase::Command => {
                if self.command_byte_n > 0 {
                    MSR_RQM | MSR_BUSY
                }
                else {
                    MSR_RQM
                }
            }
            ControllerPhase::Execution(Transfer::ToHost) => MSR_RQM | MSR_DIO | MSR_NON_DMA | MSR_BUSY,
            ControllerPhase::Execution(Transfer::FromHost) => MSR_RQM | MSR_NON_DMA | MSR_BUSY,
            ControllerPhase::Execution(Transfer::Stalled) => MSR_NON_DMA | MSR_BUSY,
            ControllerPhase::Result => MSR_RQM | MSR_DIO | MSR_BUSY,
        }
    }

    fn handle_dcr_write(&mut self, data: u8) {
        let was_reset = self.in_reset;
        self.dcr = data;
        self.in_reset = data & DCR_NOT_RESET == 0;

        for (i, drive) in self.drives.iter_mut().enumerate() {
            drive.motor = data & (1 << (DCR_MOTOR_SHIFT as usize + i)) != 0;
        }

        if self.in_reset {
            self.phase = ControllerPhase::Command;
            self.command = Command::NoCommand;
            self.command_fn = None;
            self.command_byte_n = 0;
            self.data_register_in.clear();
            self.data_register_out.clear();
            self.result_bytes.clear();
            self.operation = Operation::NoOperation;
            self.pending_interrupt = false;
            self.pending_seek = None;
            self.reset_pending = 0;
        }
        else if was_reset {
            log::trace!("sim: reset released");
            self.stats.resets += 1;
            self.pending_interrupt = true;
            self.reset_pending = SIM_DRIVE_COUNT as u8;
        }
    }

    fn handle_data_register_read(&mut self) -> u8 {
        match self.phase {
            ControllerPhase::Execution(Transfer::ToHost) => {
                let byte = self.data_register_out.pop_front().unwrap_or(0);
                if self.data_register_out.is_empty() {
                    self.phase = ControllerPhase::Result;
                    self.pending_interrupt = true;
                }
                byte
            }
            ControllerPhase::Result => {
                self.pending_interrupt = false;
                let byte = self.result_bytes.pop_front().unwrap_or(0);
                if self.result_bytes.is_empty() {
                    self.phase = ControllerPhase::Command;
                }
                byte
            }
            _ => {
                log::warn!("sim: data register read in phase {:?}", self.phase);
                0xFF
            }
        }
    }

    fn set_command(&mut self, command: Command, n_bytes: u32, command_fn: CommandDispatchFn) {
        self.command = command;
        self.command_byte_n = n_bytes;
        self.command_fn = Some(command_fn);
        self.data_register_in.clear();
        if n_bytes == 0 {
            self.dispatch();
        }
    }

    fn handle_data_register_write(&mut self, data: u8) {
        match self.phase {
            ControllerPhase::Command if self.command_byte_n == 0 => self.decode_command(data),
            ControllerPhase::Command => {
                self.data_register_in.push_back(data);
                self.command_byte_n -= 1;
                if self.command_byte_n == 0 {
                    self.dispatch();
                }
            }
            ControllerPhase::Execution(Transfer::FromHost) => self.operation_byte_in(data),
            _ => {
                log::warn!("sim: data register write {:02X} in phase {:?}", data, self.phase);
            }
        }
    }

    fn decode_command(&mut self, data: u8) {
        let command_byte = CommandByte::from_bytes([data]);
        self.command_mfm = command_byte.mfm();
        if command_byte.command() != COMMAND_SENSE_INT_STATUS {
            // Unsensed reset entries are dropped by any other command.
            self.reset_pending = 0;
        }

        match command_byte.command() {
            c if c == COMMAND_SPECIFY => self.set_command(Command::Specify, 2, Self::command_specify),
            c if c == COMMAND_SENSE_DRIVE_STATUS => {
                self.set_command(Command::SenseDriveStatus, 1, Self::command_sense_drive_status)
            }
            c if c == COMMAND_RECALIBRATE => self.set_command(Command::Recalibrate, 1, Self::command_recalibrate),
            c if c == COMMAND_SENSE_INT_STATUS => {
                self.set_command(Command::SenseIntStatus, 0, Self::command_sense_interrupt)
            }
            c if c == COMMAND_SEEK => self.set_command(Command::Seek, 2, Self::command_seek),
            c if c == COMMAND_PERPENDICULAR_MODE && self.supports_perpendicular => {
                self.set_command(Command::PerpendicularMode, 1, Self::command_no_result)
            }
            c if c == COMMAND_CONFIGURE && self.supports_fifo => {
                self.set_command(Command::Configure, 3, Self::command_no_result)
            }
            c if c == COMMAND_READ_DATA & COMMAND_MASK => {
                self.set_command(Command::ReadData, 8, Self::command_read_data)
            }
            c if c == COMMAND_READ_DELETED_DATA & COMMAND_MASK => {
                self.set_command(Command::ReadDeletedData, 8, Self::command_read_data)
            }
            c if c == COMMAND_WRITE_DATA & COMMAND_MASK => {
                self.set_command(Command::WriteData, 8, Self::command_write_data)
            }
            c if c == COMMAND_WRITE_DELETED_DATA & COMMAND_MASK => {
                self.set_command(Command::WriteDeletedData, 8, Self::command_write_data)
            }
            c if c == COMMAND_READ_ID & COMMAND_MASK => self.set_command(Command::ReadId, 1, Self::command_read_id),
            c if c == COMMAND_FORMAT_TRACK & COMMAND_MASK => {
                self.set_command(Command::FormatTrack, 5, Self::command_format_track)
            }
            _ => {
                log::trace!("sim: invalid command byte {:02X}", data);
                self.command = Command::Invalid;
                self.log.push(format!("{:02X} invalid", data));
                self.send_results(&[ST0_INVALID_OPCODE], false);
            }
        }
    }

    fn dispatch(&mut self) {
        let operands: Vec<u8> = self.data_register_in.iter().copied().collect();
        self.log.push(format!("{:?} {}", self.command, hex_bytes(&operands)));

        if let Some(command_fn) = self.command_fn.take() {
            if let Continuation::ContinueAsOperation = command_fn(self) {
                log::trace!("sim: {:?} in phase {:?}", self.command, self.phase);
            }
        }
        self.data_register_in.clear();
    }

    fn operand(&self, n: usize) -> u8 {
        self.data_register_in.get(n).copied().unwrap_or(0)
    }

    fn send_results(&mut self, bytes: &[u8], interrupt: bool) {
        self.result_bytes = bytes.iter().copied().collect();
        self.phase = ControllerPhase::Result;
        self.pending_interrupt = interrupt;
    }

    /// Result phase of a read/write/format style command.
    fn send_data_results(&mut self, st: [u8; 3], drive: usize, head: u8, id: SectorAddress) {
        let st0 = st[0] | ((head & 1) << 2) | drive as u8;
        self.send_results(&[st0, st[1], st[2], id.c(), id.h(), id.s(), id.n()], true);
    }

    fn stall(&mut self) -> Continuation {
        log::trace!("sim: {:?} waiting on media", self.command);
        self.phase = ControllerPhase::Execution(Transfer::Stalled);
        Continuation::ContinueAsOperation
    }

    fn take_injected_fault(&mut self) -> bool {
        if self.faults.always_fail {
            return true;
        }
        if self.faults.fail_next > 0 {
            self.faults.fail_next -= 1;
            return true;
        }
        false
    }

    fn command_specify(&mut self) -> Continuation {
        self.phase = ControllerPhase::Command;
        Continuation::CommandComplete
    }

    fn command_no_result(&mut self) -> Continuation {
        self.phase = ControllerPhase::Command;
        Continuation::CommandComplete
    }

    fn command_sense_drive_status(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.operand(0)]);
        let drive = &self.drives[dhs.drive() as usize];
        let mut st3 = dhs.drive() | (dhs.head() << 2) | ST3_TWO_SIDE;
        if drive.cylinder == 0 {
            st3 |= ST3_TRACK0;
        }
        if drive.ready() {
            st3 |= ST3_READY;
        }
        if drive.disk.as_ref().is_some_and(|d| d.write_protected) {
            st3 |= ST3_WRITE_PROTECT;
        }
        self.send_results(&[st3], false);
        Continuation::CommandComplete
    }

    fn command_recalibrate(&mut self) -> Continuation {
        let drive_n = (self.operand(0) & DCR_DRIVE_MASK) as usize;
        self.stats.recalibrates += 1;

        let drive = &mut self.drives[drive_n];
        let st0 = if self.faults.recalibrate_failures > 0 {
            self.faults.recalibrate_failures -= 1;
            ST0_ABNORMAL_TERMINATION | ST0_SEEK_END | ST0_UNIT_CHECK | drive_n as u8
        }
        else {
            if drive.cylinder != 0 && drive.disk.is_some() {
                drive.disk_changed = false;
            }
            drive.cylinder = 0;
            ST0_SEEK_END | drive_n as u8
        };
        self.pending_seek = Some([st0, drive.cylinder]);
        self.pending_interrupt = true;
        self.phase = ControllerPhase::Command;
        Continuation::CommandComplete
    }

    fn command_seek(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.operand(0)]);
        let target = self.operand(1);
        let drive_n = dhs.drive() as usize;
        self.stats.seeks += 1;

        let drive = &mut self.drives[drive_n];
        let hd = (dhs.head() << 2) | dhs.drive();
        let (st0, pcn) = if self.faults.seek_failures > 0 {
            self.faults.seek_failures -= 1;
            (ST0_ABNORMAL_TERMINATION | ST0_SEEK_END | ST0_UNIT_CHECK | hd, drive.cylinder)
        }
        else {
            let physical = target.min(drive.max_cylinders - 1);
            if physical != drive.cylinder && drive.disk.is_some() {
                drive.disk_changed = false;
            }
            drive.cylinder = physical;
            (ST0_SEEK_END | hd, target)
        };
        self.pending_seek = Some([st0, pcn]);
        self.pending_interrupt = true;
        self.phase = ControllerPhase::Command;
        Continuation::CommandComplete
    }

    fn command_sense_interrupt(&mut self) -> Continuation {
        if let Some(result) = self.pending_seek.take() {
            self.send_results(&result, false);
        }
        else if self.reset_pending > 0 {
            let drive_n = SIM_DRIVE_COUNT - self.reset_pending as usize;
            self.reset_pending -= 1;
            let pcn = self.drives[drive_n].cylinder;
            self.send_results(&[ST0_INTERRUPT_CODE | drive_n as u8, pcn], false);
        }
        else {
            self.send_results(&[ST0_INVALID_OPCODE], false);
        }
        Continuation::CommandComplete
    }

    fn command_read_data(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.operand(0)]);
        let (drive_n, head) = (dhs.drive() as usize, dhs.head());
        let id = SectorAddress::new(self.operand(1), self.operand(2), self.operand(3), self.operand(4));
        let eot = self.operand(5);
        let want_deleted = self.command == Command::ReadDeletedData;
        self.stats.data_commands += 1;

        if !self.drives[drive_n].ready() {
            return self.stall();
        }
        if self.take_injected_fault() {
            self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_CRC_ERROR, ST2_DATA_CRC_ERROR], drive_n, head, id);
            return Continuation::CommandComplete;
        }

        let (rate, fm) = (self.rate, !self.command_mfm);
        let track = match self.drives[drive_n].track(head).filter(|t| t.readable(rate, fm)) {
            Some(track) => track,
            None => {
                self.clock.advance(REVOLUTION_MS * 2);
                self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_NO_ADDRESS_MARK, 0], drive_n, head, id);
                return Continuation::CommandComplete;
            }
        };

        let mut out = Vec::new();
        let mut current = id;
        let status = loop {
            let sector = match track.find(&current) {
                Some(i) => &track.sectors[i],
                None => {
                    let st2 = match track.sector(current.s()) {
                        Some(other) if other.id.c() != current.c() => ST2_WRONG_CYLINDER,
                        _ => 0,
                    };
                    break [ST0_ABNORMAL_TERMINATION, ST1_NO_DATA, st2];
                }
            };
            out.extend_from_slice(&sector.data);
            if sector.crc_error {
                break [ST0_ABNORMAL_TERMINATION, ST1_CRC_ERROR, ST2_DATA_CRC_ERROR];
            }
            if sector.deleted != want_deleted {
                break [0, 0, ST2_CONTROL_MARK];
            }
            if current.s() >= eot {
                break [ST0_ABNORMAL_TERMINATION, ST1_END_OF_CYLINDER, 0];
            }
            current.s += 1;
        };

        if out.is_empty() {
            self.send_data_results(status, drive_n, head, current);
        }
        else {
            self.data_register_out = out.into();
            self.result_bytes.clear();
            self.phase = ControllerPhase::Execution(Transfer::ToHost);
            let st0 = status[0] | (head << 2) | drive_n as u8;
            self.result_bytes = [st0, status[1], status[2], current.c(), current.h(), current.s(), current.n()]
                .into_iter()
                .collect();
        }
        Continuation::ContinueAsOperation
    }

    fn command_write_data(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.operand(0)]);
        let (drive_n, head) = (dhs.drive() as usize, dhs.head());
        let id = SectorAddress::new(self.operand(1), self.operand(2), self.operand(3), self.operand(4));
        let eot = self.operand(5);
        let deleted = self.command == Command::WriteDeletedData;
        self.stats.data_commands += 1;

        if !self.drives[drive_n].ready() {
            return self.stall();
        }
        if self.drives[drive_n].disk.as_ref().is_some_and(|d| d.write_protected) {
            self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_WRITE_PROTECT, 0], drive_n, head, id);
            return Continuation::CommandComplete;
        }
        if self.take_injected_fault() {
            self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_CRC_ERROR, ST2_DATA_CRC_ERROR], drive_n, head, id);
            return Continuation::CommandComplete;
        }
        if let Some(status) = self.locate_for_write(drive_n, head, &id) {
            self.send_data_results(status, drive_n, head, id);
            return Continuation::CommandComplete;
        }

        self.operation = Operation::WriteData {
            drive: drive_n,
            head,
            id,
            eot,
            deleted,
            collected: Vec::with_capacity(id.size()),
        };
        self.phase = ControllerPhase::Execution(Transfer::FromHost);
        Continuation::ContinueAsOperation
    }

    /// Status to fail with if `id` can't be written on the current track.
    fn locate_for_write(&mut self, drive_n: usize, head: u8, id: &SectorAddress) -> Option<[u8; 3]> {
        let (rate, fm) = (self.rate, !self.command_mfm);
        match self.drives[drive_n].track(head).filter(|t| t.readable(rate, fm)) {
            None => {
                self.clock.advance(REVOLUTION_MS * 2);
                Some([ST0_ABNORMAL_TERMINATION, ST1_NO_ADDRESS_MARK, 0])
            }
            Some(track) if track.find(id).is_none() => Some([ST0_ABNORMAL_TERMINATION, ST1_NO_DATA, 0]),
            Some(_) => None,
        }
    }

    fn command_read_id(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.operand(0)]);
        let (drive_n, head) = (dhs.drive() as usize, dhs.head());
        self.stats.read_ids += 1;

        if !self.drives[drive_n].ready() {
            return self.stall();
        }

        let (rate, fm) = (self.rate, !self.command_mfm);
        let next_id = self.drives[drive_n]
            .track(head)
            .filter(|t| t.readable(rate, fm))
            .map(|t| {
                // Next ID field to pass under the head, by rotational position.
                let count = t.sectors.len() as u64;
                let now = self.clock.now_ms();
                let slot = now * count / REVOLUTION_MS + 1;
                let at = (slot * REVOLUTION_MS).div_ceil(count);
                (t.sectors[(slot % count) as usize].id, at - now)
            });

        match next_id {
            Some((id, wait)) => {
                self.clock.advance(wait);
                self.send_data_results([0, 0, 0], drive_n, head, id);
            }
            None => {
                self.clock.advance(REVOLUTION_MS * 2);
                self.send_data_results(
                    [ST0_ABNORMAL_TERMINATION, ST1_NO_ADDRESS_MARK, 0],
                    drive_n,
                    head,
                    SectorAddress::default(),
                );
            }
        }
        Continuation::CommandComplete
    }

    fn command_format_track(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.operand(0)]);
        let (drive_n, head) = (dhs.drive() as usize, dhs.head());
        let size_code = self.operand(1);
        let spt = self.operand(2);
        let filler = self.operand(4);
        self.stats.data_commands += 1;
        self.stats.formats += 1;

        if !self.drives[drive_n].ready() {
            return self.stall();
        }
        let id = SectorAddress::new(self.drives[drive_n].cylinder, head, 1, size_code);
        if self.drives[drive_n].disk.as_ref().is_some_and(|d| d.write_protected) {
            self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_WRITE_PROTECT, 0], drive_n, head, id);
            return Continuation::CommandComplete;
        }
        if self.take_injected_fault() {
            self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_CRC_ERROR, ST2_DATA_CRC_ERROR], drive_n, head, id);
            return Continuation::CommandComplete;
        }
        if spt == 0 {
            self.send_data_results([ST0_ABNORMAL_TERMINATION, ST1_NO_DATA, 0], drive_n, head, id);
            return Continuation::CommandComplete;
        }

        self.operation = Operation::FormatTrack {
            drive: drive_n,
            head,
            size_code,
            spt,
            filler,
            table: Vec::with_capacity(spt as usize * 4),
        };
        self.phase = ControllerPhase::Execution(Transfer::FromHost);
        Continuation::ContinueAsOperation
    }

    /// Execution phase byte from the host for a write or format.
    fn operation_byte_in(&mut self, data: u8) {
        let (rate, fm) = (self.rate, !self.command_mfm);
        let mut finished: Option<([u8; 3], usize, u8, SectorAddress)> = None;

        match &mut self.operation {
            Operation::WriteData {
                drive,
                head,
                id,
                eot,
                deleted,
                collected,
            } => {
                collected.push(data);
                if collected.len() < id.size() {
                    return;
                }
                let d = &mut self.drives[*drive];
                let cylinder = d.cylinder;
                match d.disk.as_mut().and_then(|disk| disk.track_mut(cylinder, *head)) {
                    None => {
                        finished = Some(([ST0_ABNORMAL_TERMINATION, ST1_NO_ADDRESS_MARK, 0], *drive, *head, *id));
                    }
                    Some(track) => {
                        if let Some(i) = track.find(id) {
                            let sector = &mut track.sectors[i];
                            sector.data = std::mem::take(collected);
                            sector.deleted = *deleted;
                            sector.crc_error = false;
                        }

                        if id.s() >= *eot {
                            finished = Some(([ST0_ABNORMAL_TERMINATION, ST1_END_OF_CYLINDER, 0], *drive, *head, *id));
                        }
                        else {
                            id.s += 1;
                            collected.clear();
                            if track.find(id).is_none() {
                                finished = Some(([ST0_ABNORMAL_TERMINATION, ST1_NO_DATA, 0], *drive, *head, *id));
                            }
                        }
                    }
                }
            }
            Operation::FormatTrack {
                drive,
                head,
                size_code,
                spt,
                filler,
                table,
            } => {
                table.push(data);
                if table.len() < *spt as usize * 4 {
                    return;
                }
                let size = sector_size_bytes(*size_code);
                let sectors = table
                    .chunks_exact(4)
                    .map(|chrn| SimSector {
                        id: SectorAddress::new(chrn[0], chrn[1], chrn[2], chrn[3]),
                        data: vec![*filler; size],
                        deleted: false,
                        crc_error: false,
                    })
                    .collect();

                let d = &mut self.drives[*drive];
                let cylinder = d.cylinder;
                let last = SectorAddress::new(cylinder, *head, *spt, *size_code);
                match d.disk.as_mut().and_then(|disk| disk.track_mut(cylinder, *head)) {
                    Some(track) => {
                        *track = SimTrack { rate, fm, sectors };
                        finished = Some(([0, 0, 0], *drive, *head, last));
                    }
                    None => {
                        finished = Some(([ST0_ABNORMAL_TERMINATION, ST1_NO_ADDRESS_MARK, 0], *drive, *head, last));
                    }
                }
            }
            Operation::NoOperation => {
                log::warn!("sim: execution byte {:02X} with no operation", data);
            }
        }

        self.finish_operation(finished);
    }

    fn finish_operation(&mut self, finished: Option<([u8; 3], usize, u8, SectorAddress)>) {
        if let Some((status, drive, head, id)) = finished {
            self.operation = Operation::NoOperation;
            self.send_data_results(status, drive, head, id);
        }
    }
}

impl RegisterPort for SimulatedController {
    fn read(&mut self, register: Register) -> u8 {
        let value = match register {
            Register::Msr => self.handle_status_register_read(),
            Register::Dtr => self.handle_data_register_read(),
            Register::Drr => {
                if self.drives[self.selected_drive()].disk_changed {
                    DRR_DISK_CHANGE
                }
                else {
                    0
                }
            }
            Register::Dcr => 0xFF,
        };
        #[cfg(feature = "port_trace")]
        log::trace!("sim: read {} -> {:02X}", register, value);
        value
    }

    fn write(&mut self, register: Register, value: u8) {
        #[cfg(feature = "port_trace")]
        log::trace!("sim: write {} <- {:02X}", register, value);
        match register {
            Register::Dcr => self.handle_dcr_write(value),
            Register::Dtr => {
                if !self.in_reset {
                    self.handle_data_register_write(value)
                }
            }
            Register::Drr => self.rate = DataRate::from_drr_bits(value),
            Register::Msr => {}
        }
    }

    fn interrupt(&mut self) -> bool {
        self.pending_interrupt
            || matches!(
                self.phase,
                ControllerPhase::Execution(Transfer::ToHost) | ControllerPhase::Execution(Transfer::FromHost)
            )
    }

    fn set_reduced_write_current(&mut self, asserted: bool) {
        self.reduced_write_current = asserted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn released() -> SimulatedController {
        let mut sim = SimulatedController::new(VirtualClock::new());
        sim.write(Register::Dcr, 0);
        sim.write(Register::Dcr, DCR_NOT_RESET | DCR_DMA_INT);
        sim
    }

    fn result(sim: &mut SimulatedController) -> Vec<u8> {
        let mut bytes = Vec::new();
        while sim.read(Register::Msr) & (MSR_RQM | MSR_DIO) == (MSR_RQM | MSR_DIO) {
            bytes.push(sim.read(Register::Dtr));
        }
        bytes
    }

    #[test]
    fn test_reset_leaves_four_interrupts() {
        let mut sim = released();
        assert!(sim.interrupt());
        for drive in 0..4u8 {
            sim.write(Register::Dtr, COMMAND_SENSE_INT_STATUS);
            assert_eq!(result(&mut sim), vec![0xC0 | drive, 0]);
        }
        assert!(!sim.interrupt());
        sim.write(Register::Dtr, COMMAND_SENSE_INT_STATUS);
        assert_eq!(result(&mut sim), vec![0x80]);
        assert_eq!(sim.stats().resets, 1);
    }

    #[test]
    fn test_unsupported_configure() {
        let mut sim = released();
        sim.set_features(false, false);
        sim.write(Register::Dtr, COMMAND_CONFIGURE);
        assert_eq!(result(&mut sim), vec![0x80]);
        assert_eq!(sim.read(Register::Msr), MSR_RQM);
    }

    #[test]
    fn test_seek_then_sense() {
        let mut sim = released();
        sim.write(Register::Dtr, COMMAND_SEEK);
        sim.write(Register::Dtr, 0x04);
        sim.write(Register::Dtr, 12);
        assert!(sim.interrupt());
        sim.write(Register::Dtr, COMMAND_SENSE_INT_STATUS);
        assert_eq!(result(&mut sim), vec![0x24, 12]);
        assert_eq!(sim.drive_cylinder(0), 12);
    }

    #[test]
    fn test_read_without_disk_stalls() {
        let mut sim = released();
        sim.write(Register::Dcr, DCR_NOT_RESET | DCR_DMA_INT | 0x10);
        sim.write(Register::Dtr, COMMAND_READ_DATA);
        for b in [0, 0, 0, 1, 2, 1, 0x1B, 0xFF] {
            sim.write(Register::Dtr, b);
        }
        assert_eq!(sim.read(Register::Msr), MSR_NON_DMA | MSR_BUSY);
        assert!(!sim.interrupt());
    }

    #[test]
    fn test_disk_change_cleared_by_step() {
        let mut sim = released();
        let layout = TrackLayout::from_params(&DriveMediaParams::pc_1440k(0));
        sim.insert_disk(0, SimDisk::formatted(80, 2, &layout));
        assert_eq!(sim.read(Register::Drr), DRR_DISK_CHANGE);
        sim.write(Register::Dtr, COMMAND_SEEK);
        sim.write(Register::Dtr, 0x00);
        sim.write(Register::Dtr, 1);
        assert_eq!(sim.read(Register::Drr), 0);
    }

    #[test]
    fn test_double_stepped_ids() {
        let layout = TrackLayout::from_params(&DriveMediaParams::pc_360k(0));
        let disk = SimDisk::formatted_double_stepped(40, 2, &layout);
        assert_eq!(disk.cylinders(), 80);
        assert_eq!(disk.track(2, 0).map(|t| t.sectors[0].id.c()), Some(1));
        assert_eq!(disk.track(3, 1).map(|t| t.sectors[0].id.c()), Some(1));
    }
}
