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

    devices::fdc::registers.rs

    Register map, status bit definitions, command opcodes and the RegisterPort
    trait through which all controller access goes.
*/

use modular_bitfield::{bitfield, prelude::*};
use strum_macros::Display;

/// Controller registers used by the driver, by offset from the controller base address.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum Register {
    /// Digital control (output) register. Write only.
    Dcr = 2,
    /// Main status register. Read only.
    Msr = 4,
    /// Data (FIFO) register.
    Dtr = 5,
    /// Write: data rate select. Read: disk change line in bit 7.
    Drr = 7,
}

/// Register level access to a floppy controller, plus the interrupt line.
///
/// Implementations must not block. The driver does all waiting itself against its own clock.
pub trait RegisterPort {
    fn read(&mut self, register: Register) -> u8;
    fn write(&mut self, register: Register, value: u8);
    /// Level of the controller's INT output.
    fn interrupt(&mut self) -> bool;
    /// Drive the reduced write current line used by 8" drives on inner cylinders.
    /// Boards without the line ignore this.
    fn set_reduced_write_current(&mut self, _asserted: bool) {}
}

// Main Status Register Bit Definitions
// --------------------------------------------------------------------------------
pub const MSR_BUSY: u8 = 0b0001_0000;
pub const MSR_NON_DMA: u8 = 0b0010_0000;
// DIO => 0 = controller receiving, 1 = controller sending
pub const MSR_DIO: u8 = 0b0100_0000;
pub const MSR_RQM: u8 = 0b1000_0000;

// Digital Control Register
pub const DCR_NOT_RESET: u8 = 0b0000_0100;
pub const DCR_DMA_INT: u8 = 0b0000_1000;
pub const DCR_MOTOR_SHIFT: u8 = 4;
pub const DCR_DRIVE_MASK: u8 = 0b0000_0011;

pub const DRR_DISK_CHANGE: u8 = 0b1000_0000;

pub const COMMAND_MASK: u8 = 0b0001_1111;
pub const COMMAND_MFM_BIT: u8 = 0b0100_0000;

pub const COMMAND_SPECIFY: u8 = 0x03;
pub const COMMAND_SENSE_DRIVE_STATUS: u8 = 0x04;
pub const COMMAND_RECALIBRATE: u8 = 0x07;
pub const COMMAND_SENSE_INT_STATUS: u8 = 0x08;
pub const COMMAND_SEEK: u8 = 0x0F;
pub const COMMAND_PERPENDICULAR_MODE: u8 = 0x12;
pub const COMMAND_CONFIGURE: u8 = 0x13;

// Data commands as sent, MFM bit included. FM mode clears COMMAND_MFM_BIT.
pub const COMMAND_WRITE_DATA: u8 = 0x45;
pub const COMMAND_READ_DATA: u8 = 0x46;
pub const COMMAND_WRITE_DELETED_DATA: u8 = 0x49;
pub const COMMAND_READ_ID: u8 = 0x4A;
pub const COMMAND_READ_DELETED_DATA: u8 = 0x4C;
pub const COMMAND_FORMAT_TRACK: u8 = 0x4D;

/// Configure operand: implied seeks off, FIFO enabled, drive polling disabled, threshold 8.
pub const CONFIGURE_FLAGS: u8 = 0x17;
pub const PERPENDICULAR_ENABLE: u8 = 0x03;

pub const ST0_DRIVE_MASK: u8 = 0b0000_0011;
pub const ST0_HEAD_ACTIVE: u8 = 0b0000_0100;
pub const ST0_NOT_READY: u8 = 0b0000_1000;
pub const ST0_UNIT_CHECK: u8 = 0b0001_0000;
pub const ST0_SEEK_END: u8 = 0b0010_0000;
pub const ST0_ABNORMAL_TERMINATION: u8 = 0b0100_0000;
pub const ST0_INVALID_OPCODE: u8 = 0b1000_0000;
pub const ST0_INTERRUPT_CODE: u8 = 0b1100_0000;

pub const ST1_NO_ADDRESS_MARK: u8 = 0b0000_0001;
pub const ST1_WRITE_PROTECT: u8 = 0b0000_0010;
pub const ST1_NO_DATA: u8 = 0b0000_0100;
pub const ST1_OVERRUN: u8 = 0b0001_0000;
pub const ST1_CRC_ERROR: u8 = 0b0010_0000;
pub const ST1_END_OF_CYLINDER: u8 = 0b1000_0000;

pub const ST2_NO_DAM: u8 = 0b0000_0001;
pub const ST2_BAD_CYLINDER: u8 = 0b0000_0010;
pub const ST2_WRONG_CYLINDER: u8 = 0b0001_0000;
pub const ST2_DATA_CRC_ERROR: u8 = 0b0010_0000;
pub const ST2_CONTROL_MARK: u8 = 0b0100_0000;

pub const ST3_HEAD: u8 = 0b0000_0100;
pub const ST3_TWO_SIDE: u8 = 0b0000_1000;
pub const ST3_TRACK0: u8 = 0b0001_0000;
pub const ST3_READY: u8 = 0b0010_0000;
pub const ST3_WRITE_PROTECT: u8 = 0b0100_0000;

#[bitfield]
#[derive(Copy, Clone)]
pub struct CommandByte {
    pub command: B5,
    pub skip: bool,
    pub mfm: bool,
    pub mt: bool,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct DriveHeadSelect {
    pub drive: B2,
    pub head:  B1,
    #[skip]
    unused:    B5,
}

impl DriveHeadSelect {
    /// Encode the `(head << 2) | drive` operand byte.
    pub fn encode(drive: u8, head: u8) -> u8 {
        DriveHeadSelect::new()
            .with_drive(drive & 0x03)
            .with_head(head & 0x01)
            .into_bytes()[0]
    }
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct StepRateHeadUnload {
    pub head_unload: B4,
    pub step_rate:   B4,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct HeadLoadDma {
    pub non_dma:   bool,
    pub head_load: B7,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_head_select() {
        assert_eq!(DriveHeadSelect::encode(0, 0), 0x00);
        assert_eq!(DriveHeadSelect::encode(1, 1), 0x05);
        assert_eq!(DriveHeadSelect::encode(3, 1), 0x07);

        let dhs = DriveHeadSelect::from_bytes([0x06]);
        assert_eq!(dhs.drive(), 2);
        assert_eq!(dhs.head(), 1);
    }

    #[test]
    fn test_command_byte() {
        let cmd = CommandByte::from_bytes([COMMAND_READ_DATA]);
        assert_eq!(cmd.command(), 0x06);
        assert!(cmd.mfm());
        assert!(!cmd.mt());

        let fm = CommandByte::from_bytes([COMMAND_READ_DATA & !COMMAND_MFM_BIT]);
        assert!(!fm.mfm());
    }

    #[test]
    fn test_specify_bytes() {
        // 5.25" at 300kbps: 0xCA 0x27
        let srt_hut = StepRateHeadUnload::from_bytes([0xCA]);
        assert_eq!(srt_hut.step_rate(), 0x0C);
        assert_eq!(srt_hut.head_unload(), 0x0A);
        let hlt_nd = HeadLoadDma::from_bytes([0x27]);
        assert!(hlt_nd.non_dma());
        assert_eq!(hlt_nd.head_load(), 0x13);
    }
}
