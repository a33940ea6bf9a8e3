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

    devices::fdc::error.rs

    Error taxonomy for controller, media and image stream failures.
*/

use thiserror::Error;

use crate::devices::fdc::registers::*;

/// Classified media failure decoded from the ST0..ST2 result bytes of a data command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum IoFault {
    #[error("CRC error")]
    Crc,
    #[error("No address mark")]
    NoAddressMark,
    #[error("Data overrun")]
    Overrun,
    #[error("Sector not found")]
    SectorNotFound,
    #[error("Bad track")]
    BadTrack,
    #[error("Disk is write protected")]
    WriteProtected,
    #[error("ST0,1,2 {0:02x},{1:02x},{2:02x}")]
    Unclassified(u8, u8, u8),
}

impl IoFault {
    /// Classify a failed result. Earlier checks take priority when several bits are set.
    pub fn classify(st0: u8, st1: u8, st2: u8) -> Self {
        if (st1 & ST1_CRC_ERROR != 0) || (st2 & ST2_DATA_CRC_ERROR != 0) {
            IoFault::Crc
        }
        else if (st1 & ST1_NO_ADDRESS_MARK != 0) || (st2 & ST2_NO_DAM != 0) {
            IoFault::NoAddressMark
        }
        else if st1 & ST1_OVERRUN != 0 {
            IoFault::Overrun
        }
        else if (st1 & ST1_NO_DATA != 0) || (st2 & ST2_CONTROL_MARK != 0) {
            IoFault::SectorNotFound
        }
        else if st2 & (ST2_WRONG_CYLINDER | ST2_BAD_CYLINDER) != 0 {
            IoFault::BadTrack
        }
        else if st1 & ST1_WRITE_PROTECT != 0 {
            IoFault::WriteProtected
        }
        else {
            IoFault::Unclassified(st0, st1, st2)
        }
    }
}

#[derive(Debug, Error)]
pub enum FdcError {
    /// The controller never raised RQM or INT within the I/O timeout.
    #[error("Controller not responding")]
    HardwareTimeout,
    #[error("Drive {drive}: not responding")]
    RecalibrationFailure { drive: char },
    #[error("Drive {drive}: not seeking properly")]
    SeekFailure { drive: char },
    #[error("{0}")]
    Media(IoFault),
    #[error("Disk is write protected")]
    WriteProtected,
    #[error("No disk in drive")]
    NoMediumPresent,
    #[error("{0}")]
    Protocol(String),
    #[error("Not enough memory")]
    ResourceExhaustion,
    #[error("Parameter blob error: {0}")]
    Blob(#[from] binrw::Error),
}

impl FdcError {
    /// Fatal errors leave the controller or drive in an unknown state. Nothing above the driver
    /// should try to continue after one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FdcError::HardwareTimeout | FdcError::RecalibrationFailure { .. } | FdcError::SeekFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_priority() {
        // CRC wins over everything else
        assert_eq!(IoFault::classify(0x40, 0x25, 0x12), IoFault::Crc);
        assert_eq!(IoFault::classify(0x40, 0x01, 0x00), IoFault::NoAddressMark);
        assert_eq!(IoFault::classify(0x40, 0x00, 0x01), IoFault::NoAddressMark);
        assert_eq!(IoFault::classify(0x40, 0x14, 0x00), IoFault::Overrun);
        assert_eq!(IoFault::classify(0x40, 0x04, 0x10), IoFault::SectorNotFound);
        assert_eq!(IoFault::classify(0x40, 0x00, 0x40), IoFault::SectorNotFound);
        assert_eq!(IoFault::classify(0x40, 0x00, 0x02), IoFault::BadTrack);
        assert_eq!(IoFault::classify(0x40, 0x02, 0x00), IoFault::WriteProtected);
        assert_eq!(IoFault::classify(0x40, 0x00, 0x00), IoFault::Unclassified(0x40, 0, 0));
    }

    #[test]
    fn test_messages() {
        assert_eq!(IoFault::Unclassified(0x40, 0x00, 0x08).to_string(), "ST0,1,2 40,00,08");
        assert_eq!(
            FdcError::SeekFailure { drive: 'B' }.to_string(),
            "Drive B: not seeking properly"
        );
        assert!(FdcError::HardwareTimeout.is_fatal());
        assert!(!FdcError::NoMediumPresent.is_fatal());
    }
}
