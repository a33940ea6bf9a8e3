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

    devices::fdc::data_phase.rs

    Execution phase byte pump.
    
    On the original board an interrupt handler moved data bytes between the
    controller and the sector buffer. Here the driver polls DataPhase::service
    instead, which does exactly one handler pass per call.
*/

use crate::devices::fdc::registers::*;

pub const SECTOR_BUFFER_SIZE: usize = 3072;

// (MSR & mask) == value conditions checked on each pass
const TRANSFER_MASK: u8 = MSR_RQM | MSR_NON_DMA;
const RESULT_MASK: u8 = MSR_RQM | MSR_DIO | MSR_NON_DMA;
const RESULT_VALUE: u8 = MSR_RQM | MSR_DIO;

/// What the current command does with execution phase bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PhaseMode {
    /// No data bytes; completes on the interrupt line alone (seek, recalibrate, reset).
    #[default]
    Acknowledge,
    /// Bytes from the controller go into the buffer.
    Read,
    /// Bytes from the controller are counted and dropped.
    Verify,
    /// Bytes from the buffer go to the controller.
    Write,
}

pub struct DataPhase {
    mode: PhaseMode,
    buffer: Vec<u8>,
    pos: usize,
    completed: bool,
    overflowed: bool,
}

impl Default for DataPhase {
    fn default() -> Self {
        Self {
            mode: PhaseMode::Acknowledge,
            buffer: vec![0; SECTOR_BUFFER_SIZE],
            pos: 0,
            completed: false,
            overflowed: false,
        }
    }
}

impl DataPhase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a new command. `start` is the buffer offset of the first byte.
    pub fn arm(&mut self, mode: PhaseMode, start: usize) {
        self.mode = mode;
        self.pos = start;
        self.completed = false;
        self.overflowed = false;
    }

    pub fn mode(&self) -> PhaseMode {
        self.mode
    }

    /// Buffer position after the last byte moved.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    /// True if the controller offered more bytes than the buffer holds.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// One handler pass. Returns true if a byte was moved or the phase completed.
    pub fn service<P: RegisterPort>(&mut self, port: &mut P) -> bool {
        if self.completed || !port.interrupt() {
            return false;
        }

        if let PhaseMode::Acknowledge = self.mode {
            self.completed = true;
            return true;
        }

        let msr = port.read(Register::Msr);
        if msr & TRANSFER_MASK == TRANSFER_MASK {
            match self.mode {
                PhaseMode::Read => {
                    let byte = port.read(Register::Dtr);
                    match self.buffer.get_mut(self.pos) {
                        Some(slot) => *slot = byte,
                        None => self.overflowed = true,
                    }
                }
                PhaseMode::Verify => {
                    let _ = port.read(Register::Dtr);
                }
                PhaseMode::Write => {
                    let byte = match self.buffer.get(self.pos) {
                        Some(byte) => *byte,
                        None => {
                            self.overflowed = true;
                            0
                        }
                    };
                    port.write(Register::Dtr, byte);
                }
                PhaseMode::Acknowledge => {}
            }
            self.pos += 1;
            true
        }
        else if msr & RESULT_MASK == RESULT_VALUE {
            self.completed = true;
            true
        }
        else {
            false
        }
    }
}
