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

    fdc_core::lib.rs

    MegaFDC core library.
    
    Contains the polled controller driver, the geometry detector, the IMD
    image stream codec and the imaging operations built on top of them.
    Nothing in this crate touches real hardware directly; register access
    goes through the RegisterPort trait and time through the Clock trait.
*/

#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::too_many_arguments)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod device_types;
pub mod devices;
pub mod geometry;
pub mod imager;
pub mod imagestream;
pub mod transport;

pub use crate::{
    clock::{Clock, SystemClock, VirtualClock},
    device_types::{
        chs::SectorAddress,
        media::{DataRate, DriveMediaParams, DriveSize},
    },
    devices::fdc::{
        driver::ControllerDriver,
        error::{FdcError, IoFault},
        registers::{Register, RegisterPort},
    },
    geometry::detector::GeometryDetector,
    imager::{Imager, ImagingOptions},
};
