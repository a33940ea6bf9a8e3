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

    megafdc_headless::session.rs

    Builds the simulated controller and the imager from the configuration.
*/

use anyhow::Context;

use fdc_config::ConfigFileParams;
use fdc_core::{
    devices::fdc::sim::{SimDisk, SimulatedController, TrackLayout, SIM_DRIVE_COUNT},
    ControllerDriver,
    Imager,
    VirtualClock,
};

pub type SimImager = Imager<SimulatedController, VirtualClock>;

/// The disk described by the `[simulator]` section.
pub fn build_disk(config: &ConfigFileParams) -> SimDisk {
    let params = config.simulator_params();
    let layout = TrackLayout::from_params(&params).with_skew(config.simulator.interleave);

    let disk = if params.double_stepping {
        SimDisk::formatted_double_stepped(params.logical_cylinders(), params.heads, &layout)
    }
    else {
        SimDisk::formatted(params.cylinders, params.heads, &layout)
    };
    let disk = if config.simulator.pattern { disk.with_pattern() } else { disk };
    disk.with_write_protect(config.simulator.write_protect)
}

pub fn build_controller(config: &ConfigFileParams, clock: VirtualClock) -> SimulatedController {
    let mut controller = SimulatedController::new(clock);
    controller.set_features(config.simulator.fifo, config.simulator.perpendicular);
    controller.set_faults(config.simulator.faults.clone());
    if config.simulator.no_disk {
        log::info!("Simulated drive is empty");
    }
    else {
        controller.insert_disk(config.drive.drive_number as usize, build_disk(config));
    }
    controller
}

/// Create the imager and bring the configured drive up.
pub fn build_imager(config: &ConfigFileParams) -> anyhow::Result<SimImager> {
    let drive = config.drive.drive_number as usize;
    anyhow::ensure!(drive < SIM_DRIVE_COUNT, "Drive {} doesn't exist", drive);

    let clock = VirtualClock::new();
    let controller = build_controller(config, clock.clone());
    let mut driver = ControllerDriver::new(controller, clock);

    let params = config.drive_params();
    log::info!(
        "Drive {}: {} drive, {} cylinders, {} heads, {} x {} at {} {}",
        params.drive_letter(),
        params.drive_size,
        params.cylinders,
        params.heads,
        params.sectors_per_track,
        params.sector_size,
        params.data_rate,
        if params.fm { "FM" } else { "MFM" }
    );
    driver
        .set_active_drive(params)
        .context("Failed to initialize the drive")?;

    Ok(Imager::new(driver, config.imaging_options()))
}
