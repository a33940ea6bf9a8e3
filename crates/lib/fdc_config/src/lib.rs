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

    fdc_config::lib.rs

    Configuration for the MegaFDC frontends.
*/

//! The `fdc_config` crate reads MegaFDC's configuration file, `megafdc.toml`, and overlays the
//! command line arguments on top of it. Command line arguments always take priority over the
//! configuration file.
//!
//! The file has three sections:
//! - `[drive]` selects the drive and its media parameters, either from a preset or spelled out
//!   in full under `[drive.media]`, plus the autodetection switches.
//! - `[imaging]` holds the transfer options.
//! - `[simulator]` describes the disk loaded into the simulated controller.

mod bpaf_config;

use std::path::{Path, PathBuf};

pub use bpaf_config::{cli_args, CmdLineArgs};

use anyhow::Context;
use fdc_core::{
    devices::fdc::sim::FaultInjection,
    imager::ImagingOptions,
    transport::BlockSize,
    DriveMediaParams,
};
use serde_derive::Deserialize;
use strum_macros::{Display, EnumString};

pub const DEFAULT_CONFIG_FILE: &str = "./megafdc.toml";
pub const DEFAULT_HEADER_COMMENT: &str = "MegaFDC";
const DEFAULT_LOG_LEVEL: &str = "info";

const fn _default_true() -> bool {
    true
}
const fn _default_interleave() -> u8 {
    1
}
fn _default_comment() -> String {
    DEFAULT_HEADER_COMMENT.to_string()
}

/// What the frontend should do once configured.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Command {
    /// Read the disk into an image file.
    Read,
    /// Write an image file to the disk.
    Write,
    Format,
    Erase,
    TestController,
    TestDrive,
    /// Detect the geometry of cylinder 0 and print it.
    Report,
    /// Parse an image file and print a summary, without touching the drive.
    Inspect,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumString, Deserialize)]
pub enum MediaPreset {
    #[default]
    #[serde(rename = "1440k")]
    #[strum(serialize = "1440k", serialize = "1.44m")]
    Pc1440k,
    #[serde(rename = "360k")]
    #[strum(serialize = "360k")]
    Pc360k,
    #[serde(rename = "3740")]
    #[strum(serialize = "3740", serialize = "8in")]
    Ibm3740,
}

impl MediaPreset {
    pub fn params(&self, drive_number: u8) -> DriveMediaParams {
        match self {
            MediaPreset::Pc1440k => DriveMediaParams::pc_1440k(drive_number),
            MediaPreset::Pc360k => DriveMediaParams::pc_360k(drive_number),
            MediaPreset::Ibm3740 => DriveMediaParams::ibm_3740(drive_number),
        }
    }
}

/// Parse a drive given either as a letter or a number.
pub fn parse_drive(s: &str) -> Result<u8, String> {
    let s = s.trim().trim_end_matches(':');
    let number = match s.to_ascii_uppercase().as_str() {
        "A" | "0" => 0,
        "B" | "1" => 1,
        "C" | "2" => 2,
        "D" | "3" => 3,
        _ => return Err(format!("Bad drive: '{}'. Expected A-D or 0-3", s)),
    };
    Ok(number)
}

#[derive(Debug, Deserialize)]
pub struct Drive {
    #[serde(default)]
    pub drive_number: u8,
    #[serde(default)]
    pub preset: MediaPreset,
    /// Full parameter set. Takes the place of the preset when present.
    pub media: Option<DriveMediaParams>,
    pub cylinders: Option<u8>,
    #[serde(default = "_default_true")]
    pub auto_double_step: bool,
    #[serde(default = "_default_true")]
    pub auto_heads: bool,
    #[serde(default = "_default_true")]
    pub auto_gaps: bool,
}

#[derive(Debug, Deserialize)]
pub struct Imaging {
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub skip_bad_sectors: bool,
    #[serde(default)]
    pub xlat_300_250: bool,
    #[serde(default = "_default_interleave")]
    pub format_interleave: u8,
    #[serde(default)]
    pub block_1k: bool,
    #[serde(default = "_default_comment")]
    pub header_comment: String,
}

#[derive(Debug, Deserialize)]
pub struct Simulator {
    /// Media in the simulated drive. Defaults to whatever the drive is configured for.
    pub media: Option<MediaPreset>,
    #[serde(default)]
    pub no_disk: bool,
    #[serde(default)]
    pub write_protect: bool,
    /// Fill sectors with a per-sector pattern instead of the format filler.
    #[serde(default = "_default_true")]
    pub pattern: bool,
    #[serde(default = "_default_interleave")]
    pub interleave: u8,
    #[serde(default = "_default_true")]
    pub fifo: bool,
    #[serde(default = "_default_true")]
    pub perpendicular: bool,
    #[serde(default)]
    pub faults: FaultInjection,
}

impl Default for Simulator {
    fn default() -> Self {
        Self {
            media: None,
            no_disk: false,
            write_protect: false,
            pattern: true,
            interleave: 1,
            fifo: true,
            perpendicular: true,
            faults: FaultInjection::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigFileParams {
    pub log_level: Option<String>,
    pub command: Option<Command>,
    pub image: Option<PathBuf>,
    pub drive: Drive,
    pub imaging: Imaging,
    #[serde(default)]
    pub simulator: Simulator,
}

impl ConfigFileParams {
    pub fn overlay(&mut self, shell_args: CmdLineArgs) {
        if let Some(log_level) = shell_args.log_level {
            self.log_level = Some(log_level);
        }
        if let Some(command) = shell_args.command {
            self.command = Some(command);
        }
        if let Some(image) = shell_args.image {
            self.image = Some(image);
        }

        if let Some(drive) = shell_args.drive {
            self.drive.drive_number = drive;
        }
        if let Some(media) = shell_args.media {
            // A preset named on the command line replaces a spelled out parameter set.
            self.drive.preset = media;
            self.drive.media = None;
        }
        if let Some(cylinders) = shell_args.cylinders {
            self.drive.cylinders = Some(cylinders);
        }

        self.imaging.verify |= shell_args.verify;
        self.imaging.skip_bad_sectors |= shell_args.skip_bad;
        self.imaging.xlat_300_250 |= shell_args.xlat_300_250;
        self.imaging.block_1k |= shell_args.block_1k;

        self.simulator.no_disk |= shell_args.no_disk;
        self.simulator.write_protect |= shell_args.write_protect;
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// The media parameters for the configured drive, with any cylinder override applied.
    pub fn drive_params(&self) -> DriveMediaParams {
        let mut params = match &self.drive.media {
            Some(media) => media.clone(),
            None => self.drive.preset.params(self.drive.drive_number),
        };
        params.drive_number = self.drive.drive_number;
        if let Some(cylinders) = self.drive.cylinders {
            params.cylinders = cylinders;
        }
        params
    }

    /// The media parameters of the disk the simulator should load.
    pub fn simulator_params(&self) -> DriveMediaParams {
        match self.simulator.media {
            Some(preset) => preset.params(self.drive.drive_number),
            None => self.drive_params(),
        }
    }

    pub fn imaging_options(&self) -> ImagingOptions {
        ImagingOptions {
            auto_double_step: self.drive.auto_double_step,
            auto_heads: self.drive.auto_heads,
            auto_gaps: self.drive.auto_gaps,
            xlat_300_250: self.imaging.xlat_300_250,
            skip_bad_sectors: self.imaging.skip_bad_sectors,
            verify: self.imaging.verify,
            format_interleave: self.imaging.format_interleave,
        }
    }

    pub fn block_size(&self) -> BlockSize {
        BlockSize::from_1k(self.imaging.block_1k)
    }
}

pub fn read_config(toml_string: impl AsRef<str>, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error> {
    let mut toml_args: ConfigFileParams = toml::from_str(toml_string.as_ref()).context("Invalid configuration file")?;

    // Command line arguments override config file arguments
    toml_args.overlay(shell_args);

    Ok(toml_args)
}

/// Read the TOML configuration from a file path, parse it and overlay the command line
/// arguments. The path can be overridden with `--config_file`.
pub fn read_config_file<P>(default_path: P) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    log::debug!("Reading command line arguments...");
    let shell_args = cli_args().run();

    let path = shell_args
        .config_file
        .clone()
        .unwrap_or_else(|| default_path.as_ref().to_path_buf());

    let toml_string =
        std::fs::read_to_string(&path).with_context(|| format!("Couldn't read {}", path.display()))?;

    read_config(toml_string, shell_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdc_core::DataRate;

    const SAMPLE: &str = include_str!("../../../../megafdc.toml");

    const MINIMAL: &str = r#"
        [drive]
        [imaging]
    "#;

    #[test]
    fn test_sample_config() {
        let config = read_config(SAMPLE, CmdLineArgs::default()).unwrap();
        assert_eq!(config.command, Some(Command::Read));
        assert_eq!(config.drive.preset, MediaPreset::Pc1440k);
        assert!(config.drive.auto_double_step);
        assert_eq!(config.imaging.header_comment, DEFAULT_HEADER_COMMENT);
        assert_eq!(config.block_size(), BlockSize::OneK);
        assert_eq!(config.drive_params(), DriveMediaParams::pc_1440k(0));
    }

    #[test]
    fn test_defaults() {
        let config = read_config(MINIMAL, CmdLineArgs::default()).unwrap();
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.command, None);
        assert_eq!(config.imaging.format_interleave, 1);
        assert_eq!(config.block_size(), BlockSize::Standard);
        assert!(config.simulator.pattern);
        assert!(config.simulator.fifo && config.simulator.perpendicular);

        let options = config.imaging_options();
        assert_eq!(options, ImagingOptions::default());
        assert_eq!(config.simulator_params(), config.drive_params());
    }

    #[test]
    fn test_command_line_wins() {
        let args = CmdLineArgs {
            command: Some(Command::Write),
            image: Some(PathBuf::from("disk.imd")),
            drive: Some(1),
            media: Some(MediaPreset::Pc360k),
            cylinders: Some(42),
            verify: true,
            skip_bad: true,
            block_1k: true,
            no_disk: true,
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = read_config(SAMPLE, args).unwrap();
        assert_eq!(config.command, Some(Command::Write));
        assert_eq!(config.image, Some(PathBuf::from("disk.imd")));
        assert_eq!(config.log_level(), "debug");

        let params = config.drive_params();
        assert_eq!(params.drive_number, 1);
        assert_eq!(params.cylinders, 42);
        assert_eq!(params.sectors_per_track, 9);

        let options = config.imaging_options();
        assert!(options.verify);
        assert!(options.skip_bad_sectors);
        assert!(!options.xlat_300_250);
        assert!(config.simulator.no_disk);
    }

    #[test]
    fn test_explicit_media() {
        let toml = r#"
            command = "format"

            [drive]
            drive_number = 2

            [drive.media]
            drive_size = 8
            cylinders = 77
            heads = 1
            sector_size = 128
            sectors_per_track = 26
            data_rate = 500
            fm = true

            [imaging]
            format_interleave = 6

            [simulator]
            media = "3740"
            write_protect = true

            [simulator.faults]
            fail_next = 2
        "#;
        let config = read_config(toml, CmdLineArgs::default()).unwrap();
        assert_eq!(config.command, Some(Command::Format));

        let params = config.drive_params();
        assert_eq!(params.drive_number, 2);
        assert_eq!(params.cylinders, 77);
        assert_eq!(params.heads, 1);
        assert_eq!(params.sector_size, 128);
        assert_eq!(params.data_rate, DataRate::Rate500);
        assert!(params.fm);

        assert_eq!(config.imaging_options().format_interleave, 6);
        assert!(config.simulator.write_protect);
        assert_eq!(config.simulator.faults.fail_next, 2);
        assert_eq!(config.simulator_params(), DriveMediaParams::ibm_3740(2));
    }

    #[test]
    fn test_bad_config() {
        assert!(read_config("[drive]\n", CmdLineArgs::default()).is_err());
        assert!(read_config("command = \"defrag\"\n[drive]\n[imaging]\n", CmdLineArgs::default()).is_err());

        let toml = "[drive]\n[drive.media]\ndata_rate = 123\n[imaging]\n";
        assert!(read_config(toml, CmdLineArgs::default()).is_err());
    }

    #[test]
    fn test_parse_drive() {
        assert_eq!(parse_drive("A"), Ok(0));
        assert_eq!(parse_drive("b:"), Ok(1));
        assert_eq!(parse_drive("3"), Ok(3));
        assert!(parse_drive("E").is_err());
    }

    #[test]
    fn test_command_names() {
        assert_eq!("test-controller".parse::<Command>(), Ok(Command::TestController));
        assert_eq!("Read".parse::<Command>(), Ok(Command::Read));
        assert_eq!(Command::TestDrive.to_string(), "test-drive");
        assert_eq!("1.44m".parse::<MediaPreset>(), Ok(MediaPreset::Pc1440k));
        assert!("720k".parse::<MediaPreset>().is_err());
    }
}
