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

    megafdc_headless::lib.rs

    MegaFDC headless front-end main library component.
    
    Reads megafdc.toml and the command line, builds a simulated controller with
    the configured disk and runs one imaging command against it. Image files
    are read and written through the same block transport the serial link uses.
*/

#![forbid(unsafe_code)]

mod session;

use std::{fs::File, path::Path};

use anyhow::Context;
use colored::Colorize;
use web_time::Duration;

use fdc_common::util::format_duration;
use fdc_config::{Command, ConfigFileParams, DEFAULT_CONFIG_FILE};
use fdc_core::{
    device_types::media::sector_size_bytes,
    imager::FormatSpec,
    imagestream::{parse_image, ImageTrackRecord, TransferReport},
    transport::StreamTransport,
    Clock,
    FdcError,
};

pub use crate::session::{build_controller, build_disk, build_imager, SimImager};

/// True if the error, or anything it wraps, is a controller failure that needs a restart.
pub fn is_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<FdcError>().is_some_and(|e| e.is_fatal())
}

fn image_path(config: &ConfigFileParams) -> anyhow::Result<&Path> {
    config
        .image
        .as_deref()
        .context("No image file given. Use --image or set 'image' in megafdc.toml")
}

fn print_transfer(report: &TransferReport, blocks: u32, block_size: usize) {
    let status = if report.success { "OK".green() } else { "FAILED".red() };
    println!("[{}] {}", status, report);
    println!("{} blocks of {} bytes transferred", blocks, block_size);
}

/// Parse an image file and print a summary of it.
pub fn inspect_image(path: &Path) -> anyhow::Result<bool> {
    let data = std::fs::read(path).with_context(|| format!("Couldn't read {}", path.display()))?;
    let image = parse_image(&data).with_context(|| format!("{} is not a valid image", path.display()))?;

    println!("{}", image);
    for track in &image.tracks {
        match track {
            ImageTrackRecord::Unreadable { cylinder, head, .. } => {
                log::debug!("CHS {:02}/{}: unreadable", cylinder, head);
            }
            ImageTrackRecord::Readable {
                mode,
                cylinder,
                head,
                sector_numbering_map,
                sector_size_code,
                ..
            } => {
                log::debug!(
                    "CHS {:02}/{}: {} x {} bytes, {}, sectors {:?}",
                    cylinder,
                    head,
                    sector_numbering_map.len(),
                    sector_size_bytes(*sector_size_code),
                    mode,
                    sector_numbering_map
                );
            }
        }
    }
    Ok(image.bad_sector_count() == 0)
}

/// Run one command against the drive. Returns whether it succeeded.
pub fn run_command(imager: &mut SimImager, config: &ConfigFileParams, command: Command) -> anyhow::Result<bool> {
    let block_size = config.block_size();
    match command {
        Command::Read => {
            let path = image_path(config)?;
            let file = File::create(path).with_context(|| format!("Couldn't create {}", path.display()))?;
            let mut transport = StreamTransport::new(file, block_size);
            let report = imager.read_disk(&mut transport, &config.imaging.header_comment)?;
            print_transfer(&report, transport.blocks(), block_size.bytes());
            Ok(report.success)
        }
        Command::Write => {
            let path = image_path(config)?;
            let file = File::open(path).with_context(|| format!("Couldn't open {}", path.display()))?;
            let mut transport = StreamTransport::new(file, block_size);
            let report = imager.write_disk(&mut transport)?;
            print_transfer(&report, transport.blocks(), block_size.bytes());
            Ok(report.success)
        }
        Command::Format => {
            let format = FormatSpec::from_params(imager.driver().params());
            let bad_sectors = imager.format_disk(&format)?;
            if bad_sectors == 0 {
                println!("[{}] Format complete", "OK".green());
            }
            else {
                println!("[{}] {} bad sectors", "FAILED".red(), bad_sectors);
            }
            Ok(bad_sectors == 0)
        }
        Command::Erase => {
            imager.erase_disk()?;
            println!("[{}] Disk erased", "OK".green());
            Ok(true)
        }
        Command::TestController => {
            let report = imager.test_controller()?;
            print!("{}", report);
            Ok(report.passed())
        }
        Command::TestDrive => {
            let report = imager.test_drive()?;
            println!("{}", report);
            Ok(report.media_readable && report.seek_ok)
        }
        Command::Report => {
            let mut readable = false;
            for head in 0..imager.driver().head_count() {
                match imager.detect_geometry(0, head)? {
                    Some(report) => {
                        println!("{}", report);
                        readable = true;
                    }
                    None => println!("CHS 00/{}: unreadable", head),
                }
            }
            Ok(readable)
        }
        Command::Inspect => inspect_image(image_path(config)?),
    }
}

/// Run the configured command. Image inspection doesn't need a drive.
pub fn execute(config: &ConfigFileParams) -> anyhow::Result<bool> {
    let command = config
        .command
        .context("No command given. Use --command or set 'command' in megafdc.toml")?;
    log::info!("Running '{}'", command);

    if command == Command::Inspect {
        return inspect_image(image_path(config)?);
    }

    let mut imager = build_imager(config)?;
    let started = imager.driver().clock().now_ms();
    let result = run_command(&mut imager, config, command);
    let elapsed = Duration::from_millis(imager.driver().clock().now_ms().saturating_sub(started));
    log::info!("'{}' took {} of drive time", command, format_duration(elapsed));
    result
}

pub fn run() {
    let config = match fdc_config::read_config_file(DEFAULT_CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => match e.downcast_ref::<std::io::Error>() {
            Some(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "Configuration file not found! Please create megafdc.toml in the current directory \
                     or provide the path to configuration file with --config_file."
                );
                std::process::exit(1);
            }
            _ => {
                eprintln!("Failed to read configuration file:\n{:#}", e);
                std::process::exit(1);
            }
        },
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level())).init();

    match execute(&config) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) if is_fatal(&e) => {
            log::error!("{:#}", e);
            log::error!("{}", "System halted".red().bold());
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdc_config::{read_config, CmdLineArgs};
    use std::path::PathBuf;

    fn config(toml: &str) -> ConfigFileParams {
        read_config(toml, CmdLineArgs::default()).unwrap()
    }

    fn temp_image(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("megafdc_{}_{}.imd", name, std::process::id()))
    }

    fn small_config(command: &str, image: &Path) -> String {
        format!(
            r#"
            command = "{}"
            image = '{}'

            [drive]
            preset = "360k"
            cylinders = 3

            [imaging]
            header_comment = "headless test"
            "#,
            command,
            image.display()
        )
    }

    #[test]
    fn test_read_then_inspect() {
        let path = temp_image("read");
        assert!(execute(&config(&small_config("read", &path))).unwrap());

        let data = std::fs::read(&path).unwrap();
        let image = parse_image(&data).unwrap();
        assert!(image.header.contains("headless test"));
        assert_eq!(image.tracks.len(), 6);
        assert_eq!(image.sector_count(), 6 * 9);

        assert!(execute(&config(&small_config("inspect", &path))).unwrap());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_image() {
        let path = temp_image("write");
        assert!(execute(&config(&small_config("read", &path))).unwrap());

        let mut write = config(&small_config("write", &path));
        write.imaging.verify = true;
        assert!(execute(&write).unwrap());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_drive_commands() {
        let path = temp_image("unused");
        for command in ["format", "erase", "test-controller", "test-drive", "report"] {
            let result = execute(&config(&small_config(command, &path)));
            assert!(result.unwrap(), "{} failed", command);
        }
    }

    #[test]
    fn test_no_disk() {
        let path = temp_image("nodisk");
        let mut no_disk = config(&small_config("read", &path));
        no_disk.simulator.no_disk = true;
        assert!(!execute(&no_disk).unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_inputs() {
        let cfg = config("[drive]\n[imaging]\n");
        assert!(execute(&cfg).is_err());

        let cfg = config("command = \"write\"\n[drive]\n[imaging]\n");
        assert!(execute(&cfg).is_err());

        let cfg = config("command = \"read\"\n[drive]\ndrive_number = 6\n[imaging]\n");
        assert!(execute(&cfg).is_err());
    }

    #[test]
    fn test_fatal_error() {
        let path = temp_image("fatal");
        let mut cfg = config(&small_config("read", &path));
        cfg.simulator.faults.recalibrate_failures = 100;
        let err = execute(&cfg).unwrap_err();
        assert!(is_fatal(&err));

        let cfg = config(&small_config("write", &temp_image("missing")));
        let err = execute(&cfg).unwrap_err();
        assert!(!is_fatal(&err));
    }

    #[test]
    fn test_simulated_disk() {
        let cfg = config(
            r#"
            [drive]
            preset = "360k"

            [imaging]

            [simulator]
            media = "3740"
            write_protect = true
            "#,
        );
        let disk = build_disk(&cfg);
        assert_eq!(disk.cylinders(), 77);
        let track = disk.track(0, 0).unwrap();
        assert!(track.fm);
        assert_eq!(track.sectors.len(), 26);
    }
}
