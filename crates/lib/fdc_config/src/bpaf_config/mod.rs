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

    fdc_config::bpaf_config::mod.rs

    Command line arguments. Anything given here overrides megafdc.toml.
*/

use std::path::PathBuf;

use crate::{parse_drive, Command, MediaPreset};

use bpaf::{Bpaf, Parser};

fn drive_arg() -> impl Parser<Option<u8>> {
    bpaf::long("drive")
        .help("Drive to use, as a letter (A-D) or a number (0-3)")
        .argument::<String>("drive")
        .parse(|s| parse_drive(&s))
        .optional()
}

#[derive(Bpaf, Debug, Default)]
#[bpaf(options, version, generate(cli_args))]
pub struct CmdLineArgs {
    #[bpaf(long("config_file"), long("configfile"))]
    pub config_file: Option<PathBuf>,

    #[bpaf(long("log_level"))]
    pub log_level: Option<String>,

    /// One of read, write, format, erase, test-controller, test-drive, report or inspect
    #[bpaf(long)]
    pub command: Option<Command>,

    /// Image file to read into or write from
    #[bpaf(long)]
    pub image: Option<PathBuf>,

    #[bpaf(external(drive_arg))]
    pub drive: Option<u8>,

    /// Drive and media preset: 1440k, 360k or 3740
    #[bpaf(long)]
    pub media: Option<MediaPreset>,

    #[bpaf(long)]
    pub cylinders: Option<u8>,

    #[bpaf(long, switch)]
    pub verify: bool,

    #[bpaf(long("skip_bad"), switch)]
    pub skip_bad: bool,

    #[bpaf(long("xlat_300_250"), switch)]
    pub xlat_300_250: bool,

    #[bpaf(long("block_1k"), switch)]
    pub block_1k: bool,

    // Simulator options
    #[bpaf(long("no_disk"), switch)]
    pub no_disk: bool,

    #[bpaf(long("write_protect"), switch)]
    pub write_protect: bool,
}
