// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use vm2upload::protocol::DEFAULT_SERIAL_DEVICE;
use vm2upload::serial::{device_present, resolve_device};
use vm2upload::{
    load_manifest, RealSerialPort, SerialSettings, UploadError, UploadOptions, UploadReport, Uploader,
};

#[derive(Parser)]
#[command(name = "vm2upload")]
#[command(about = "Upload a project to a VM2 Control Computer over RS-232", long_about = None)]
struct Cli {
    /// Project file listing the source files to upload
    project: PathBuf,

    /// Serial device to use (e.g., ttyUSB0, /dev/ttyS1 or COM1)
    #[arg(short, long, default_value = DEFAULT_SERIAL_DEVICE, value_name = "DEVICE")]
    serial: String,

    /// Give up if the controller has not restarted after this many seconds
    #[arg(long, value_name = "SECS")]
    reset_timeout: Option<u64>,

    /// Give up after the controller stays silent this long (0 waits forever)
    #[arg(long, default_value = "30", value_name = "SECS")]
    response_timeout: u64,

    /// Give up on a prompt or end-of-file report after this long, even while
    /// the controller keeps printing (0 waits forever)
    #[arg(long, default_value = "300", value_name = "SECS")]
    reply_timeout: u64,

    /// Log every line the controller prints
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.debug {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    match upload_project(&cli) {
        Ok(report) => {
            let errors = report.total_syntax_errors();
            if errors > 0 {
                println!("\nProject uploaded, controller reported {} syntax error(s)", errors);
            } else {
                println!("\nProject uploaded successfully!");
            }
        }
        Err(e) => {
            error!("Upload failed: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn upload_project(cli: &Cli) -> Result<UploadReport, UploadError> {
    let device = resolve_device(&cli.serial);

    if !cli.project.exists() {
        return Err(UploadError::Config(format!("project file not found: {}", cli.project.display())));
    }
    if !device_present(&device) {
        return Err(UploadError::Config(format!("serial device not found: {}", device)));
    }

    let units = load_manifest(&cli.project)?;
    info!(project = %cli.project.display(), files = units.len(), "Loaded project");

    let settings = SerialSettings::default();
    info!(
        device = %device,
        "Settings: {} baud, {:?}, {:?}, {:?}",
        settings.baud_rate, settings.data_bits, settings.parity, settings.stop_bits
    );

    let options = UploadOptions {
        banner_wait: cli.reset_timeout.map(Duration::from_secs),
        response_wait: (cli.response_timeout > 0).then(|| Duration::from_secs(cli.response_timeout)),
        reply_wait: (cli.reply_timeout > 0).then(|| Duration::from_secs(cli.reply_timeout)),
        ..UploadOptions::default()
    };

    let uploader = Uploader::new(Box::new(RealSerialPort::new(device, settings)), options)?;
    uploader.upload(&units)
}
