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

//! Project upload for the VM2 Control Computer console.
//!
//! The controller has no transfer protocol of its own: after a reset it
//! prints a banner, asks a few yes/no questions and then accepts programs
//! typed at its `-->` prompt. Each source file is sent wrapped in
//! `PROGRAM "<name>"` / `PROGRAM End` lines and the controller answers with
//! `End of file "<name>"` once it has taken the whole file.

pub mod events;
pub mod frame;
pub mod manifest;
pub mod protocol;
pub mod serial;
pub mod uploader;

pub use events::{NullObserver, Phase, TracingObserver, UploadEvent, UploadObserver};
pub use frame::build_frame;
pub use manifest::{load_manifest, ManifestError, ManifestParser, UploadUnit};
pub use serial::{RealSerialPort, SerialPort, SerialSettings, TransportError};
pub use uploader::{CancelToken, FileReport, UploadError, UploadOptions, UploadReport, Uploader};
