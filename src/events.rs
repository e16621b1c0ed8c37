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

//! Upload progress events
//!
//! The console protocol gives no structured feedback, so every line the
//! controller prints and every step the uploader takes is reported here.

use std::fmt;

/// Uploader phases, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Opening the serial port.
    Open,
    /// Waiting for the controller's startup banner.
    AwaitBanner,
    /// Answering confirmation questions until the idle prompt.
    AwaitPrompt,
    /// Idle prompt seen, next file may be sent.
    Ready,
    /// Writing a frame.
    SendFrame,
    /// Waiting for the end-of-file report of the frame just sent.
    AwaitFileEnd,
    /// Waiting for the idle prompt after a file.
    AwaitPromptAfterFile,
    /// Every file sent.
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Open => write!(f, "Open"),
            Phase::AwaitBanner => write!(f, "AwaitBanner"),
            Phase::AwaitPrompt => write!(f, "AwaitPrompt"),
            Phase::Ready => write!(f, "Ready"),
            Phase::SendFrame => write!(f, "SendFrame"),
            Phase::AwaitFileEnd => write!(f, "AwaitFileEnd"),
            Phase::AwaitPromptAfterFile => write!(f, "AwaitPromptAfterFile"),
            Phase::Done => write!(f, "Done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    PhaseChanged { from: Phase, to: Phase },
    /// Raw line from the controller.
    LineReceived { phase: Phase, line: String },
    QuestionAnswered { question: String },
    FrameSent { name: String, bytes: usize },
    FileConfirmed { name: String },
    SyntaxErrors { name: String, count: u32 },
}

pub trait UploadObserver: Send + Sync {
    fn on_event(&self, event: &UploadEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UploadObserver for NullObserver {
    fn on_event(&self, _event: &UploadEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UploadObserver for TracingObserver {
    fn on_event(&self, event: &UploadEvent) {
        match event {
            UploadEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
                match to {
                    Phase::AwaitBanner => tracing::info!("Please reset the controller"),
                    Phase::AwaitPrompt => tracing::info!("Controller started, answering questions"),
                    Phase::Ready if *from == Phase::AwaitPrompt => tracing::info!("Controller ready"),
                    Phase::Done => tracing::info!("All files sent"),
                    _ => {}
                }
            }
            UploadEvent::LineReceived { phase, line } => {
                tracing::debug!(phase = %phase, "<< {}", line);
            }
            UploadEvent::QuestionAnswered { question } => {
                tracing::info!(question = %question, "Answered Y");
            }
            UploadEvent::FrameSent { name, bytes } => {
                tracing::info!(file = %name, bytes = bytes, "Sent file");
            }
            UploadEvent::FileConfirmed { name } => {
                tracing::info!(file = %name, "Controller reached end of file");
            }
            UploadEvent::SyntaxErrors { name, count } => {
                if *count > 0 {
                    tracing::warn!(file = %name, count = count, "Controller reported syntax errors");
                } else {
                    tracing::debug!(file = %name, "No syntax errors");
                }
            }
        }
    }
}
