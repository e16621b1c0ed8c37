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

use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, DataBits, FlowControl, Parity, StopBits};
use thiserror::Error;
use crate::protocol::{BAUD_RATE, READ_TIMEOUT};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port is already open")]
    AlreadyOpen,

    #[error("serial port is not open")]
    NotOpen,

    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Line-oriented duplex link to the controller.
pub trait SerialPort: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Reads one line, without its terminator.
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`. Text received
    /// without a terminator before the timeout is returned as a line, since the
    /// controller leaves its prompt unterminated while it waits for input.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;
}

// ============================================================================
// Line Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: READ_TIMEOUT,
        }
    }
}

/// Turns a bare device name such as `ttyUSB0` into the path the OS expects.
pub fn resolve_device(name: &str) -> String {
    if cfg!(windows) || name.contains('/') || name.contains('\\') {
        name.to_string()
    } else {
        format!("/dev/{}", name)
    }
}

/// Windows COM ports have no filesystem entry, so only Unix paths are checked.
pub fn device_present(path: &str) -> bool {
    cfg!(windows) || Path::new(path).exists()
}

// ============================================================================
// Line Buffer
// ============================================================================

/// Splits received bytes into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pops the next complete line, if one has been received.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(decode_line(&line))
    }

    /// Pops whatever partial line is buffered.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Reads from `source` until a line is complete or it has been quiet for
    /// `timeout`. Every arriving chunk restarts the wait, so a slow line is
    /// never cut in two. Text left over after a quiet spell is returned as a
    /// line of its own, since the idle prompt has no terminator.
    pub fn read_from<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
        timeout: Duration,
    ) -> std::io::Result<Option<String>> {
        if let Some(line) = self.next_line() {
            return Ok(Some(line));
        }

        let mut deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            match source.read(&mut buf) {
                Ok(n) if n > 0 => {
                    self.push(&buf[..n]);
                    if let Some(line) = self.next_line() {
                        return Ok(Some(line));
                    }
                    deadline = Instant::now() + timeout;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Ok(self.take_partial());
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    path: String,
    settings: SerialSettings,
    port: Option<Box<dyn SerialPortTrait>>,
    lines: LineBuffer,
}

impl RealSerialPort {
    pub fn new(path: impl Into<String>, settings: SerialSettings) -> Self {
        RealSerialPort {
            path: path.into(),
            settings,
            port: None,
            lines: LineBuffer::default(),
        }
    }
}

impl SerialPort for RealSerialPort {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let port = serialport::new(&self.path, self.settings.baud_rate)
            .data_bits(self.settings.data_bits)
            .parity(self.settings.parity)
            .stop_bits(self.settings.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(self.settings.timeout)
            .open()
            .map_err(|source| TransportError::Open { path: self.path.clone(), source })?;

        self.lines.clear();
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.lines.clear();
        // Dropping the handle closes the device.
        self.port.take().map(drop).ok_or(TransportError::NotOpen)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(buf).map_err(TransportError::Write)?;
        port.flush().map_err(TransportError::Write)?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.set_timeout(timeout)
            .map_err(|e| TransportError::Read(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.lines.read_from(&mut **port, timeout).map_err(TransportError::Read)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Lines to return on reads (None = timeout)
    read_buffer: Vec<Option<String>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    is_open: bool,
    opens: usize,
    closes: usize,
    fail_writes: bool,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<&str>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses.into_iter().map(|r| r.map(str::to_string)).collect(),
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            is_open: false,
            opens: 0,
            closes: 0,
            fail_writes: false,
        }
    }

    /// Port that someone else already holds open.
    pub fn already_open(mut self) -> Self {
        self.is_open = true;
        self
    }

    /// Port whose writes all fail.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.is_open {
            return Err(TransportError::AlreadyOpen);
        }
        self.is_open = true;
        self.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::NotOpen);
        }
        self.is_open = false;
        self.closes += 1;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        assert!(self.is_open, "write on closed MockSerialPort");
        if self.fail_writes {
            return Err(TransportError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Mock write failure",
            )));
        }
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
        assert!(self.is_open, "read on closed MockSerialPort");
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Ok(None);
        }

        let line = self.read_buffer[self.read_pos].clone();
        self.read_pos += 1;
        Ok(line)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} lines)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            String::from_utf8_lossy(&self.write_log),
            String::from_utf8_lossy(&self.expected_writes),
            "MockSerialPort write log mismatch!"
        );

        assert_eq!(
            self.opens, self.closes,
            "MockSerialPort opened {} times but closed {} times",
            self.opens, self.closes
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
