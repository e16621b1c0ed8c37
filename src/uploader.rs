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

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use crate::events::{Phase, TracingObserver, UploadEvent, UploadObserver};
use crate::frame::{build_frame, frame_len};
use crate::manifest::{ManifestError, UploadUnit};
use crate::protocol::*;
use crate::serial::{SerialPort, TransportError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serial error in {phase}: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("protocol mismatch in {phase}: {reason}")]
    ProtocolMismatch { phase: Phase, reason: String },

    #[error("upload cancelled in {phase}")]
    Cancelled { phase: Phase },

    #[error("an upload is already running on this port")]
    Busy,

    #[error("invalid line pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl UploadError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            UploadError::Config(_) => 2,
            UploadError::Transport { .. } => 3,
            UploadError::Manifest(_) => 4,
            UploadError::ProtocolMismatch { .. }
            | UploadError::Cancelled { .. }
            | UploadError::Busy
            | UploadError::Pattern(_) => 5,
        }
    }
}

// ============================================================================
// Options, Cancellation & Report
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Per-line read timeout; a timeout means "nothing yet", never an error.
    pub read_timeout: Duration,
    /// Pause between polls while waiting for the banner.
    pub poll_delay: Duration,
    /// Pause after a frame before listening for its end-of-file report.
    pub settle_delay: Duration,
    /// Give up waiting for the banner after this long. `None` waits forever.
    pub banner_wait: Option<Duration>,
    /// Give up after the controller stays silent this long while a prompt or
    /// end-of-file report is due. `None` waits forever.
    pub response_wait: Option<Duration>,
    /// Give up on a prompt or end-of-file report after this long in total,
    /// however much the controller prints meanwhile. `None` waits forever.
    pub reply_wait: Option<Duration>,
    /// Unrecognised lines tolerated in one bounded wait. A wait for an
    /// end-of-file report also allows one echo per source line.
    pub max_ignored_lines: Option<u32>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            read_timeout: READ_TIMEOUT,
            poll_delay: POLL_DELAY,
            settle_delay: SETTLE_DELAY,
            banner_wait: None,
            response_wait: Some(RESPONSE_WAIT),
            reply_wait: Some(REPLY_WAIT),
            max_ignored_lines: Some(MAX_IGNORED_LINES),
        }
    }
}

impl UploadOptions {
    /// The banner wait has no silence limit; its line cap only applies once
    /// the wait itself is bounded.
    fn banner_limits(&self) -> WaitLimits {
        WaitLimits {
            total: self.banner_wait,
            silence: None,
            lines: self.banner_wait.and(self.max_ignored_lines),
        }
    }

    fn reply_limits(&self, echoed: usize) -> WaitLimits {
        let echoed = u32::try_from(echoed).unwrap_or(u32::MAX);
        WaitLimits {
            total: self.reply_wait,
            silence: self.response_wait,
            lines: self.max_ignored_lines.map(|max| max.saturating_add(echoed)),
        }
    }
}

/// Bounds on a single wait for an expected line.
#[derive(Debug, Clone, Copy)]
struct WaitLimits {
    total: Option<Duration>,
    silence: Option<Duration>,
    lines: Option<u32>,
}

/// Stops a running upload before its next read.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub name: String,
    /// Count from the controller's syntax error summary, if it printed one.
    pub syntax_errors: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub files: Vec<FileReport>,
}

impl UploadReport {
    pub fn total_syntax_errors(&self) -> u32 {
        self.files.iter().filter_map(|f| f.syntax_errors).sum()
    }
}

// ============================================================================
// States
// ============================================================================

pub trait PhaseMarker {
    const PHASE: Phase;
}

pub struct AwaitBanner;
pub struct AwaitPrompt;
pub struct Ready;
pub struct SendFrame;
pub struct AwaitFileEnd;
pub struct AwaitPromptAfterFile;

impl PhaseMarker for AwaitBanner {
    const PHASE: Phase = Phase::AwaitBanner;
}

impl PhaseMarker for AwaitPrompt {
    const PHASE: Phase = Phase::AwaitPrompt;
}

impl PhaseMarker for Ready {
    const PHASE: Phase = Phase::Ready;
}

impl PhaseMarker for SendFrame {
    const PHASE: Phase = Phase::SendFrame;
}

impl PhaseMarker for AwaitFileEnd {
    const PHASE: Phase = Phase::AwaitFileEnd;
}

impl PhaseMarker for AwaitPromptAfterFile {
    const PHASE: Phase = Phase::AwaitPromptAfterFile;
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct UploaderFsm<'a, State> {
    state: PhantomData<State>,
    serial: &'a mut dyn SerialPort,
    units: &'a [UploadUnit],
    patterns: &'a Patterns,
    options: &'a UploadOptions,
    observer: &'a dyn UploadObserver,
    cancel: &'a CancelToken,
    // Index of the unit being sent
    current: usize,
    // Bookkeeping for the current wait, reset on every transition
    entered: Instant,
    booked: Duration,
    idle: Duration,
    ignored: u32,
    report: UploadReport,
}

pub enum Transition<'a> {
    Next(Box<dyn UploaderState<'a> + 'a>),
    Done(UploadReport),
}

// ============================================================================
// Trait
// ============================================================================

pub trait UploaderState<'a> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError>;
}

// ============================================================================
// Helpers shared by every state
// ============================================================================

impl<'a, S: PhaseMarker + 'a> UploaderFsm<'a, S> {
    fn transition<T: PhaseMarker>(self) -> Box<UploaderFsm<'a, T>> {
        self.observer.on_event(&UploadEvent::PhaseChanged { from: S::PHASE, to: T::PHASE });
        Box::new(UploaderFsm {
            state: PhantomData,
            serial: self.serial,
            units: self.units,
            patterns: self.patterns,
            options: self.options,
            observer: self.observer,
            cancel: self.cancel,
            current: self.current,
            entered: Instant::now(),
            booked: Duration::ZERO,
            idle: Duration::ZERO,
            ignored: 0,
            report: self.report,
        })
    }

    fn next<T: PhaseMarker + 'a>(self) -> Result<Transition<'a>, UploadError>
    where
        UploaderFsm<'a, T>: UploaderState<'a>,
    {
        let next = self.transition::<T>();
        Ok(Transition::Next(next))
    }

    fn stay(self) -> Result<Transition<'a>, UploadError>
    where
        Self: UploaderState<'a>,
    {
        Ok(Transition::Next(Box::new(self)))
    }

    fn transport_error(source: TransportError) -> UploadError {
        UploadError::Transport { phase: S::PHASE, source }
    }

    fn read_line(&mut self) -> Result<Option<String>, UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled { phase: S::PHASE });
        }

        let line = self.serial
            .read_line(self.options.read_timeout)
            .map_err(Self::transport_error)?;

        if let Some(ref line) = line {
            self.idle = Duration::ZERO;
            self.booked += wire_time(line);
            self.observer.on_event(&UploadEvent::LineReceived {
                phase: S::PHASE,
                line: line.clone(),
            });
        }
        Ok(line)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), UploadError> {
        self.serial.write_all(bytes).map_err(Self::transport_error)
    }

    /// Books one timed-out read (plus `pause`) and checks the wait's limits.
    fn silent(&mut self, pause: Duration, limits: WaitLimits, waiting_for: &str) -> Result<(), UploadError> {
        let slept = self.options.read_timeout + pause;
        self.idle += slept;
        self.booked += slept;
        self.check_wait(limits, waiting_for)
    }

    /// Counts a line that did not end the wait and checks the wait's limits.
    fn ignore_line(&mut self, limits: WaitLimits, waiting_for: &str) -> Result<(), UploadError> {
        self.ignored = self.ignored.saturating_add(1);
        self.check_wait(limits, waiting_for)
    }

    // Time is the larger of the clock and the nominal read time, so scripted
    // ports that never block still run out.
    fn check_wait(&self, limits: WaitLimits, waiting_for: &str) -> Result<(), UploadError> {
        let mismatch = |reason: String| Err(UploadError::ProtocolMismatch { phase: S::PHASE, reason });

        if let Some(limit) = limits.silence {
            if self.idle >= limit {
                return mismatch(format!("no {} within {:?} of silence", waiting_for, limit));
            }
        }
        if let Some(limit) = limits.total {
            if self.entered.elapsed().max(self.booked) >= limit {
                return mismatch(format!("no {} within {:?}", waiting_for, limit));
            }
        }
        if let Some(limit) = limits.lines {
            if self.ignored >= limit {
                return mismatch(format!("no {} after {} other lines", waiting_for, self.ignored));
            }
        }
        Ok(())
    }

    fn note_syntax_errors(&mut self, line: &str) {
        let Some(count) = self.patterns.syntax_errors(line) else {
            return;
        };
        if let Some(file) = self.report.files.last_mut() {
            file.syntax_errors = Some(count);
            self.observer.on_event(&UploadEvent::SyntaxErrors {
                name: file.name.clone(),
                count,
            });
        }
    }
}

/// Time the controller needs to send `line` and its newline.
fn wire_time(line: &str) -> Duration {
    let bits = (line.len() as u64 + 1) * BITS_PER_CHAR;
    Duration::from_micros(bits * 1_000_000 / u64::from(BAUD_RATE))
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> UploaderState<'a> for UploaderFsm<'a, AwaitBanner> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError> {
        let mut fsm = *self;
        let limits = fsm.options.banner_limits();
        match fsm.read_line()? {
            Some(line) if fsm.patterns.is_banner(&line) => fsm.next::<AwaitPrompt>(),
            Some(_) => {
                fsm.ignore_line(limits, "startup banner")?;
                fsm.stay()
            }
            None => {
                let pause = fsm.options.poll_delay;
                fsm.silent(pause, limits, "startup banner")?;
                std::thread::sleep(pause);
                fsm.stay()
            }
        }
    }
}

impl<'a> UploaderState<'a> for UploaderFsm<'a, AwaitPrompt> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError> {
        let mut fsm = *self;
        let limits = fsm.options.reply_limits(0);
        let line = match fsm.read_line()? {
            Some(line) => line,
            None => {
                fsm.silent(Duration::ZERO, limits, "idle prompt")?;
                return fsm.stay();
            }
        };

        if fsm.patterns.is_idle_prompt(&line) {
            return fsm.next::<Ready>();
        }

        if let Some(question) = fsm.patterns.question(&line) {
            // The echo of our answer is just more chatter; keep reading.
            fsm.write(AFFIRMATIVE)?;
            fsm.observer.on_event(&UploadEvent::QuestionAnswered {
                question: question.to_string(),
            });
        }
        fsm.ignore_line(limits, "idle prompt")?;
        fsm.stay()
    }
}

impl<'a> UploaderState<'a> for UploaderFsm<'a, Ready> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError> {
        let fsm = *self;
        if fsm.current < fsm.units.len() {
            fsm.next::<SendFrame>()
        } else {
            fsm.observer.on_event(&UploadEvent::PhaseChanged { from: Phase::Ready, to: Phase::Done });
            Ok(Transition::Done(fsm.report))
        }
    }
}

impl<'a> UploaderState<'a> for UploaderFsm<'a, SendFrame> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError> {
        let mut fsm = *self;
        let units = fsm.units;
        let unit = &units[fsm.current];

        // No reads until the whole frame is out.
        let frame = build_frame(&unit.name, &unit.lines);
        for chunk in &frame {
            fsm.write(chunk)?;
        }

        fsm.report.files.push(FileReport { name: unit.name.clone(), syntax_errors: None });
        fsm.observer.on_event(&UploadEvent::FrameSent {
            name: unit.name.clone(),
            bytes: frame_len(&frame),
        });

        std::thread::sleep(fsm.options.settle_delay);
        fsm.next::<AwaitFileEnd>()
    }
}

impl<'a> UploaderState<'a> for UploaderFsm<'a, AwaitFileEnd> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError> {
        let mut fsm = *self;
        let units = fsm.units;
        let unit = &units[fsm.current];
        let name = unit.name.as_str();
        let limits = fsm.options.reply_limits(unit.lines.len());

        match fsm.read_line()? {
            Some(line) => {
                fsm.note_syntax_errors(&line);
                if fsm.patterns.end_of_file(&line) == Some(name) {
                    fsm.observer.on_event(&UploadEvent::FileConfirmed { name: name.to_string() });
                    fsm.next::<AwaitPromptAfterFile>()
                } else {
                    fsm.ignore_line(limits, &format!("end of file report for {}", name))?;
                    fsm.stay()
                }
            }
            None => {
                fsm.silent(Duration::ZERO, limits, &format!("end of file report for {}", name))?;
                fsm.stay()
            }
        }
    }
}

impl<'a> UploaderState<'a> for UploaderFsm<'a, AwaitPromptAfterFile> {
    fn step(self: Box<Self>) -> Result<Transition<'a>, UploadError> {
        let mut fsm = *self;
        let limits = fsm.options.reply_limits(0);
        match fsm.read_line()? {
            Some(line) if fsm.patterns.is_idle_prompt(&line) => {
                fsm.current += 1;
                fsm.next::<Ready>()
            }
            Some(line) => {
                fsm.note_syntax_errors(&line);
                fsm.ignore_line(limits, "idle prompt")?;
                fsm.stay()
            }
            None => {
                fsm.silent(Duration::ZERO, limits, "idle prompt")?;
                fsm.stay()
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> UploaderFsm<'a, AwaitBanner> {
    pub fn new(
        serial: &'a mut dyn SerialPort,
        units: &'a [UploadUnit],
        patterns: &'a Patterns,
        options: &'a UploadOptions,
        observer: &'a dyn UploadObserver,
        cancel: &'a CancelToken,
    ) -> Box<dyn UploaderState<'a> + 'a> {
        Box::new(UploaderFsm {
            state: PhantomData::<AwaitBanner>,
            serial,
            units,
            patterns,
            options,
            observer,
            cancel,
            current: 0,
            entered: Instant::now(),
            booked: Duration::ZERO,
            idle: Duration::ZERO,
            ignored: 0,
            report: UploadReport::default(),
        })
    }
}

/// Steps the machine until every unit is confirmed.
pub fn run<'a>(mut state: Box<dyn UploaderState<'a> + 'a>) -> Result<UploadReport, UploadError> {
    loop {
        match state.step()? {
            Transition::Next(next) => state = next,
            Transition::Done(report) => return Ok(report),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owns the serial port and uploads projects through it, one at a time.
pub struct Uploader {
    serial: Mutex<Box<dyn SerialPort>>,
    patterns: Patterns,
    options: UploadOptions,
    observer: Arc<dyn UploadObserver>,
    cancel: CancelToken,
}

impl Uploader {
    pub fn new(serial: Box<dyn SerialPort>, options: UploadOptions) -> Result<Self, UploadError> {
        Self::with_observer(serial, options, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        serial: Box<dyn SerialPort>,
        options: UploadOptions,
        observer: Arc<dyn UploadObserver>,
    ) -> Result<Self, UploadError> {
        Ok(Uploader {
            serial: Mutex::new(serial),
            patterns: Patterns::new()?,
            options,
            observer,
            cancel: CancelToken::new(),
        })
    }

    /// Replaces the token that cancels uploads. Once cancelled, it stays cancelled.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Opens the port, waits for the controller to restart, sends every unit
    /// in order and closes the port again.
    ///
    /// Fails with [`UploadError::Busy`] while another call is running.
    pub fn upload(&self, units: &[UploadUnit]) -> Result<UploadReport, UploadError> {
        let mut serial = match self.serial.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(UploadError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        serial.open().map_err(|source| UploadError::Transport { phase: Phase::Open, source })?;
        info!(files = units.len(), "Serial port open");
        self.observer.on_event(&UploadEvent::PhaseChanged {
            from: Phase::Open,
            to: Phase::AwaitBanner,
        });

        let fsm = UploaderFsm::new(
            &mut **serial,
            units,
            &self.patterns,
            &self.options,
            self.observer.as_ref(),
            &self.cancel,
        );
        let result = run(fsm);

        if let Err(e) = serial.close() {
            warn!(error = %e, "Failed to close serial port");
        }
        result
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::serial::MockSerialPort;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const BANNER_LINE: &str = "VM2 Control Computer V3.1 (c) 1998";

    fn fast_options() -> UploadOptions {
        UploadOptions {
            poll_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            banner_wait: Some(Duration::from_secs(5)),
            response_wait: Some(Duration::from_secs(3)),
            ..UploadOptions::default()
        }
    }

    fn frame_bytes(unit: &UploadUnit) -> Vec<u8> {
        build_frame(&unit.name, &unit.lines).concat()
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<UploadEvent>>,
        cancel_after_frame: Option<CancelToken>,
    }

    impl RecordingObserver {
        fn phases(&self) -> Vec<(Phase, Phase)> {
            self.events.lock().unwrap().iter().filter_map(|e| match e {
                UploadEvent::PhaseChanged { from, to } => Some((*from, *to)),
                _ => None,
            }).collect()
        }

        fn answered(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().filter_map(|e| match e {
                UploadEvent::QuestionAnswered { question } => Some(question.clone()),
                _ => None,
            }).collect()
        }

        fn confirmed(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().filter_map(|e| match e {
                UploadEvent::FileConfirmed { name } => Some(name.clone()),
                _ => None,
            }).collect()
        }
    }

    impl UploadObserver for RecordingObserver {
        fn on_event(&self, event: &UploadEvent) {
            if let (UploadEvent::FrameSent { .. }, Some(token)) = (event, &self.cancel_after_frame) {
                token.cancel();
            }
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_single_file_upload() {
        let unit = UploadUnit::from_text("A.vnm", "10 PRINT \"HI\"\r\n20 END\r\n");

        let responses = vec![
            Some("garbage from before the reset"),
            None,
            Some(BANNER_LINE),
            Some("Are you sure?"),
            Some("Y"),
            Some("-->"),
            Some("Loading..."),
            Some(r#"End of file "A.vnm""#),
            Some("-->"),
        ];

        let mut expected_writes = AFFIRMATIVE.to_vec();
        expected_writes.extend_from_slice(b"\nPROGRAM \"A.vnm\"\n");
        expected_writes.extend_from_slice(b"10 PRINT \"HI\"\r\n20 END\r\n");
        expected_writes.extend_from_slice(b"\nPROGRAM End\n");

        let observer = Arc::new(RecordingObserver::default());
        let mock = MockSerialPort::new(responses, expected_writes);
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), observer.clone()).unwrap();

        let report = uploader.upload(&[unit]).expect("upload should succeed");
        assert_eq!(report.files, vec![FileReport { name: "A.vnm".to_string(), syntax_errors: None }]);
        assert_eq!(observer.answered(), vec!["Are you sure?"]);
        assert_eq!(observer.confirmed(), vec!["A.vnm"]);
        assert_eq!(observer.phases().last(), Some(&(Phase::Ready, Phase::Done)));
    }

    #[test]
    fn test_phase_sequence_for_two_files() {
        let a = UploadUnit::from_text("A.vnm", "A\n");
        let b = UploadUnit::from_text("B.vnm", "B\n");

        let responses = vec![
            Some(BANNER_LINE),
            Some("-->"),
            Some(r#"End of file "A.vnm""#),
            Some("-->"),
            Some(r#"End of file "B.vnm""#),
            Some("-->"),
        ];
        let mut expected_writes = frame_bytes(&a);
        expected_writes.extend(frame_bytes(&b));

        let observer = Arc::new(RecordingObserver::default());
        let mock = MockSerialPort::new(responses, expected_writes);
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), observer.clone()).unwrap();

        uploader.upload(&[a, b]).expect("upload should succeed");

        let per_file = [
            (Phase::Ready, Phase::SendFrame),
            (Phase::SendFrame, Phase::AwaitFileEnd),
            (Phase::AwaitFileEnd, Phase::AwaitPromptAfterFile),
            (Phase::AwaitPromptAfterFile, Phase::Ready),
        ];
        let mut expected = vec![
            (Phase::Open, Phase::AwaitBanner),
            (Phase::AwaitBanner, Phase::AwaitPrompt),
            (Phase::AwaitPrompt, Phase::Ready),
        ];
        expected.extend_from_slice(&per_file);
        expected.extend_from_slice(&per_file);
        expected.push((Phase::Ready, Phase::Done));

        assert_eq!(observer.phases(), expected);
        assert_eq!(observer.confirmed(), vec!["A.vnm", "B.vnm"]);
    }

    #[test]
    fn test_one_answer_per_question() {
        let responses = vec![
            Some(BANNER_LINE),
            Some(""),
            Some("Clear RAM?"),
            Some("   "),
            Some("Checking flash"),
            Some("Are you sure?"),
            Some("--> LIST"),
            Some("Application in Flash: Erase Application?"),
            None,
            Some("Are you sure?"),
            Some("  -->  "),
        ];
        let expected_writes = AFFIRMATIVE.repeat(4);

        let observer = Arc::new(RecordingObserver::default());
        let mock = MockSerialPort::new(responses, expected_writes);
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), observer.clone()).unwrap();

        let report = uploader.upload(&[]).expect("upload should succeed");
        assert!(report.files.is_empty());
        assert_eq!(observer.answered(), vec![
            "Clear RAM?",
            "Are you sure?",
            "Application in Flash: Erase Application?",
            "Are you sure?",
        ]);
    }

    #[test]
    fn test_end_of_file_for_other_name_ignored() {
        let unit = UploadUnit::from_text("A.vnm", "END\n");

        // The prompt seen while waiting for the report must not count either.
        let responses = vec![
            Some(BANNER_LINE),
            Some("-->"),
            Some(r#"End of file "B.vnm""#),
            Some("-->"),
            Some(r#"End of file "A.vnmx""#),
            Some(r#"End of file "A.vnm""#),
            Some("-->"),
        ];

        let observer = Arc::new(RecordingObserver::default());
        let mock = MockSerialPort::new(responses, frame_bytes(&unit));
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), observer.clone()).unwrap();

        uploader.upload(&[unit]).expect("upload should succeed");
        assert_eq!(observer.confirmed(), vec!["A.vnm"]);
    }

    #[test]
    fn test_banner_poll_budget() {
        let responses = vec![Some("noise"), None, Some("more noise")];

        let mock = MockSerialPort::new(responses, Vec::new());
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), Arc::new(NullObserver)).unwrap();

        match uploader.upload(&[]) {
            Err(UploadError::ProtocolMismatch { phase, .. }) => assert_eq!(phase, Phase::AwaitBanner),
            other => panic!("expected banner timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_unbounded_banner_wait_cancelled() {
        let options = UploadOptions {
            poll_delay: Duration::from_millis(1),
            banner_wait: None,
            ..fast_options()
        };

        let mock = MockSerialPort::new(vec![Some("noise")], Vec::new());
        let uploader = Uploader::with_observer(Box::new(mock), options, Arc::new(NullObserver)).unwrap();

        let token = uploader.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        let result = uploader.upload(&[]);
        canceller.join().unwrap();
        assert!(matches!(result, Err(UploadError::Cancelled { phase: Phase::AwaitBanner })));
    }

    #[test]
    fn test_cancel_before_file_end() {
        let unit = UploadUnit::from_text("A.vnm", "END\n");
        let token = CancelToken::new();

        let observer = Arc::new(RecordingObserver {
            cancel_after_frame: Some(token.clone()),
            ..Default::default()
        });
        let mock = MockSerialPort::new(vec![Some(BANNER_LINE), Some("-->")], frame_bytes(&unit));
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), observer.clone())
            .unwrap()
            .with_cancel_token(token);

        let result = uploader.upload(&[unit]);
        assert!(matches!(result, Err(UploadError::Cancelled { phase: Phase::AwaitFileEnd })));
        assert!(observer.confirmed().is_empty());
    }

    #[test]
    fn test_silent_after_frame() {
        let unit = UploadUnit::from_text("A.vnm", "END\n");
        let responses = vec![Some(BANNER_LINE), Some("-->"), Some("Compiling")];

        let mock = MockSerialPort::new(responses, frame_bytes(&unit));
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), Arc::new(NullObserver)).unwrap();

        match uploader.upload(&[unit]) {
            Err(UploadError::ProtocolMismatch { phase, reason }) => {
                assert_eq!(phase, Phase::AwaitFileEnd);
                assert!(reason.contains("A.vnm"), "reason: {}", reason);
            }
            other => panic!("expected end of file timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_silent_before_prompt() {
        let mock = MockSerialPort::new(vec![Some(BANNER_LINE), Some("Clear RAM?")], AFFIRMATIVE.to_vec());
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), Arc::new(NullObserver)).unwrap();

        assert!(matches!(
            uploader.upload(&[]),
            Err(UploadError::ProtocolMismatch { phase: Phase::AwaitPrompt, .. })
        ));
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let unit = UploadUnit::from_text("A.vnm", "END\n");
        let mock = MockSerialPort::new(vec![Some(BANNER_LINE), Some("Clear RAM?")], Vec::new())
            .failing_writes();
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), Arc::new(NullObserver)).unwrap();

        let err = uploader.upload(&[unit]).unwrap_err();
        assert!(matches!(
            err,
            UploadError::Transport { phase: Phase::AwaitPrompt, source: TransportError::Write(_) }
        ));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_port_already_open() {
        let mock = MockSerialPort::new(Vec::new(), Vec::new()).already_open();
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), Arc::new(NullObserver)).unwrap();

        assert!(matches!(
            uploader.upload(&[]),
            Err(UploadError::Transport { phase: Phase::Open, source: TransportError::AlreadyOpen })
        ));
    }

    #[test]
    fn test_syntax_errors_recorded() {
        let unit = UploadUnit::from_text("A.vnm", "10 PRNT\n");
        let responses = vec![
            Some(BANNER_LINE),
            Some("-->"),
            Some("Line 10: unknown keyword"),
            Some(r#"End of file "A.vnm""#),
            Some("1 Syntax error"),
            Some("-->"),
        ];

        let observer = Arc::new(RecordingObserver::default());
        let mock = MockSerialPort::new(responses, frame_bytes(&unit));
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), observer.clone()).unwrap();

        let report = uploader.upload(&[unit]).expect("syntax errors do not abort");
        assert_eq!(report.files[0].syntax_errors, Some(1));
        assert_eq!(report.total_syntax_errors(), 1);
        assert!(observer.events.lock().unwrap().contains(&UploadEvent::SyntaxErrors {
            name: "A.vnm".to_string(),
            count: 1,
        }));
    }

    #[test]
    fn test_sequential_uploads_reopen_port() {
        let responses = vec![Some(BANNER_LINE), Some("-->"), Some(BANNER_LINE), Some("-->")];
        let mock = MockSerialPort::new(responses, Vec::new());
        let uploader = Uploader::with_observer(Box::new(mock), fast_options(), Arc::new(NullObserver)).unwrap();

        uploader.upload(&[]).expect("first upload");
        uploader.upload(&[]).expect("second upload");
    }

    #[test]
    fn test_banner_poll_steps() {
        let mut mock = MockSerialPort::new(vec![None, Some(BANNER_LINE), Some("-->")], Vec::new());
        mock.open().unwrap();

        let patterns = Patterns::new().unwrap();
        let options = fast_options();
        let cancel = CancelToken::new();
        {
            let mut state = UploaderFsm::new(&mut mock, &[], &patterns, &options, &NullObserver, &cancel);
            for _ in 0..3 {
                state = match state.step().expect("should keep going") {
                    Transition::Next(next) => next,
                    Transition::Done(_) => panic!("finished too early"),
                };
            }
            assert!(matches!(state.step(), Ok(Transition::Done(_))));
        }
        mock.close().unwrap();
    }

    /// Plays `script`, then prints `chatter` on every read forever.
    struct ChattyPort {
        script: VecDeque<&'static str>,
        chatter: String,
        reads: Arc<AtomicUsize>,
    }

    impl ChattyPort {
        fn new(script: &[&'static str], chatter: &str) -> (Self, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let port = ChattyPort {
                script: script.iter().copied().collect(),
                chatter: chatter.to_string(),
                reads: Arc::clone(&reads),
            };
            (port, reads)
        }
    }

    impl SerialPort for ChattyPort {
        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn write_all(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
            let count = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(count < 100_000, "chatter never ended the wait");
            Ok(Some(match self.script.pop_front() {
                Some(line) => line.to_string(),
                None => self.chatter.clone(),
            }))
        }
    }

    #[test]
    fn test_banner_wait_counts_chatter() {
        // 100 characters take almost 9ms at 115200 baud.
        let (port, reads) = ChattyPort::new(&[], &"Self test running ".repeat(6)[..100]);
        let options = UploadOptions {
            banner_wait: Some(Duration::from_secs(1)),
            max_ignored_lines: None,
            ..fast_options()
        };
        let uploader = Uploader::with_observer(Box::new(port), options, Arc::new(NullObserver)).unwrap();

        match uploader.upload(&[]) {
            Err(UploadError::ProtocolMismatch { phase, .. }) => assert_eq!(phase, Phase::AwaitBanner),
            other => panic!("expected banner timeout, got {:?}", other),
        }
        assert!(reads.load(Ordering::SeqCst) <= 115, "reads: {}", reads.load(Ordering::SeqCst));
    }

    #[test]
    fn test_banner_line_cap() {
        let (port, reads) = ChattyPort::new(&[], "noise");
        let options = UploadOptions {
            banner_wait: Some(Duration::from_secs(3600)),
            max_ignored_lines: Some(20),
            ..fast_options()
        };
        let uploader = Uploader::with_observer(Box::new(port), options, Arc::new(NullObserver)).unwrap();

        match uploader.upload(&[]) {
            Err(UploadError::ProtocolMismatch { phase, reason }) => {
                assert_eq!(phase, Phase::AwaitBanner);
                assert!(reason.contains("20 other lines"), "reason: {}", reason);
            }
            other => panic!("expected banner mismatch, got {:?}", other),
        }
        assert_eq!(reads.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_endless_compiling_after_frame() {
        let unit = UploadUnit::from_text("A.vnm", "END\n");
        let (port, reads) = ChattyPort::new(&[BANNER_LINE, "-->"], "Compiling...");
        let uploader = Uploader::with_observer(Box::new(port), fast_options(), Arc::new(NullObserver)).unwrap();

        match uploader.upload(&[unit]) {
            Err(UploadError::ProtocolMismatch { phase, reason }) => {
                assert_eq!(phase, Phase::AwaitFileEnd);
                assert!(reason.contains("A.vnm"), "reason: {}", reason);
            }
            other => panic!("expected end of file mismatch, got {:?}", other),
        }
        // Default cap plus one echo for the single source line.
        assert_eq!(reads.load(Ordering::SeqCst), 2 + MAX_IGNORED_LINES as usize + 1);
    }

    #[test]
    fn test_reply_wait_counts_chatter() {
        let (port, _reads) = ChattyPort::new(
            &[BANNER_LINE, "-->", r#"End of file "A.vnm""#],
            &"Checking ".repeat(12)[..100],
        );
        let options = UploadOptions {
            reply_wait: Some(Duration::from_secs(1)),
            max_ignored_lines: None,
            ..fast_options()
        };
        let uploader = Uploader::with_observer(Box::new(port), options, Arc::new(NullObserver)).unwrap();

        let unit = UploadUnit::from_text("A.vnm", "END\n");
        assert!(matches!(
            uploader.upload(&[unit]),
            Err(UploadError::ProtocolMismatch { phase: Phase::AwaitPromptAfterFile, .. })
        ));
    }

    struct GatedPort {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        gated: bool,
    }

    impl SerialPort for GatedPort {
        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn write_all(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
            if self.gated {
                return Ok(Some("-->".to_string()));
            }
            self.gated = true;
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
            Ok(Some(BANNER_LINE.to_string()))
        }
    }

    #[test]
    fn test_concurrent_upload_rejected() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let port = GatedPort { entered: entered_tx, release: release_rx, gated: false };

        let uploader = Arc::new(Uploader::with_observer(Box::new(port), fast_options(), Arc::new(NullObserver)).unwrap());
        let worker = {
            let uploader = Arc::clone(&uploader);
            std::thread::spawn(move || uploader.upload(&[]))
        };

        entered_rx.recv().unwrap();
        let second = uploader.upload(&[]);
        assert!(matches!(second, Err(UploadError::Busy)));
        release_tx.send(()).unwrap();

        let report = worker.join().unwrap().expect("first upload should finish");
        assert!(report.files.is_empty());
    }

    #[test]
    fn test_exit_codes() {
        let io = || std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(UploadError::Config("missing".into()).exit_code(), 2);
        assert_eq!(UploadError::Transport { phase: Phase::Open, source: TransportError::NotOpen }.exit_code(), 3);
        assert_eq!(UploadError::Manifest(ManifestError::Open { path: "x".into(), source: io() }).exit_code(), 4);
        assert_eq!(UploadError::ProtocolMismatch { phase: Phase::AwaitFileEnd, reason: String::new() }.exit_code(), 5);
        assert_eq!(UploadError::Cancelled { phase: Phase::AwaitBanner }.exit_code(), 5);
        assert_eq!(UploadError::Busy.exit_code(), 5);
    }
}
