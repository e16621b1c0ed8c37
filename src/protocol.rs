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

//! VM2 console protocol constants and line patterns

use std::time::Duration;
use regex::Regex;

// ============================================================================
// Line Parameters
// ============================================================================

/// Baud rate of the controller's console port
pub const BAUD_RATE: u32 = 115_200;

/// How long a single line read waits before reporting "no data yet"
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between polls while waiting for the startup banner
pub const POLL_DELAY: Duration = Duration::from_secs(1);

/// Pause after writing a frame, before listening for the end-of-file report
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Default silence budget while waiting for prompts and end-of-file reports
pub const RESPONSE_WAIT: Duration = Duration::from_secs(30);

/// Default time allowed in any one post-banner wait, chatter or not
pub const REPLY_WAIT: Duration = Duration::from_secs(300);

/// Default number of unrecognised lines tolerated in any one bounded wait
pub const MAX_IGNORED_LINES: u32 = 1000;

/// Bits on the wire per character at 8N1
pub const BITS_PER_CHAR: u64 = 10;

/// Serial device used when none is given on the command line
pub const DEFAULT_SERIAL_DEVICE: &str = "ttyUSB0";

// ============================================================================
// Wire Text
// ============================================================================

/// Answer written back for every confirmation question
pub const AFFIRMATIVE: &[u8] = b"Y\n";

/// Closing sentinel of an upload frame
pub const FRAME_END: &[u8] = b"\nPROGRAM End\n";

/// Startup banner printed after the controller resets
pub const BANNER: &str = r"^VM2 Control Computer";

/// Confirmation questions asked before the controller accepts a program
pub const QUESTIONS: &str =
    r"^(Clear RAM\?|Are you sure\?|Application in Flash: Erase Application\?)";

/// Idle command prompt
pub const IDLE_PROMPT: &str = r"^\s*-->\s*$";

/// Reported once the controller has consumed a whole frame
pub const END_OF_FILE: &str = r#"^End of file "([^"]*)""#;

/// Compiler summary line, e.g. `2 Syntax errors`
pub const SYNTAX_ERRORS: &str = r"^\s*(\d+) [Ss]yntax [Ee]rrors?";

// ============================================================================
// Pattern Set
// ============================================================================

/// Compiled matchers for every line the uploader reacts to.
pub struct Patterns {
    banner: Regex,
    question: Regex,
    idle_prompt: Regex,
    end_of_file: Regex,
    syntax_errors: Regex,
}

impl Patterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Patterns {
            banner: Regex::new(BANNER)?,
            question: Regex::new(QUESTIONS)?,
            idle_prompt: Regex::new(IDLE_PROMPT)?,
            end_of_file: Regex::new(END_OF_FILE)?,
            syntax_errors: Regex::new(SYNTAX_ERRORS)?,
        })
    }

    pub fn is_banner(&self, line: &str) -> bool {
        self.banner.is_match(line)
    }

    /// Returns the question text if `line` asks for confirmation.
    pub fn question<'l>(&self, line: &'l str) -> Option<&'l str> {
        self.question.find(line).map(|m| m.as_str())
    }

    pub fn is_idle_prompt(&self, line: &str) -> bool {
        self.idle_prompt.is_match(line)
    }

    /// Returns the file name reported by an end-of-file line.
    pub fn end_of_file<'l>(&self, line: &'l str) -> Option<&'l str> {
        self.end_of_file
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    pub fn syntax_errors(&self, line: &str) -> Option<u32> {
        self.syntax_errors
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

// ============================================================================
// Tests
// ============================================================================
