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

//! Upload frame construction

use crate::protocol::FRAME_END;

/// Wraps a source file in the `PROGRAM` sentinels the controller expects.
///
/// Lines are passed through byte for byte, including their terminators.
/// The name is not escaped; a quote inside it produces a frame the
/// controller will reject.
pub fn build_frame<S: AsRef<str>>(name: &str, lines: &[S]) -> Vec<Vec<u8>> {
    let mut frame = Vec::with_capacity(lines.len() + 2);
    frame.push(format!("\nPROGRAM \"{}\"\n", name).into_bytes());
    frame.extend(lines.iter().map(|line| line.as_ref().as_bytes().to_vec()));
    frame.push(FRAME_END.to_vec());
    frame
}

/// Total number of bytes a frame puts on the wire.
pub fn frame_len(frame: &[Vec<u8>]) -> usize {
    frame.iter().map(Vec::len).sum()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sentinels() {
        let lines = vec!["PRINT 1\r\n".to_string(), "END\n".to_string()];
        let frame = build_frame("A.vnm", &lines);

        assert_eq!(frame.len(), 4);
        assert_eq!(frame[0], b"\nPROGRAM \"A.vnm\"\n");
        assert_eq!(frame[1], b"PRINT 1\r\n");
        assert_eq!(frame[2], b"END\n");
        assert_eq!(frame[3], b"\nPROGRAM End\n");
    }

    #[test]
    fn test_frame_keeps_lines_verbatim() {
        let lines = ["  indented\t\n", "", "no terminator"];
        let frame = build_frame("x", &lines);

        let middle: Vec<&[u8]> = frame[1..frame.len() - 1].iter().map(Vec::as_slice).collect();
        let expected: Vec<&[u8]> = lines.iter().map(|l| l.as_bytes()).collect();
        assert_eq!(middle, expected);
    }

    #[test]
    fn test_empty_file() {
        let frame = build_frame::<&str>("EMPTY.vnm", &[]);
        assert_eq!(frame, vec![b"\nPROGRAM \"EMPTY.vnm\"\n".to_vec(), b"\nPROGRAM End\n".to_vec()]);
        assert_eq!(frame_len(&frame), 21 + 13);
    }

    #[test]
    fn test_name_not_escaped() {
        let frame = build_frame::<&str>("a\"b", &[]);
        assert_eq!(frame[0], b"\nPROGRAM \"a\"b\"\n");
    }
}
