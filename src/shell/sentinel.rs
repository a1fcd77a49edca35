//! Sentinel protocol for recovering exit codes from an interactive terminal.
//!
//! Every command is written as `clear; <command>; echo "<marker><status>"`.
//! The marker line is found by stripping escapes from each output line and
//! checking the prefix. The echoed input line starts with `clear;` so it never
//! matches.

use crate::utils::{current_timestamp_millis, strip_ansi};

/// PowerShell printed `False` for `$?`
pub const EXIT_FALSE: i32 = -999;
/// Status text after the marker could not be parsed
pub const EXIT_UNPARSEABLE: i32 = -998;

/// Unique end-of-command marker, e.g. `--end-1718000000000-3f2a9c1d:`
pub fn new_marker() -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("--end-{}-{}:", current_timestamp_millis(), &nonce[..8])
}

/// Compose the line written to the terminal (without the trailing newline).
///
/// `$?` is the last status in both bash (integer) and PowerShell (boolean).
pub fn compose_line(command: &str, marker: &str) -> String {
    format!("clear; {}; echo \"{}$?\"", command, marker)
}

/// Parse the status text that followed the marker.
pub fn parse_exit_status(status: &str) -> i32 {
    match status.trim() {
        "True" => 0,
        "False" => EXIT_FALSE,
        other => other.parse::<i32>().unwrap_or_else(|_| {
            tracing::warn!("Unable to parse exit code: {:?}", other);
            EXIT_UNPARSEABLE
        }),
    }
}

/// If `line` is the marker line, return the exit code it carries.
pub fn parse_marker_line(line: &str, marker: &str) -> Option<i32> {
    let clean = strip_ansi(line);
    // bash가 bracketed paste를 끄면서 줄 중간에 \r 을 남긴다; 화면에는 마지막 조각만 보인다
    let visible = clean.trim_end_matches('\r').rsplit('\r').next().unwrap_or_default();
    visible
        .trim_start_matches(|c: char| c.is_control())
        .strip_prefix(marker)
        .map(parse_exit_status)
}

/// Splits a byte stream into lines, keeping the unterminated tail for the next chunk.
///
/// Lines are decoded only once complete, so a multi-byte character split
/// across two reads comes out intact.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed (without `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.pending, rest);
            lines.push(decode_line(&raw[..pos]));
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let raw = std::mem::take(&mut self.pending);
            Some(decode_line(&raw))
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
