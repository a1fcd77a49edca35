//! Shared utility functions for the runbox core.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::process::Command;

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ST`) sequences, plus lone two-byte escapes.
fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][A-Za-z0-9]|\x1b[=>78MNOcDE]")
            .expect("static ANSI pattern is valid")
    })
}

/// Remove terminal escape sequences from a line of PTY output.
pub fn strip_ansi(line: &str) -> String {
    if !line.contains('\x1b') {
        return line.to_string();
    }
    ansi_regex().replace_all(line, "").into_owned()
}

/// Unix timestamp (seconds)
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unix timestamp (milliseconds)
pub fn current_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_color_codes() {
        assert_eq!(strip_ansi("\x1b[32mhello\x1b[0m"), "hello");
        assert_eq!(strip_ansi("\x1b[1;31mbold red\x1b[m"), "bold red");
    }

    #[test]
    fn test_strip_ansi_clear_and_cursor() {
        assert_eq!(strip_ansi("\x1b[H\x1b[2J\x1b[3Jafter clear"), "after clear");
        assert_eq!(strip_ansi("\x1b[?25lhidden\x1b[?25h"), "hidden");
    }

    #[test]
    fn test_strip_ansi_window_title() {
        assert_eq!(strip_ansi("\x1b]0;user@host: ~\x07prompt$ "), "prompt$ ");
        assert_eq!(strip_ansi("\x1b]2;title\x1b\\text"), "text");
    }

    #[test]
    fn test_strip_ansi_plain_text_untouched() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
        assert_eq!(strip_ansi(""), "");
    }

    #[test]
    fn test_timestamps_nonzero() {
        assert!(current_timestamp() > 0);
        assert!(current_timestamp_millis() > 0);
    }
}
