//! Common ground of the two chip programmers.
//!
//! Both targets are programmed by external command line tools. A [`ToolRunner`]
//! starts the tool, hands every output line to a callback while it runs and
//! returns the full captured text once it exits.

use crate::eeprom::{EepromError, EepromRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("could not start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{step} failed: {reason}")]
    Failed { step: &'static str, reason: String },
    #[error("image {0} does not exist")]
    MissingImage(PathBuf),
    #[error("no serial port matching '{0}' found")]
    PortNotFound(String),
    #[error("expected {expected} images, got {got}")]
    ImageCount { expected: usize, got: usize },
    #[error(transparent)]
    Eeprom(#[from] EepromError),
}

/// Flash address, written in configuration as a hex string (`"0x8000"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlashAddress(pub u32);

impl FlashAddress {
    pub fn parse(text: &str) -> Result<Self, std::num::ParseIntError> {
        let digits = text
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        u32::from_str_radix(digits, 16).map(FlashAddress)
    }
}

impl TryFrom<String> for FlashAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FlashAddress::parse(&value).map_err(|e| format!("invalid flash address '{}': {}", value, e))
    }
}

impl From<FlashAddress> for String {
    fn from(value: FlashAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FlashAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// A binary image and where it goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSlot {
    pub path: PathBuf,
    pub address: FlashAddress,
}

impl ImageSlot {
    pub fn new(path: impl Into<PathBuf>, address: u32) -> Self {
        Self {
            path: path.into(),
            address: FlashAddress(address),
        }
    }

    pub fn ensure_exists(&self) -> Result<(), FlashError> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(FlashError::MissingImage(self.path.clone()))
        }
    }
}

/// The contract both chip programmers implement.
pub trait Flasher {
    fn target(&self) -> &'static str;

    /// Confirms the chip is present and returns its identity string.
    fn connect(&mut self) -> Result<String, FlashError>;

    fn erase(&mut self) -> Result<(), FlashError>;

    fn program(&mut self, images: &[ImageSlot]) -> Result<(), FlashError>;

    fn patch_eeprom(&mut self, records: &[EepromRecord]) -> Result<(), FlashError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: Option<i32>,
    /// stdout followed by stderr.
    pub text: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String], on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput>;
}

/// Runs tools as child processes and reads their pipes directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, program: &Path, args: &[String], on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput> {
        log::debug!("running {} {}", program.display(), args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stderr = child.stderr.take().ok_or_else(|| io::Error::other("stderr not captured"))?;
        let stderr_reader = thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let mut stdout = child.stdout.take().ok_or_else(|| io::Error::other("stdout not captured"))?;
        let mut text = String::new();
        let mut pending = String::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = stdout.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let piece = String::from_utf8_lossy(&chunk[..n]);
            text.push_str(&piece);
            pending.push_str(&piece);
            // progress output redraws with '\r', so both terminate a line
            while let Some(end) = pending.find(['\r', '\n']) {
                let line: String = pending.drain(..=end).collect();
                let line = line.trim_end_matches(['\r', '\n']);
                if !line.is_empty() {
                    on_line(line);
                }
            }
        }
        if !pending.is_empty() {
            on_line(&pending);
        }

        let status = child.wait()?;
        text.push_str(&stderr_reader.join().unwrap_or_default());
        Ok(ToolOutput {
            status: status.code(),
            text,
        })
    }
}

/// Removes terminal control sequences from tool output.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static regex"));
    re.replace_all(text, "")
}

/// Returns the cleaned line if it reports progress (contains a percentage).
pub fn progress_line(line: &str) -> Option<String> {
    let clean = strip_ansi(line);
    let clean = clean.trim();
    clean.contains('%').then(|| clean.to_string())
}

/// First known failure phrase present in `output`, if any.
pub fn find_failure<'p>(output: &str, phrases: &[&'p str]) -> Option<&'p str> {
    phrases.iter().copied().find(|phrase| output.contains(phrase))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records invocations and answers from a script.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub replies: Mutex<VecDeque<ToolOutput>>,
    }

    impl ScriptedRunner {
        pub(crate) fn reply(self, status: i32, text: &str) -> Self {
            self.replies.lock().unwrap().push_back(ToolOutput {
                status: Some(status),
                text: text.to_string(),
            });
            self
        }

        pub(crate) fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolRunner for ScriptedRunner {
        fn run(&self, program: &Path, args: &[String], on_line: &mut dyn FnMut(&str)) -> io::Result<ToolOutput> {
            let mut call = vec![program.display().to_string()];
            call.extend(args.iter().cloned());
            self.calls.lock().unwrap().push(call);

            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(ToolOutput {
                status: Some(0),
                text: String::new(),
            });
            for line in reply.text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
                on_line(line);
            }
            Ok(reply)
        }
    }

    #[test]
    fn flash_address_parses_with_and_without_prefix() {
        assert_eq!(FlashAddress::parse("0x8000").unwrap(), FlashAddress(0x8000));
        assert_eq!(FlashAddress::parse("08000000").unwrap(), FlashAddress(0x0800_0000));
        assert!(FlashAddress::parse("zz").is_err());
        assert_eq!(FlashAddress(0xD000).to_string(), "0xD000");
    }

    #[test]
    fn flash_address_from_json() {
        let slot: ImageSlot = serde_json::from_str(r#"{"path":"app.bin","address":"0x10000"}"#).unwrap();
        assert_eq!(slot, ImageSlot::new("app.bin", 0x10000));
        assert!(serde_json::from_str::<ImageSlot>(r#"{"path":"a","address":"nope"}"#).is_err());
    }

    #[test]
    fn ansi_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b[2K\x1b[1;32mWriting at 0x1000 (5 %)\x1b[0m"), "Writing at 0x1000 (5 %)");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn only_percentage_lines_are_progress() {
        assert_eq!(
            progress_line("\x1b[0mWriting at 0x00010000... (42 %) "),
            Some("Writing at 0x00010000... (42 %)".to_string())
        );
        assert_eq!(progress_line("Hash of data verified."), None);
    }

    #[test]
    fn failure_phrase_detection() {
        let phrases = ["No ST-LINK detected!", "Unexpected error"];
        assert_eq!(find_failure("ok\nUnexpected error\n", &phrases), Some("Unexpected error"));
        assert_eq!(find_failure("File download complete", &phrases), None);
    }

    #[test]
    fn missing_image_is_reported() {
        let slot = ImageSlot::new("/definitely/not/here.bin", 0);
        assert!(matches!(slot.ensure_exists(), Err(FlashError::MissingImage(_))));
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_streams_lines_and_captures_output() {
        let runner = ProcessRunner;
        let mut lines = Vec::new();
        let out = runner
            .run(
                Path::new("sh"),
                &["-c".to_string(), "printf 'a (10 %%)\\rb (20 %%)\\nc'; echo err >&2; exit 3".to_string()],
                &mut |l| lines.push(l.to_string()),
            )
            .unwrap();
        assert_eq!(lines, vec!["a (10 %)", "b (20 %)", "c"]);
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
        assert!(out.text.contains("err"));
    }
}
