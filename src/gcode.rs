// src/gcode.rs
// G-code command parsing and the command-stream output sink.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

// Basic error type for G-code processing.
#[derive(Debug, PartialEq)]
pub struct CommandError(pub String);

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CommandError {}

impl From<String> for CommandError {
    fn from(s: String) -> Self {
        CommandError(s)
    }
}

impl From<&str> for CommandError {
    fn from(s: &str) -> Self {
        CommandError(s.to_string())
    }
}

/// A parsed G-code command: letter, number, optional subcode
/// (`G38.2` -> letter 'G', number 38, subcode 2) and letter-addressed
/// parameters. A parameter present without a value (e.g. `G32 K`) is
/// stored as NaN so `has_letter` sees it while `get_value` does not.
#[derive(Debug, Clone, PartialEq)]
pub struct GCodeCommand {
    pub letter: char,
    pub number: u16,
    pub subcode: Option<u8>,
    pub params: HashMap<char, f32>,
    pub raw: String,
}

impl GCodeCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let clean = line.split(';').next().unwrap_or("").trim();
        if clean.is_empty() {
            return Err(CommandError("Empty G-code line".to_string()));
        }

        let mut parts = clean.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| CommandError(format!("Missing command in line: {}", line)))?
            .to_uppercase();

        let letter = command
            .chars()
            .next()
            .filter(|c| c.is_ascii_alphabetic())
            .ok_or_else(|| CommandError(format!("Command must start with a letter: {}", command)))?;

        let number_part = &command[1..];
        let (number_str, subcode) = match number_part.split_once('.') {
            Some((n, s)) => {
                let sub = s.parse::<u8>().map_err(|_| {
                    CommandError(format!("Invalid subcode in command: {}", command))
                })?;
                (n, Some(sub))
            }
            None => (number_part, None),
        };
        let number = number_str
            .parse::<u16>()
            .map_err(|_| CommandError(format!("Invalid command number: {}", command)))?;

        let mut params = HashMap::new();
        for part in parts {
            let param = part
                .chars()
                .next()
                .filter(|c| c.is_ascii_alphabetic())
                .ok_or_else(|| CommandError(format!("Parameter must start with a letter: {}", part)))?
                .to_ascii_uppercase();
            if part.len() > 1 {
                let value = part[1..].parse::<f32>().map_err(|_| {
                    CommandError(format!("Invalid parameter value for {}: {}", param, &part[1..]))
                })?;
                params.insert(param, value);
            } else {
                // Bare flag parameter.
                params.insert(param, f32::NAN);
            }
        }

        Ok(GCodeCommand {
            letter,
            number,
            subcode,
            params,
            raw: line.to_string(),
        })
    }

    pub fn has_letter(&self, letter: char) -> bool {
        self.params.contains_key(&letter)
    }

    /// The numeric value for a parameter, if one was given.
    pub fn get_value(&self, letter: char) -> Option<f32> {
        self.params.get(&letter).copied().filter(|v| !v.is_nan())
    }

    pub fn get_value_or(&self, letter: char, default: f32) -> f32 {
        self.get_value(letter).unwrap_or(default)
    }

    pub fn is_g(&self, number: u16) -> bool {
        self.letter == 'G' && self.number == number
    }

    pub fn is_m(&self, number: u16) -> bool {
        self.letter == 'M' && self.number == number
    }
}

/// Line-oriented sink for everything the module family reports back to
/// the user. The transport behind it (serial, telnet, test harness) is
/// out of scope; tests read the buffered lines directly.
#[derive(Default)]
pub struct OutputStream {
    lines: Mutex<Vec<String>>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, line: impl Into<String>) {
        self.lines.lock().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}
