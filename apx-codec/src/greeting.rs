// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Textual greeting exchanged before any frame: a start line, optional
//! header lines, then an empty line.

use apx_core::ApxError;

pub const GREETING_START: &str = "RMFP/1.0";
pub const NUMHEADER_FORMAT_HEADER: &str = "NumHeader-Format:";
pub const GREETING_MAX_LEN: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub numheader_format: u8,
}

impl Default for Greeting {
    fn default() -> Self {
        Greeting { numheader_format: 32 }
    }
}

pub fn format_greeting() -> String {
    let text = format!("{GREETING_START}\n{NUMHEADER_FORMAT_HEADER} 32\n\n");
    debug_assert!(text.len() <= GREETING_MAX_LEN);
    text
}

/// Parse the full greeting text (start line through the empty line).
pub fn parse_greeting(text: &str) -> Result<Greeting, ApxError> {
    if text.len() > GREETING_MAX_LEN {
        return Err(ApxError::Protocol("greeting too long".into()));
    }
    let mut lines = text.lines();
    match lines.next() {
        Some(line) if line.trim_end() == GREETING_START => {}
        _ => return Err(ApxError::Protocol("bad greeting start line".into())),
    }
    let mut greeting = Greeting::default();
    for line in lines {
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(greeting);
        }
        if let Some(value) = line.strip_prefix(NUMHEADER_FORMAT_HEADER) {
            let format: u8 = value
                .trim()
                .parse()
                .map_err(|_| ApxError::Protocol("bad NumHeader-Format value".into()))?;
            if format != 32 {
                return Err(ApxError::Protocol(format!(
                    "unsupported NumHeader-Format {format}"
                )));
            }
            greeting.numheader_format = format;
        }
        // Unknown headers are ignored for forward compatibility.
    }
    // Greetings delivered as one whole message may omit the trailing blank
    // line after splitting; accept them.
    Ok(greeting)
}
