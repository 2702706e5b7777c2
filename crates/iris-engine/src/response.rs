//! Inbound response parsing
//!
//! Recipients answer notifications with short commands:
//!
//! ```text
//! claim 01HZX3J6Q0V5S8M6E8YF7K2N4P
//! 01HZX3J6Q0V5S8M6E8YF7K2N4P claim
//! claim last
//! suppress 01HZX3J6Q0V5S8M6E8YF7K2N4P
//! ```
//!
//! The id is a message or batch id. Commands are case-insensitive.

use iris_core::IrisError;
use regex::Regex;
use std::sync::OnceLock;
use ulid::Ulid;

/// Parsed response command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCommand {
    /// Acknowledge the incident(s) of a message or batch
    Claim(Ulid),
    /// Acknowledge the incident(s) of the sender's most recent message
    ClaimLast,
    /// Acknowledge without taking ownership
    Suppress(Ulid),
}

struct Patterns {
    claim_last: Regex,
    command_first: Regex,
    id_first: Regex,
    reply_subject: Regex,
}

fn patterns() -> Result<&'static Patterns, IrisError> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Ok(Patterns {
                claim_last: Regex::new(r"(?i)^claim(?:\s+last)?$")?,
                command_first: Regex::new(r"(?i)^(claim|suppress)\s+([0-9a-z]{26})(?:\s.*)?$")?,
                id_first: Regex::new(r"(?i)^([0-9a-z]{26})\s+(claim|suppress)(?:\s.*)?$")?,
                reply_subject: Regex::new(r"(?i)^re:\s+([0-9a-z]{26})(?:\s.*)?$")?,
            })
        })
        .as_ref()
        .map_err(|e| IrisError::InvalidResponse(format!("response patterns: {e}")))
}

/// Parse a text response
///
/// # Errors
/// `IrisError::InvalidResponse` when the text is not a known command or
/// the id is malformed
pub fn parse_response(text: &str) -> Result<ResponseCommand, IrisError> {
    let text = text.trim();
    let patterns = patterns()?;

    if patterns.claim_last.is_match(text) {
        return Ok(ResponseCommand::ClaimLast);
    }
    if let Some(caps) = patterns.command_first.captures(text) {
        return command(&caps[1], &caps[2]);
    }
    if let Some(caps) = patterns.id_first.captures(text) {
        return command(&caps[2], &caps[1]);
    }
    Err(IrisError::InvalidResponse(format!(
        "unrecognized response: {text:?}"
    )))
}

/// Parse an email reply
///
/// A bare command on the first line applies to the message named in a
/// `Re: <id>` subject; anything else is parsed like a text response.
///
/// # Errors
/// `IrisError::InvalidResponse` as for [`parse_response`]
pub fn parse_email_response(first_line: &str, subject: &str) -> Result<ResponseCommand, IrisError> {
    let line = first_line.trim();
    let action = line.to_ascii_lowercase();
    if action == "claim" || action == "suppress" {
        if let Some(caps) = patterns()?.reply_subject.captures(subject.trim()) {
            return command(&action, &caps[1]);
        }
    }
    parse_response(line)
}

fn command(action: &str, id: &str) -> Result<ResponseCommand, IrisError> {
    let id = Ulid::from_string(&id.to_ascii_uppercase())
        .map_err(|e| IrisError::InvalidResponse(format!("invalid id {id:?}: {e}")))?;
    if action.eq_ignore_ascii_case("suppress") {
        Ok(ResponseCommand::Suppress(id))
    } else {
        Ok(ResponseCommand::Claim(id))
    }
}
