//! MT-SICS text protocol codec.
//!
//! Reference: METTLER TOLEDO Standard Interface Command Set (MT-SICS)
//!
//! Protocol Overview:
//! - Format: ASCII command lines, one response line per command
//! - Terminator: CR LF (`\r\n`) in both directions
//! - Commands used here: `SI` (weight now), `S` (stable weight), `Z` (zero),
//!   `T` (tare), `@` (reset)
//!
//! Weight response shapes (fields separated by one or more spaces):
//!
//! ```text
//! S S     123.45 g      echo, stable flag, value, unit
//! S D      45.60 g      echo, dynamic flag, value, unit
//! S  123.45 g           echo-less firmware variant
//! S +                   overload
//! S -                   underload
//! S I                   busy, command not executable right now
//! ES                    syntax error (also ET, EL)
//! ```
//!
//! This module performs no I/O and holds no state.

use bridge_core::{ProtocolError, Reading};

/// Line terminator used on the wire.
pub const TERMINATOR: &str = "\r\n";

/// Commands the bridge issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `SI`: send the current weight immediately, stable or not.
    WeightImmediate,
    /// `S`: send the next stable weight.
    WeightStable,
    /// `Z`: zero the balance once stable.
    Zero,
    /// `T`: tare with the next stable weight.
    Tare,
    /// `@`: reset, cancels pending commands.
    Reset,
}

impl Command {
    /// Wire token for this command.
    pub fn token(self) -> &'static str {
        match self {
            Command::WeightImmediate => "SI",
            Command::WeightStable => "S",
            Command::Zero => "Z",
            Command::Tare => "T",
            Command::Reset => "@",
        }
    }

    /// Token the balance echoes at the start of its reply.
    fn reply_token(self) -> &'static str {
        match self {
            // Weight commands always echo as "S"
            Command::WeightImmediate | Command::WeightStable => "S",
            Command::Reset => "I4",
            other => other.token(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Encode a command as its exact wire bytes.
pub fn encode_command(command: Command) -> Vec<u8> {
    format!("{}{}", command.token(), TERMINATOR).into_bytes()
}

/// Tokens a balance may echo in front of a weight status flag.
const WEIGHT_ECHOES: &[&str] = &["S", "SI", "SIR", "SU", "SIU", "T", "TI"];

/// Status flags that precede a value.
const VALUE_FLAGS: &[&str] = &["S", "D"];

/// Status flags reporting an instrument-side condition instead of a value.
const FAULT_FLAGS: &[&str] = &["+", "-", "E", "L", "I"];

/// Standalone error replies.
const ERROR_CODES: &[&str] = &["ES", "ET", "EL"];

/// True when `tokens[1..]` is a flagged body: a value flag, or a fault
/// flag standing alone at the end of the line.
fn has_echo(tokens: &[&str]) -> bool {
    match tokens {
        [echo, flag, ..] if WEIGHT_ECHOES.contains(echo) && VALUE_FLAGS.contains(flag) => true,
        [echo, flag] => WEIGHT_ECHOES.contains(echo) && FAULT_FLAGS.contains(flag),
        _ => false,
    }
}

/// Decode a weight response line into a [`Reading`].
///
/// The line may still carry its terminator. A leading command echo is
/// stripped when followed by a status flag. A fault flag only counts as one
/// when nothing follows it, so `S -    0.50 g` is a stable negative weight
/// with a padded sign.
pub fn decode_response(line: &str) -> Result<Reading, ProtocolError> {
    let trimmed = line.trim();
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();

    let Some(first) = tokens.first().copied() else {
        return Err(ProtocolError::malformed(trimmed));
    };
    if ERROR_CODES.contains(&first) {
        return Err(ProtocolError::fault(first));
    }

    let body = if has_echo(&tokens) {
        &tokens[1..]
    } else {
        &tokens[..]
    };

    match body {
        [flag, rest @ ..] if VALUE_FLAGS.contains(flag) => {
            let (value, unit) =
                parse_value_and_unit(rest).ok_or_else(|| ProtocolError::malformed(trimmed))?;
            Ok(Reading::new(value, unit, *flag == "S"))
        }
        [flag, ..] if FAULT_FLAGS.contains(flag) => Err(ProtocolError::fault(*flag)),
        _ => Err(ProtocolError::malformed(trimmed)),
    }
}

/// Parse `<value> <unit>` allowing a detached sign (`- 1.5 g`).
fn parse_value_and_unit(fields: &[&str]) -> Option<(f64, String)> {
    let (number, unit) = match fields {
        [sign @ ("+" | "-"), number, unit] => (format!("{}{}", sign, number), *unit),
        [number, unit] => ((*number).to_string(), *unit),
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || !is_unit(unit) {
        return None;
    }
    Some((value, unit.to_string()))
}

/// Units are short alphabetic tokens, optionally with `%` or `/` (`g`, `ct`, `%`, `lb/oz`).
fn is_unit(token: &str) -> bool {
    !token.is_empty()
        && token.chars().any(|c| c.is_alphabetic() || c == '%')
        && token
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '%' | '/' | '_'))
}

/// Decode the reply to a command that only acknowledges (`Z`, `@`).
///
/// `Z A` and `I4 A "<serial>"` are successes. Fault flags and standalone
/// error codes map to [`ProtocolError::InstrumentFault`].
pub fn decode_acknowledgement(command: Command, line: &str) -> Result<(), ProtocolError> {
    let trimmed = line.trim();
    let mut tokens = trimmed.split_whitespace();
    let first = tokens.next().ok_or_else(|| ProtocolError::malformed(trimmed))?;

    if ERROR_CODES.contains(&first) {
        return Err(ProtocolError::fault(first));
    }
    if first != command.reply_token() {
        return Err(ProtocolError::malformed(trimmed));
    }
    match tokens.next() {
        Some("A") => Ok(()),
        Some(flag) if FAULT_FLAGS.contains(&flag) => Err(ProtocolError::fault(flag)),
        _ => Err(ProtocolError::malformed(trimmed)),
    }
}
