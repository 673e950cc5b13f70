//! Stream events and their NDJSON encoding.
//!
//! Wire shapes, one JSON object per line:
//!
//! ```text
//! {"event":"weight","value":123.45,"unit":"g","stable":true}
//! {"event":"error","message":"instrument fault +: balance in overload range"}
//! ```

use bridge_core::{BridgeError, Reading};
use serde::{Deserialize, Serialize};

/// One item delivered to every subscriber per poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A reading decoded from the instrument.
    Weight {
        /// Weight value.
        value: f64,
        /// Unit token.
        unit: String,
        /// Instrument-reported stability.
        stable: bool,
    },
    /// The poll failed; the stream continues.
    Error {
        /// Human readable cause.
        message: String,
    },
}

impl StreamEvent {
    /// Event for the result of one poll.
    pub fn from_poll(result: Result<Reading, BridgeError>) -> Self {
        match result {
            Ok(reading) => reading.into(),
            Err(e) => StreamEvent::Error {
                message: e.to_string(),
            },
        }
    }

    /// The reading carried by a `weight` event.
    pub fn reading(&self) -> Option<Reading> {
        match self {
            StreamEvent::Weight {
                value,
                unit,
                stable,
            } => Some(Reading::new(*value, unit.clone(), *stable)),
            StreamEvent::Error { .. } => None,
        }
    }

    /// Encode as one NDJSON line including the trailing newline.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one NDJSON line.
    pub fn from_ndjson(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl From<Reading> for StreamEvent {
    fn from(reading: Reading) -> Self {
        StreamEvent::Weight {
            value: reading.value,
            unit: reading.unit,
            stable: reading.stable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{ConnectionError, ProtocolError};

    #[test]
    fn weight_event_wire_shape() {
        let event = StreamEvent::from(Reading::new(123.45, "g", true));
        assert_eq!(
            event.to_ndjson().unwrap(),
            "{\"event\":\"weight\",\"value\":123.45,\"unit\":\"g\",\"stable\":true}\n"
        );
    }

    #[test]
    fn errors_become_error_events() {
        let event = StreamEvent::from_poll(Err(ProtocolError::fault("ES").into()));
        assert_eq!(
            event,
            StreamEvent::Error {
                message: "instrument fault ES: syntax error, command not recognised".to_string()
            }
        );

        let event = StreamEvent::from_poll(Err(ConnectionError::Timeout.into()));
        let json: serde_json::Value = serde_json::from_str(&event.to_ndjson().unwrap()).unwrap();
        assert_eq!(json["event"], "error");
        assert!(json["message"].as_str().unwrap().contains("deadline"));
    }

    #[test]
    fn parses_consumer_side() {
        let line = "{\"event\":\"weight\",\"value\":-1.5,\"unit\":\"kg\",\"stable\":false}\r\n";
        let event = StreamEvent::from_ndjson(line).unwrap();
        assert_eq!(event.reading(), Some(Reading::new(-1.5, "kg", false)));
        assert!(StreamEvent::from_ndjson("{\"event\":\"bogus\"}").is_err());
    }
}
