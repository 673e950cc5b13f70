//! `balance-bridge watch`: follow a running bridge's weight stream.
//!
//! Each `weight` event is folded through a [`StabilityDetector`] and printed
//! with both the instrument's own flag and the rolling-window verdict. An
//! `error` event breaks the sequence, so the window restarts after it.

use anyhow::{bail, Context, Result};
use bridge_core::StabilityDetector;
use bridge_server::StreamEvent;
use hyper::body::HttpBody;
use hyper::{Client, StatusCode, Uri};

/// What one event means for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// A reading with the window verdict after it.
    Weight {
        /// Weight value.
        value: f64,
        /// Unit token.
        unit: String,
        /// Instrument-reported stability.
        instrument_stable: bool,
        /// Rolling-window verdict.
        window_stable: bool,
    },
    /// The bridge reported a failed poll.
    Error(String),
}

impl std::fmt::Display for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Observation::Weight {
                value,
                unit,
                instrument_stable,
                window_stable,
            } => write!(
                f,
                "{:>12.3} {:<3} instrument={} window={}",
                value,
                unit,
                if *instrument_stable { "S" } else { "D" },
                if *window_stable { "stable" } else { "settling" }
            ),
            Observation::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Folds stream events into observations.
#[derive(Debug, Clone)]
pub struct Watcher {
    detector: StabilityDetector,
}

impl Watcher {
    /// Watcher with the given window parameters.
    pub fn new(window: usize, tolerance: f64) -> Self {
        Self {
            detector: StabilityDetector::new(window, tolerance),
        }
    }

    /// Apply one event.
    pub fn observe(&mut self, event: StreamEvent) -> Observation {
        match event {
            StreamEvent::Weight {
                value,
                unit,
                stable,
            } => {
                let reading = bridge_core::Reading::new(value, unit, stable);
                let window_stable = self.detector.push_reading(&reading);
                Observation::Weight {
                    value: reading.value,
                    unit: reading.unit,
                    instrument_stable: reading.stable,
                    window_stable,
                }
            }
            StreamEvent::Error { message } => {
                self.detector.reset();
                Observation::Error(message)
            }
        }
    }
}

/// Reassembles newline-delimited lines from arbitrarily split body chunks.
///
/// Bytes are only decoded once a full line is present, so a multi-byte
/// character split across chunks survives.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        Some(String::from_utf8(line))
    }
}

/// Stream from `base_url` and print observations until the stream ends or
/// `limit` weight events were shown.
pub async fn run(base_url: &str, watcher: &mut Watcher, limit: Option<usize>) -> Result<()> {
    let uri: Uri = format!("{}/weight/stream", base_url.trim_end_matches('/'))
        .parse()
        .with_context(|| format!("invalid bridge URL '{}'", base_url))?;

    let response = Client::new()
        .get(uri.clone())
        .await
        .with_context(|| format!("failed to reach bridge at {}", uri))?;

    match response.status() {
        StatusCode::OK => {}
        StatusCode::SERVICE_UNAVAILABLE => {
            bail!("bridge at {} has no balance configured", base_url)
        }
        other => bail!("bridge at {} answered {}", base_url, other),
    }

    let mut body = response.into_body();
    let mut lines = LineBuffer::default();
    let mut shown = 0usize;

    while let Some(chunk) = body.data().await {
        let chunk = chunk.context("stream interrupted")?;
        lines.extend(&chunk);

        while let Some(line) = lines.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring event that is not UTF-8");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let event = match StreamEvent::from_ndjson(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, line = %line.trim(), "ignoring unparseable event");
                    continue;
                }
            };
            let observation = watcher.observe(event);
            println!("{}", observation);

            if matches!(observation, Observation::Weight { .. }) {
                shown += 1;
                if limit.is_some_and(|limit| shown >= limit) {
                    return Ok(());
                }
            }
        }
    }

    tracing::info!("bridge closed the stream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(value: f64) -> StreamEvent {
        StreamEvent::Weight {
            value,
            unit: "g".to_string(),
            stable: true,
        }
    }

    fn window_verdict(observation: &Observation) -> bool {
        match observation {
            Observation::Weight { window_stable, .. } => *window_stable,
            Observation::Error(_) => false,
        }
    }

    #[test]
    fn window_settles_after_five_close_readings() {
        let mut watcher = Watcher::new(5, 0.5);
        let verdicts: Vec<bool> = [10.0, 10.1, 9.9, 10.0, 10.2]
            .into_iter()
            .map(|v| window_verdict(&watcher.observe(weight(v))))
            .collect();
        assert_eq!(verdicts, vec![false, false, false, false, true]);
    }

    #[test]
    fn error_event_restarts_window() {
        let mut watcher = Watcher::new(2, 0.5);
        watcher.observe(weight(1.0));
        assert!(window_verdict(&watcher.observe(weight(1.0))));

        let observation = watcher.observe(StreamEvent::Error {
            message: "instrument did not answer within the deadline".to_string(),
        });
        assert_eq!(
            observation.to_string(),
            "error: instrument did not answer within the deadline"
        );
        assert!(!window_verdict(&watcher.observe(weight(1.0))));
    }

    #[test]
    fn line_buffer_keeps_characters_split_across_chunks() {
        let line = "{\"event\":\"weight\",\"value\":1.5,\"unit\":\"µg\",\"stable\":true}\n";
        let bytes = line.as_bytes();
        let split = line.find('µ').unwrap() + 1;

        let mut lines = LineBuffer::default();
        lines.extend(&bytes[..split]);
        assert!(lines.next_line().is_none());
        lines.extend(&bytes[split..]);

        let decoded = lines.next_line().unwrap().unwrap();
        assert!(lines.next_line().is_none());
        assert_eq!(
            StreamEvent::from_ndjson(&decoded).unwrap(),
            StreamEvent::Weight {
                value: 1.5,
                unit: "µg".to_string(),
                stable: true,
            }
        );
    }

    #[test]
    fn line_buffer_yields_each_complete_line() {
        let mut lines = LineBuffer::default();
        lines.extend(b"a\nb\nc");
        assert_eq!(lines.next_line().unwrap().unwrap(), "a");
        assert_eq!(lines.next_line().unwrap().unwrap(), "b");
        assert!(lines.next_line().is_none());
        lines.extend(b"\n");
        assert_eq!(lines.next_line().unwrap().unwrap(), "c");
    }

    #[test]
    fn observation_display() {
        let observation = Observation::Weight {
            value: 12.5,
            unit: "g".to_string(),
            instrument_stable: false,
            window_stable: false,
        };
        assert_eq!(
            observation.to_string(),
            "      12.500 g   instrument=D window=settling"
        );
    }
}
