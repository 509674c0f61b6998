//! Text reply grammar.
//!
//! Replies are space-delimited ASCII. The first token is the reply code:
//!
//! ```text
//! ERROR <message>
//! NO_DATA <message>
//! MEASURE <n_pos> <x1> .. <xn> <v1> .. <vm>
//! ```
//!
//! `MEASURE` carries the measured position followed by the flattened raw
//! measurement in row-major order.

use crate::core::{Position, RawMeasurement};
use crate::error::{ScanError, ScanResult};

/// A decoded `MEASURE` command reply.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureReply {
    /// The instrument reported an error
    Error(String),
    /// Nothing new has been measured since the last request
    NoData(String),
    /// A completed measurement
    Measure {
        /// Where the measurement was taken, in instrument coordinates
        position: Position,
        /// Raw data, reshaped to the instrument's measurement shape
        raw: RawMeasurement,
    },
    /// A reply code outside the grammar
    Unknown(String),
}

/// Decode a `MEASURE` reply.
///
/// Empty tokens (repeated separators) are ignored. A malformed `MEASURE`
/// payload is reported as [`ScanError::MalformedPayload`]; unknown codes are
/// not an error.
pub fn parse_measure_reply(
    reply: &str,
    n_dim: usize,
    shape: &[usize],
) -> ScanResult<MeasureReply> {
    let mut tokens = reply.split_whitespace();
    let Some(code) = tokens.next() else {
        return Err(ScanError::Protocol("empty reply".to_string()));
    };
    let rest: Vec<&str> = tokens.collect();

    match code {
        "ERROR" => Ok(MeasureReply::Error(rest.join(" "))),
        "NO_DATA" => Ok(MeasureReply::NoData(rest.join(" "))),
        "MEASURE" => parse_measure_payload(&rest, n_dim, shape),
        other => Ok(MeasureReply::Unknown(other.to_string())),
    }
}

fn parse_measure_payload(tokens: &[&str], n_dim: usize, shape: &[usize]) -> ScanResult<MeasureReply> {
    let (count, tail) = tokens
        .split_first()
        .ok_or_else(|| ScanError::MalformedPayload("missing position count".to_string()))?;
    let n_pos: usize = parse_count(count)?;
    if n_pos != n_dim {
        return Err(ScanError::MalformedPayload(format!(
            "position has {n_pos} coordinates, instrument has {n_dim} axes"
        )));
    }
    if tail.len() < n_pos {
        return Err(ScanError::MalformedPayload(format!(
            "expected {n_pos} coordinates, got {}",
            tail.len()
        )));
    }
    let (pos_tokens, data_tokens) = tail.split_at(n_pos);
    let position = parse_floats(pos_tokens)?;
    let data = parse_floats(data_tokens)?;
    let raw = RawMeasurement::from_flat(shape, data)?;
    Ok(MeasureReply::Measure { position, raw })
}

fn parse_count(token: &str) -> ScanResult<usize> {
    // some servers send the count as a float
    if let Ok(n) = token.parse::<usize>() {
        return Ok(n);
    }
    match token.parse::<f64>() {
        Ok(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as usize),
        _ => Err(ScanError::MalformedPayload(format!(
            "invalid position count '{token}'"
        ))),
    }
}

fn parse_floats(tokens: &[&str]) -> ScanResult<Vec<f64>> {
    tokens
        .iter()
        .map(|t| match t.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            Ok(_) => Err(ScanError::MalformedPayload(format!("non-finite value: '{t}'"))),
            Err(_) => Err(ScanError::MalformedPayload(format!("not a number: '{t}'"))),
        })
        .collect()
}

/// Format a `MEASURE` reply.
pub fn format_measure_reply(position: &[f64], raw: &RawMeasurement) -> String {
    let mut reply = format!("MEASURE {}", position.len());
    for value in position.iter().chain(raw.data()) {
        reply.push(' ');
        reply.push_str(&value.to_string());
    }
    reply
}

/// Parse the first token of a command acknowledgement.
///
/// Returns the message of an `ERROR` reply.
pub fn rejection(reply: &str) -> Option<String> {
    let mut tokens = reply.split_whitespace();
    match tokens.next() {
        Some("ERROR") => Some(tokens.collect::<Vec<_>>().join(" ")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_measure() {
        let reply = "MEASURE 2 1.5 -2  1 2 3 4 5 6";
        match parse_measure_reply(reply, 2, &[2, 3]).unwrap() {
            MeasureReply::Measure { position, raw } => {
                assert_eq!(position, vec![1.5, -2.0]);
                assert_eq!(raw.shape(), &[2, 3]);
                assert_eq!(raw.data()[5], 6.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_and_no_data() {
        assert_eq!(
            parse_measure_reply("ERROR motor stalled", 2, &[1]).unwrap(),
            MeasureReply::Error("motor stalled".into())
        );
        assert_eq!(
            parse_measure_reply("NO_DATA", 2, &[1]).unwrap(),
            MeasureReply::NoData(String::new())
        );
        assert_eq!(
            parse_measure_reply("BUSY 1", 2, &[1]).unwrap(),
            MeasureReply::Unknown("BUSY".into())
        );
    }

    #[test]
    fn test_malformed_payloads() {
        for reply in [
            "MEASURE",
            "MEASURE x 1 2",
            "MEASURE 2 1.0",
            "MEASURE 2 1.0 2.0 1 2 3",
            "MEASURE 2 1.0 2.0 1 two",
            "MEASURE 3 1.0 2.0 3.0 1 2",
            "MEASURE 2 nan 1.0 1 2",
            "MEASURE 2 inf 1.0 1 2",
            "MEASURE 2 1.0 -inf 1 2",
            "MEASURE 2 1.0 2.0 NaN 2",
        ] {
            assert!(
                matches!(parse_measure_reply(reply, 2, &[2]), Err(ScanError::MalformedPayload(_))),
                "{reply}"
            );
        }
    }

    #[test]
    fn test_float_count_accepted() {
        assert!(matches!(
            parse_measure_reply("MEASURE 1.0 3 7", 1, &[1]).unwrap(),
            MeasureReply::Measure { .. }
        ));
    }

    #[test]
    fn test_formatted_reply_parses_back() {
        let raw = RawMeasurement::from_flat(&[2], vec![0.25, 8.0]).unwrap();
        let reply = format_measure_reply(&[1.0, -3.5], &raw);
        assert_eq!(
            parse_measure_reply(&reply, 2, &[2]).unwrap(),
            MeasureReply::Measure {
                position: vec![1.0, -3.5],
                raw
            }
        );
    }

    #[test]
    fn test_rejection() {
        assert_eq!(rejection("ERROR already running"), Some("already running".into()));
        assert_eq!(rejection("OK"), None);
    }
}
