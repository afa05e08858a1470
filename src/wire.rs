//! Wire format shared by the delivery client and the collector server.
//!
//! Each connection carries exactly one message: a JSON object terminated by
//! a single `\n`. The server answers with `ACK\n` once the reading has been
//! stored. JSON escapes control characters inside strings, so the delimiter
//! can never appear inside an encoded message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reading::{Reading, ReadingError};

/// Terminates every message and every reply.
pub const DELIMITER: u8 = b'\n';

/// Acknowledgment token sent by the server after a reading is stored.
pub const ACK_TOKEN: &[u8] = b"ACK";

/// A reading as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,

    /// Client-generated id, identical across retries of the same reading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

impl WireMessage {
    /// Wrap a reading with a fresh message id.
    pub fn new(reading: &Reading) -> Self {
        Self::with_id(reading, Uuid::new_v4())
    }

    /// Wrap a reading with the given message id.
    pub fn with_id(reading: &Reading, message_id: Uuid) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            timestamp: reading.timestamp,
            value: reading.value,
            unit: reading.unit.clone(),
            message_id: Some(message_id),
        }
    }

    /// Convert into a validated reading.
    pub fn into_reading(self) -> Result<Reading, DecodeError> {
        let reading = Reading::new(self.sensor_id, self.timestamp, self.value, self.unit);
        reading.validate()?;
        Ok(reading)
    }
}

/// Errors raised while decoding a received message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid reading: {0}")]
    Invalid(#[from] ReadingError),
}

/// Errors raised while encoding a message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("cannot encode reading: {0}")]
    Invalid(#[from] ReadingError),

    #[error("cannot encode reading: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as one delimited line.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, EncodeError> {
    Reading::new(
        message.sensor_id.as_str(),
        message.timestamp,
        message.value,
        message.unit.as_str(),
    )
    .validate()?;

    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Decode one received line. A trailing delimiter (and `\r`) is ignored.
pub fn decode(line: &[u8]) -> Result<WireMessage, DecodeError> {
    let text = std::str::from_utf8(line)?;
    let text = text.trim_end_matches(['\n', '\r']);
    let message: WireMessage = serde_json::from_str(text)?;
    Ok(message)
}

/// Decode one received line straight into a validated reading.
pub fn decode_reading(line: &[u8]) -> Result<(Reading, Option<Uuid>), DecodeError> {
    let message = decode(line)?;
    let message_id = message.message_id;
    Ok((message.into_reading()?, message_id))
}

/// The full acknowledgment reply, delimiter included.
pub fn ack_reply() -> Vec<u8> {
    let mut reply = ACK_TOKEN.to_vec();
    reply.push(DELIMITER);
    reply
}

/// Whether a received reply line is exactly the acknowledgment token.
pub fn is_ack(reply: &[u8]) -> bool {
    let mut end = reply.len();
    while end > 0 && matches!(reply[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &reply[..end] == ACK_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_reading() -> Reading {
        let ts = Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap()
            + chrono::Duration::microseconds(535_897);
        Reading::new("T1", ts, -12.75, "°C")
    }

    #[test]
    fn test_encode_decode_preserves_reading() {
        let reading = sample_reading();
        let message = WireMessage::new(&reading);
        let bytes = encode(&message).unwrap();

        assert_eq!(*bytes.last().unwrap(), DELIMITER);
        assert_eq!(bytes.iter().filter(|b| **b == DELIMITER).count(), 1);

        let (decoded, id) = decode_reading(&bytes).unwrap();
        assert_eq!(decoded, reading);
        assert_eq!(id, message.message_id);
    }

    #[test]
    fn test_unit_with_control_characters_stays_on_one_line() {
        let mut reading = sample_reading();
        reading.unit = "odd\nunit".to_string();

        let bytes = encode(&WireMessage::new(&reading)).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == DELIMITER).count(), 1);

        let (decoded, _) = decode_reading(&bytes).unwrap();
        assert_eq!(decoded.unit, "odd\nunit");
    }

    #[test]
    fn test_message_format_is_self_describing() {
        let bytes = encode(&WireMessage::new(&sample_reading())).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains(r#""sensor_id":"T1""#));
        assert!(text.contains(r#""unit":"°C""#));
        assert!(text.contains(r#""timestamp":"2024-03-14T15:09:26.535897Z""#));
        assert!(text.contains(r#""message_id""#));
    }

    #[test]
    fn test_decode_without_message_id() {
        let line = br#"{"sensor_id":"H1","timestamp":"2024-03-14T15:09:26+02:00","value":55.0,"unit":"%"}"#;
        let (reading, id) = decode_reading(line).unwrap();

        assert_eq!(reading.sensor_id, "H1");
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 14, 13, 9, 26).unwrap()
        );
        assert!(id.is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_messages() {
        assert!(matches!(decode(b"not json\n"), Err(DecodeError::Json(_))));
        assert!(matches!(decode(&[0xff, 0xfe, b'\n']), Err(DecodeError::Utf8(_))));
        assert!(matches!(
            decode(br#"{"sensor_id":"T1","value":1.0,"unit":"C"}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_reading(br#"{"sensor_id":"","timestamp":"2024-01-01T00:00:00Z","value":1.0,"unit":"C"}"#),
            Err(DecodeError::Invalid(ReadingError::EmptySensorId))
        ));
    }

    #[test]
    fn test_encode_rejects_non_finite_value() {
        let mut reading = sample_reading();
        reading.value = f64::NAN;
        assert!(matches!(
            encode(&WireMessage::new(&reading)),
            Err(EncodeError::Invalid(_))
        ));
    }

    #[test]
    fn test_ack_detection() {
        assert!(is_ack(b"ACK"));
        assert!(is_ack(b"ACK\n"));
        assert!(is_ack(b"ACK\r\n"));
        assert!(is_ack(&ack_reply()));
        assert!(!is_ack(b""));
        assert!(!is_ack(b"NAK\n"));
        assert!(!is_ack(b"ACKX\n"));
        assert!(!is_ack(b" ACK\n"));
    }
}
