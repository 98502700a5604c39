//! Control messages exchanged between bonded peers.
//!
//! Framing, authentication and encryption belong to the outer protocol layer.
//! This module only defines the semantic payloads and their byte layout, all
//! multi-byte fields in network byte order (big-endian).
//!
//! # Payload Format
//!
//! Every control payload starts with a one-byte verb:
//! - `0x01` Echo: no body
//! - `0x02` QoS measurement: `n` records of (packet id: u64, holding time ms: u16)
//! - `0x03` Path negotiation request: utility (i16)

use std::fmt;

/// Largest encoded QoS measurement (verb byte excluded), in bytes.
pub const QOS_MAX_PACKET_SIZE: usize = 1400;

/// Encoded size of one QoS record.
pub const QOS_RECORD_SIZE: usize = 8 + 2;

/// Maximum number of records carried by one QoS measurement.
pub const QOS_TABLE_SIZE: usize = (QOS_MAX_PACKET_SIZE * 8) / (64 + 16);

/// Control message verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlVerb {
    Echo = 0x01,
    QosMeasurement = 0x02,
    PathNegotiationRequest = 0x03,
}

impl ControlVerb {
    pub fn from_raw(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Echo),
            0x02 => Ok(Self::QosMeasurement),
            0x03 => Ok(Self::PathNegotiationRequest),
            other => Err(ProtocolError::UnknownVerb(other)),
        }
    }
}

impl fmt::Display for ControlVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlVerb::Echo => "echo",
            ControlVerb::QosMeasurement => "qos",
            ControlVerb::PathNegotiationRequest => "path-negotiation",
        };
        f.write_str(name)
    }
}

/// One latency sample: which packet arrived and how long the receiver held it
/// before reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosRecord {
    pub packet_id: u64,
    pub holding_time: u16,
}

/// Decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Heartbeat on an otherwise idle path
    Echo,
    /// Latency samples for packets previously received on the path
    QosMeasurement(Vec<QosRecord>),
    /// Request that the receiver move its active path to the one this arrived on
    PathNegotiationRequest { utility: i16 },
}

impl ControlMessage {
    pub fn verb(&self) -> ControlVerb {
        match self {
            ControlMessage::Echo => ControlVerb::Echo,
            ControlMessage::QosMeasurement(_) => ControlVerb::QosMeasurement,
            ControlMessage::PathNegotiationRequest { .. } => ControlVerb::PathNegotiationRequest,
        }
    }

    /// Encode to bytes (network byte order)
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Echo => vec![ControlVerb::Echo as u8],
            ControlMessage::QosMeasurement(records) => {
                let count = records.len().min(QOS_TABLE_SIZE);
                let mut buf = Vec::with_capacity(1 + count * QOS_RECORD_SIZE);
                buf.push(ControlVerb::QosMeasurement as u8);
                for record in &records[..count] {
                    buf.extend_from_slice(&record.packet_id.to_be_bytes());
                    buf.extend_from_slice(&record.holding_time.to_be_bytes());
                }
                buf
            }
            ControlMessage::PathNegotiationRequest { utility } => {
                let mut buf = Vec::with_capacity(3);
                buf.push(ControlVerb::PathNegotiationRequest as u8);
                buf.extend_from_slice(&utility.to_be_bytes());
                buf
            }
        }
    }

    /// Decode from bytes (network byte order)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (&verb, body) = buf.split_first().ok_or(ProtocolError::InvalidLength {
            expected: 1,
            actual: 0,
        })?;

        match ControlVerb::from_raw(verb)? {
            ControlVerb::Echo => Ok(ControlMessage::Echo),
            ControlVerb::QosMeasurement => {
                if body.len() % QOS_RECORD_SIZE != 0 {
                    return Err(ProtocolError::TrailingBytes(body.len() % QOS_RECORD_SIZE));
                }
                let count = body.len() / QOS_RECORD_SIZE;
                if count > QOS_TABLE_SIZE {
                    return Err(ProtocolError::PayloadTooLarge(body.len()));
                }
                let records = body
                    .chunks_exact(QOS_RECORD_SIZE)
                    .map(|chunk| QosRecord {
                        packet_id: u64::from_be_bytes([
                            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6],
                            chunk[7],
                        ]),
                        holding_time: u16::from_be_bytes([chunk[8], chunk[9]]),
                    })
                    .collect();
                Ok(ControlMessage::QosMeasurement(records))
            }
            ControlVerb::PathNegotiationRequest => {
                if body.len() != 2 {
                    return Err(ProtocolError::InvalidLength {
                        expected: 3,
                        actual: buf.len(),
                    });
                }
                Ok(ControlMessage::PathNegotiationRequest {
                    utility: i16::from_be_bytes([body[0], body[1]]),
                })
            }
        }
    }
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown control verb: 0x{0:02X}")]
    UnknownVerb(u8),

    #[error("Invalid control message length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Trailing bytes after last QoS record: {0}")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_table_size() {
        assert_eq!(QOS_TABLE_SIZE, 140);
        assert!(QOS_TABLE_SIZE * QOS_RECORD_SIZE <= QOS_MAX_PACKET_SIZE);
    }

    #[test]
    fn test_negotiation_request_layout() {
        let msg = ControlMessage::PathNegotiationRequest { utility: -2 };
        let encoded = msg.encode();
        assert_eq!(encoded, vec![0x03, 0xFF, 0xFE]);
        let decoded = ControlMessage::decode(&encoded).expect("Failed to decode request");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_qos_measurement_layout() {
        let msg = ControlMessage::QosMeasurement(vec![
            QosRecord {
                packet_id: 0x0102030405060708,
                holding_time: 0x0A0B,
            },
            QosRecord {
                packet_id: 3,
                holding_time: 7,
            },
        ]);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 1 + 2 * QOS_RECORD_SIZE);
        assert_eq!(&encoded[1..11], &[1, 2, 3, 4, 5, 6, 7, 8, 0x0A, 0x0B]);

        let decoded = ControlMessage::decode(&encoded).expect("Failed to decode qos");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_qos_encode_truncates_to_table_size() {
        let records = (0..(QOS_TABLE_SIZE as u64 + 20))
            .map(|id| QosRecord {
                packet_id: id,
                holding_time: 0,
            })
            .collect();
        let encoded = ControlMessage::QosMeasurement(records).encode();
        assert_eq!(encoded.len(), 1 + QOS_TABLE_SIZE * QOS_RECORD_SIZE);
    }

    #[test]
    fn test_decode_rejects_oversized_qos() {
        let mut buf = vec![ControlVerb::QosMeasurement as u8];
        buf.resize(1 + (QOS_TABLE_SIZE + 1) * QOS_RECORD_SIZE, 0);
        let result = ControlMessage::decode(&buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_decode_rejects_partial_record() {
        let buf = vec![ControlVerb::QosMeasurement as u8, 0, 0, 0];
        let result = ControlMessage::decode(&buf);
        assert!(matches!(result, Err(ProtocolError::TrailingBytes(3))));
    }

    #[test]
    fn test_decode_unknown_verb_and_empty() {
        assert!(matches!(
            ControlMessage::decode(&[0x7F]),
            Err(ProtocolError::UnknownVerb(0x7F))
        ));
        assert!(matches!(
            ControlMessage::decode(&[]),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_decode_short_negotiation() {
        let result = ControlMessage::decode(&[0x03, 0x01]);
        assert!(matches!(result, Err(ProtocolError::InvalidLength { .. })));
    }
}
