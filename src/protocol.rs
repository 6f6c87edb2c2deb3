//! Wire codec for the shared-canvas protocol.
//!
//! Two encodings live here:
//!
//! ```text
//! Snapshot (binary, raster order, 2 cells per byte):
//! ┌─────────────┬─────────────┬──
//! │ hi │ lo     │ hi │ lo     │ …     ceil(size²/2) bytes total
//! │ cell0 cell1 │ cell2 cell3 │
//! └─────────────┴─────────────┴──
//!
//! Delta / control frames (JSON text, one object per WebSocket frame):
//!   inbound   {"type":"update","x":…,"y":…,"color":…,"timestamp":…}
//!             {"type":"configuration","quadrants":[…],"connectedClients":…}
//!             {"type":"clientCount","count":…}
//!   outbound  {"type":"Subscribe","payload":{"quadrant_id":…}}
//! ```
//!
//! Everything in this module is pure; connection state lives in
//! [`crate::connection`], grid state in [`crate::grid`].

use serde::{Deserialize, Serialize};

/// Index into the session palette. Valid range is `0..palette.len()`,
/// at most 16 since a cell packs into one nibble on the wire.
pub type ColorIndex = u8;

/// A single authoritative cell change, as broadcast by the server.
///
/// `timestamp` is server-assigned epoch milliseconds and is the ordering
/// key used to drop stale or duplicate deliveries. It is not unique per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub x: u16,
    pub y: u16,
    pub color: ColorIndex,
    pub timestamp: i64,
}

/// A server-defined rectangular partition of the grid, used only as a
/// subscription granularity. `(x, y)` is its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quadrant {
    pub id: u32,
    pub x: u16,
    pub y: u16,
}

/// Inbound frame from the realtime channel.
///
/// Unrecognized `type` tags decode to [`ServerFrame::Unknown`] so that newer
/// servers can add frame kinds without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "update")]
    Update(CellUpdate),
    #[serde(rename = "configuration")]
    Configuration {
        quadrants: Vec<Quadrant>,
        #[serde(rename = "connectedClients")]
        connected_clients: u32,
    },
    #[serde(rename = "clientCount")]
    ClientCount { count: u32 },
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Decode one JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Outbound control frame. The `Activity` keepalive lets the server track
/// client liveness independently of draw traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    Subscribe { quadrant_id: u32 },
    Unsubscribe { quadrant_id: u32 },
    Activity,
}

impl ClientFrame {
    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Body of the HTTP draw request. No range validation happens here;
/// the caller checks the color index against its palette first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRequest {
    pub x: u16,
    pub y: u16,
    pub color: ColorIndex,
}

/// Number of bytes a packed snapshot of a `size × size` grid occupies.
pub fn snapshot_len(size: usize) -> usize {
    (size * size).div_ceil(2)
}

/// Unpack a 4-bit-packed snapshot into one color index per cell.
///
/// The high nibble of each byte is the earlier cell in raster order.
/// Fails if the buffer length is not exactly `ceil(size²/2)`; a short or
/// long buffer is never partially applied.
pub fn decode_snapshot(bytes: &[u8], size: usize) -> Result<Vec<ColorIndex>, ProtocolError> {
    let expected = snapshot_len(size);
    if bytes.len() != expected {
        return Err(ProtocolError::MalformedSnapshot {
            expected,
            actual: bytes.len(),
        });
    }

    let total = size * size;
    let mut cells = Vec::with_capacity(total);
    for idx in 0..total {
        let byte = bytes[idx / 2];
        let color = if idx % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        cells.push(color);
    }
    Ok(cells)
}

/// Pack cells into the 4-bit snapshot encoding, the inverse of
/// [`decode_snapshot`]. Indices above 15 are masked to their low nibble.
pub fn encode_snapshot(cells: &[ColorIndex]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cells.len().div_ceil(2));
    for pair in cells.chunks(2) {
        let hi = pair[0] & 0x0F;
        let lo = if pair.len() == 2 { pair[1] & 0x0F } else { 0 };
        bytes.push((hi << 4) | lo);
    }
    bytes
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Snapshot buffer length does not match the grid dimensions.
    MalformedSnapshot { expected: usize, actual: usize },
    /// A frame could not be parsed. The frame is dropped, not the connection.
    Decode(String),
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedSnapshot { expected, actual } => {
                write!(f, "Malformed snapshot: expected {expected} bytes, got {actual}")
            }
            Self::Decode(e) => write!(f, "Frame decode error: {e}"),
            Self::Encode(e) => write!(f, "Frame encode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let cells: Vec<u8> = (0..16u8).cycle().take(100).collect();
        let packed = encode_snapshot(&cells);
        assert_eq!(packed.len(), snapshot_len(10));
        let unpacked = decode_snapshot(&packed, 10).unwrap();
        assert_eq!(unpacked, cells);
    }

    #[test]
    fn test_snapshot_nibble_order() {
        // High nibble is the earlier cell: 0x12 0x34 → first row 1,2,3,4.
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let cells = decode_snapshot(&bytes, 4).unwrap();
        assert_eq!(&cells[..4], &[1, 2, 3, 4]);
        assert_eq!(cells[15], 0);
    }

    #[test]
    fn test_snapshot_length_mismatch() {
        let err = decode_snapshot(&[0u8; 7], 4).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MalformedSnapshot {
                expected: 8,
                actual: 7
            }
        );
        assert!(decode_snapshot(&[0u8; 9], 4).is_err());
    }

    #[test]
    fn test_snapshot_odd_cell_count() {
        // 3×3 grid: 9 cells pack into 5 bytes, last low nibble padded.
        let cells = vec![15u8; 9];
        let packed = encode_snapshot(&cells);
        assert_eq!(packed.len(), 5);
        assert_eq!(packed[4], 0xF0);
        assert_eq!(decode_snapshot(&packed, 3).unwrap(), cells);
    }

    #[test]
    fn test_decode_update_frame() {
        let frame =
            ServerFrame::decode(r#"{"type":"update","x":3,"y":7,"color":9,"timestamp":1700000000123}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Update(CellUpdate {
                x: 3,
                y: 7,
                color: 9,
                timestamp: 1_700_000_000_123,
            })
        );
    }

    #[test]
    fn test_decode_configuration_frame() {
        let frame = ServerFrame::decode(
            r#"{"type":"configuration","quadrants":[{"id":0,"x":0,"y":0},{"id":1,"x":50,"y":0}],"connectedClients":12}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Configuration {
                quadrants,
                connected_clients,
            } => {
                assert_eq!(quadrants.len(), 2);
                assert_eq!(quadrants[1], Quadrant { id: 1, x: 50, y: 0 });
                assert_eq!(connected_clients, 12);
            }
            other => panic!("Expected configuration, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_client_count_frame() {
        let frame = ServerFrame::decode(r#"{"type":"clientCount","count":42}"#).unwrap();
        assert_eq!(frame, ServerFrame::ClientCount { count: 42 });
    }

    #[test]
    fn test_unknown_frame_kind_is_tolerated() {
        let frame = ServerFrame::decode(r#"{"type":"announcement","text":"maintenance"}"#).unwrap();
        assert_eq!(frame, ServerFrame::Unknown);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(
            ServerFrame::decode("not json"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let text = ClientFrame::Subscribe { quadrant_id: 3 }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "Subscribe");
        assert_eq!(value["payload"]["quadrant_id"], 3);

        let text = ClientFrame::Unsubscribe { quadrant_id: 9 }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "Unsubscribe");
        assert_eq!(value["payload"]["quadrant_id"], 9);
    }

    #[test]
    fn test_activity_frame_shape() {
        let text = ClientFrame::Activity.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "Activity");
    }

    #[test]
    fn test_draw_request_body() {
        let body = serde_json::to_string(&DrawRequest { x: 10, y: 20, color: 5 }).unwrap();
        assert_eq!(body, r#"{"x":10,"y":20,"color":5}"#);
    }
}
