//! Snapshot message framing
//!
//! Splits a compressed snapshot payload into SNAP parts small enough for one
//! datagram, and validates inbound datagram sizes.

use crate::game::constants::net::MAX_DATAGRAM_SIZE;
use crate::game::constants::snapshot::MAX_PACK_SIZE;
use crate::net::protocol::{ServerMessage, Tick};

/// Errors that can occur during framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("Snapshot payload needs {0} parts")]
    TooManyParts(usize),
}

/// Header of one snapshot send
#[derive(Debug, Clone, Copy)]
pub struct SnapHeader {
    pub tick: Tick,
    /// Distance to the baseline tick, `tick + 1` when there is none
    pub delta_tick: Tick,
    pub crc: u32,
}

/// Build the messages for a compressed snapshot delta. Payloads that fit in
/// one part become a single SNAPSINGLE, larger ones are split into SNAP parts.
pub fn frame_snapshot(header: SnapHeader, payload: &[u8]) -> Result<Vec<ServerMessage>, FramingError> {
    frame_snapshot_with(header, payload, MAX_PACK_SIZE)
}

pub fn frame_snapshot_with(
    header: SnapHeader,
    payload: &[u8],
    part_size: usize,
) -> Result<Vec<ServerMessage>, FramingError> {
    let num_parts = payload.len().div_ceil(part_size).max(1);
    if num_parts == 1 {
        return Ok(vec![ServerMessage::SnapSingle {
            tick: header.tick,
            delta_tick: header.delta_tick,
            crc: header.crc,
            data: payload.to_vec(),
        }]);
    }

    let total = u16::try_from(num_parts).map_err(|_| FramingError::TooManyParts(num_parts))?;
    Ok(payload
        .chunks(part_size)
        .enumerate()
        .map(|(part, data)| ServerMessage::Snap {
            tick: header.tick,
            delta_tick: header.delta_tick,
            num_parts: total,
            part: part as u16,
            crc: header.crc,
            data: data.to_vec(),
        })
        .collect())
}

/// Reject datagrams over the transport limit before decoding
pub fn check_datagram_size(len: usize) -> Result<(), FramingError> {
    if len > MAX_DATAGRAM_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_DATAGRAM_SIZE));
    }
    Ok(())
}
