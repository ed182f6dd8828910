//! One-shot service reply payloads. Success is `OKAY`, optionally followed
//! by a four hex digit length and the data; failure is `FAIL` plus the
//! length-prefixed diagnostic message.

use std::cmp::min;

const STATUS_HEADER: usize = 8;

/// Writes `FAIL%04x<message>` into `buf`, truncating the message to fit.
/// Returns the number of bytes written.
pub fn write_fail(buf: &mut [u8], message: &str) -> usize {
    let room = buf.len().saturating_sub(STATUS_HEADER);
    let len = min(message.len(), room);

    let header = format!("FAIL{:04x}", len);
    buf[..STATUS_HEADER].copy_from_slice(header.as_bytes());
    buf[STATUS_HEADER..STATUS_HEADER + len].copy_from_slice(&message.as_bytes()[..len]);

    STATUS_HEADER + len
}

/// Writes a bare `OKAY` into `buf`. Returns the number of bytes written.
pub fn write_okay(buf: &mut [u8]) -> usize {
    buf[..4].copy_from_slice(b"OKAY");
    4
}

/// Writes `OKAY%04x<data>` into `buf`. The data must fit; one-shot replies
/// that can exceed a packet go through a draining service instead.
pub fn write_okay_payload(buf: &mut [u8], data: &str) -> usize {
    let header = format!("OKAY{:04x}", data.len());
    buf[..STATUS_HEADER].copy_from_slice(header.as_bytes());
    buf[STATUS_HEADER..STATUS_HEADER + data.len()].copy_from_slice(data.as_bytes());

    STATUS_HEADER + data.len()
}

/// Writes the bare `%04x` length header used by list replies.
pub fn write_length_header(buf: &mut [u8], len: usize) -> usize {
    let header = format!("{:04x}", len);
    buf[..4].copy_from_slice(header.as_bytes());
    4
}
