use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::HEADER_SIZE;

/// Reasons an inbound frame is rejected. Every variant is fatal to the
/// connection that received the frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    BadMagic,
    PayloadTooLarge,
    ChecksumMismatch,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::BadMagic => write!(f, "invalid frame magic"),
            FrameError::PayloadTooLarge => write!(f, "frame payload exceeds limit"),
            FrameError::ChecksumMismatch => write!(f, "frame checksum mismatch"),
        }
    }
}

/// The six u32 fields of a frame header, in wire order.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_check: u32,
    pub magic: u32,
}

impl MessageHeader {
    #[inline]
    pub fn new(command: u32, arg0: u32, arg1: u32) -> MessageHeader {
        MessageHeader {
            command,
            arg0,
            arg1,
            data_length: 0,
            data_check: 0,
            magic: 0,
        }
    }

    /// Decodes a header from its 24 wire bytes.
    pub fn decode(buf: &[u8]) -> MessageHeader {
        MessageHeader {
            command: LittleEndian::read_u32(&buf[0..4]),
            arg0: LittleEndian::read_u32(&buf[4..8]),
            arg1: LittleEndian::read_u32(&buf[8..12]),
            data_length: LittleEndian::read_u32(&buf[12..16]),
            data_check: LittleEndian::read_u32(&buf[16..20]),
            magic: LittleEndian::read_u32(&buf[20..24]),
        }
    }

    /// Encodes the header into its 24 wire bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.command);
        LittleEndian::write_u32(&mut buf[4..8], self.arg0);
        LittleEndian::write_u32(&mut buf[8..12], self.arg1);
        LittleEndian::write_u32(&mut buf[12..16], self.data_length);
        LittleEndian::write_u32(&mut buf[16..20], self.data_check);
        LittleEndian::write_u32(&mut buf[20..24], self.magic);
    }

    /// Stamps the derived fields before transmission: payload length,
    /// payload checksum and the magic self-check.
    pub fn seal(&mut self, payload: &[u8]) {
        self.data_length = payload.len() as u32;
        self.data_check = checksum(payload);
        self.magic = self.command ^ 0xffff_ffff;
    }

    /// Validates the header against the negotiated payload limit. The caller
    /// passes the handshake-class limit until the connection is established
    /// and the stream-class limit afterwards.
    pub fn check(&self, max_payload: usize) -> Result<(), FrameError> {
        self.check_magic()?;

        if self.data_length as usize > max_payload {
            return Err(FrameError::PayloadTooLarge);
        }

        Ok(())
    }

    /// Validates the payload checksum once the full frame is assembled.
    pub fn check_data(&self, payload: &[u8]) -> Result<(), FrameError> {
        if checksum(payload) != self.data_check {
            return Err(FrameError::ChecksumMismatch);
        }

        Ok(())
    }

    #[inline]
    fn check_magic(&self) -> Result<(), FrameError> {
        if self.magic != self.command ^ 0xffff_ffff {
            return Err(FrameError::BadMagic);
        }

        Ok(())
    }
}

/// Arithmetic sum of the payload bytes mod 2^32. Of no cryptographic value,
/// but required for compatibility with stock ADB hosts.
#[inline]
pub fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}
