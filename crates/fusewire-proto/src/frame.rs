// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and reply frames: a fixed header followed by concatenated arguments

use crate::abi::{InHeader, Opcode, OutHeader, IN_HEADER_SIZE, OUT_HEADER_SIZE};
use ssz::{Decode, Encode};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("frame length mismatch: header says {declared}, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("argument is not NUL-terminated")]
    Unterminated,
    #[error("SSZ decoding failed: {0}")]
    SszDecode(String),
}

impl From<ssz::DecodeError> for FrameError {
    fn from(err: ssz::DecodeError) -> Self {
        FrameError::SszDecode(format!("{err:?}"))
    }
}

/// Decodes a fixed-size struct from the front of `bytes`, returning the rest.
pub fn split_struct<T: Decode>(bytes: &[u8]) -> Result<(T, &[u8]), FrameError> {
    let need = <T as Decode>::ssz_fixed_len();
    if bytes.len() < need {
        return Err(FrameError::Truncated {
            need,
            got: bytes.len(),
        });
    }
    let (head, rest) = bytes.split_at(need);
    Ok((T::from_ssz_bytes(head)?, rest))
}

/// Decodes a fixed-size struct from a prefix, zero-extending short input.
///
/// Older daemons send truncated INIT and STATFS replies; the missing tail
/// fields read as zero.
pub fn decode_padded<T: Decode>(bytes: &[u8]) -> Result<T, FrameError> {
    let full = <T as Decode>::ssz_fixed_len();
    if bytes.len() > full {
        return Err(FrameError::LengthMismatch {
            declared: full,
            actual: bytes.len(),
        });
    }
    let mut buf = bytes.to_vec();
    buf.resize(full, 0);
    Ok(T::from_ssz_bytes(&buf)?)
}

/// A request as seen by the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: InHeader,
    pub body: Vec<u8>,
}

impl RequestFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (header, body) = split_struct::<InHeader>(bytes)?;
        if header.len as usize != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared: header.len as usize,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }

    pub fn opcode(&self) -> Result<Opcode, FrameError> {
        Opcode::try_from(self.header.opcode).map_err(FrameError::UnknownOpcode)
    }

    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Decodes the leading fixed argument and returns the remaining body.
    pub fn arg<T: Decode>(&self) -> Result<(T, &[u8]), FrameError> {
        split_struct(&self.body)
    }

    /// The body up to its first NUL, for name-carrying requests.
    pub fn name(&self) -> Result<&[u8], FrameError> {
        let end = self
            .body
            .iter()
            .position(|b| *b == 0)
            .ok_or(FrameError::Unterminated)?;
        Ok(&self.body[..end])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.len = (IN_HEADER_SIZE + self.body.len()) as u32;
        let mut out = header.as_ssz_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// A reply as written by the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyFrame {
    pub header: OutHeader,
    pub body: Vec<u8>,
}

impl ReplyFrame {
    pub fn ok(unique: u64, body: Vec<u8>) -> Self {
        let len = (OUT_HEADER_SIZE + body.len()) as u32;
        Self {
            header: OutHeader::new(unique, 0, len),
            body,
        }
    }

    pub fn ok_struct<T: Encode>(unique: u64, value: &T) -> Self {
        Self::ok(unique, value.as_ssz_bytes())
    }

    /// An error reply; these never carry a body.
    pub fn error(unique: u64, errno: i32) -> Self {
        Self {
            header: OutHeader::new(unique, errno, OUT_HEADER_SIZE as u32),
            body: Vec::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (header, body) = split_struct::<OutHeader>(bytes)?;
        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header.as_ssz_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ForgetIn, InitOut};

    #[test]
    fn request_frame_fills_length() {
        let frame = RequestFrame {
            header: InHeader {
                opcode: Opcode::Forget.into(),
                unique: 3,
                nodeid: 42,
                ..Default::default()
            },
            body: ForgetIn { nlookup: 5 }.as_ssz_bytes(),
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), IN_HEADER_SIZE + 8);

        let decoded = RequestFrame::decode(&bytes).expect("decode");
        assert_eq!(decoded.header.len as usize, bytes.len());
        assert_eq!(decoded.opcode(), Ok(Opcode::Forget));
        let (forget, rest) = decoded.arg::<ForgetIn>().expect("forget arg");
        assert_eq!(forget.nlookup, 5);
        assert!(rest.is_empty());
    }

    #[test]
    fn request_frame_rejects_wrong_length() {
        let mut bytes = RequestFrame {
            header: InHeader::default(),
            body: vec![1, 2, 3],
        }
        .encode();
        bytes.push(0);
        assert!(matches!(
            RequestFrame::decode(&bytes),
            Err(FrameError::LengthMismatch { .. })
        ));
        assert!(matches!(
            RequestFrame::decode(&bytes[..10]),
            Err(FrameError::Truncated { need: 40, got: 10 })
        ));
    }

    #[test]
    fn name_requires_terminator() {
        let frame = RequestFrame {
            header: InHeader::default(),
            body: b"hello\0".to_vec(),
        };
        assert_eq!(frame.name(), Ok(&b"hello"[..]));

        let frame = RequestFrame {
            header: InHeader::default(),
            body: b"hello".to_vec(),
        };
        assert_eq!(frame.name(), Err(FrameError::Unterminated));
    }

    #[test]
    fn padded_decode_zero_extends() {
        let mut short = 7u32.as_ssz_bytes();
        short.extend(2u32.as_ssz_bytes());
        let init: InitOut = decode_padded(&short).expect("decode");
        assert_eq!(init.major, 7);
        assert_eq!(init.minor, 2);
        assert_eq!(init.max_write, 0);

        let too_long = vec![0u8; 32];
        assert!(decode_padded::<InitOut>(&too_long).is_err());
    }

    #[test]
    fn error_reply_has_no_body() {
        let reply = ReplyFrame::error(11, -2);
        let bytes = reply.encode();
        assert_eq!(bytes.len(), OUT_HEADER_SIZE);
        let decoded = ReplyFrame::decode(&bytes).expect("decode");
        assert_eq!(decoded.header.errno(), -2);
        assert!(decoded.body.is_empty());
    }
}
