// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Header validation for frames crossing the kernel/daemon boundary

use crate::abi::{InHeader, Opcode, OutHeader, ERRNO_LIMIT, IN_HEADER_SIZE, OUT_HEADER_SIZE};
use thiserror::Error;

/// Validation error
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reply carries unique id 0")]
    ZeroUnique,
    #[error("reply error {0} outside (-1000, 0]")]
    ErrnoOutOfRange(i32),
    #[error("header length {declared} does not match {actual} bytes written")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("error reply carries a {0}-byte body")]
    ErrorWithBody(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
}

/// Checks a reply header against the number of bytes the daemon wrote.
pub fn validate_reply_header(header: &OutHeader, nbytes: usize) -> Result<(), ValidationError> {
    if header.unique == 0 {
        return Err(ValidationError::ZeroUnique);
    }
    let errno = header.errno();
    if errno > 0 || errno <= -ERRNO_LIMIT {
        return Err(ValidationError::ErrnoOutOfRange(errno));
    }
    if header.len as usize != nbytes {
        return Err(ValidationError::LengthMismatch {
            declared: header.len as usize,
            actual: nbytes,
        });
    }
    if errno != 0 && nbytes != OUT_HEADER_SIZE {
        return Err(ValidationError::ErrorWithBody(nbytes - OUT_HEADER_SIZE));
    }
    Ok(())
}

/// Checks a request header as read by the daemon.
pub fn validate_request_header(header: &InHeader, nbytes: usize) -> Result<Opcode, ValidationError> {
    if header.len as usize != nbytes || nbytes < IN_HEADER_SIZE {
        return Err(ValidationError::LengthMismatch {
            declared: header.len as usize,
            actual: nbytes,
        });
    }
    Opcode::try_from(header.opcode).map_err(ValidationError::UnknownOpcode)
}
