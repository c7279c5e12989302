// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the fusewire core

use std::io;

/// Core error type
///
/// `Daemon` is the normal channel for "the filesystem said no"; every other
/// variant is raised locally.
#[derive(thiserror::Error, Debug)]
pub enum FuseError {
    #[error("daemon returned errno {0}")]
    Daemon(i32),
    #[error("not connected")]
    NotConnected,
    #[error("connection refused by daemon")]
    ConnectionRefused,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("interrupted")]
    Interrupted,
    #[error("transport fault: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid mount options: {0}")]
    InvalidOptions(String),
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such request {0}")]
    UnknownRequest(u64),
    #[error("operation would block")]
    WouldBlock,
    #[error("no such device")]
    NoDevice,
    #[error("permission denied")]
    PermissionDenied,
    #[error("access denied")]
    AccessDenied,
    #[error("bad inode")]
    BadInode,
    #[error("name too long")]
    NameTooLong,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotDirectory,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FuseError {
    /// The negative errno a VFS caller would observe.
    pub fn errno(&self) -> i32 {
        let code = match self {
            FuseError::Daemon(errno) => return *errno,
            FuseError::NotConnected => libc::ENOTCONN,
            FuseError::ConnectionRefused => libc::ECONNREFUSED,
            FuseError::ConnectionAborted => libc::ECONNABORTED,
            FuseError::Interrupted => libc::EINTR,
            FuseError::Transport(_) => libc::EIO,
            FuseError::ProtocolViolation(_) => libc::EIO,
            FuseError::InvalidOptions(_) => libc::EINVAL,
            FuseError::InvalidConfig(_) => libc::EINVAL,
            FuseError::InvalidArgument => libc::EINVAL,
            FuseError::UnknownRequest(_) => libc::ENOENT,
            FuseError::WouldBlock => libc::EAGAIN,
            FuseError::NoDevice => libc::ENODEV,
            FuseError::PermissionDenied => libc::EPERM,
            FuseError::AccessDenied => libc::EACCES,
            FuseError::BadInode => libc::EIO,
            FuseError::NameTooLong => libc::ENAMETOOLONG,
            FuseError::IsDirectory => libc::EISDIR,
            FuseError::NotDirectory => libc::ENOTDIR,
            FuseError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        };
        -code
    }

    /// True for faults raised locally rather than reported by the daemon.
    pub fn is_local_fault(&self) -> bool {
        !matches!(self, FuseError::Daemon(_))
    }
}

pub type FuseResult<T> = Result<T, FuseError>;

/// Locally synthesized completion of a request that got no usable reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalFault {
    NotConnected,
    ConnectionRefused,
    Aborted,
    Interrupted,
    Transport,
    ProtocolViolation,
}

impl From<LocalFault> for FuseError {
    fn from(fault: LocalFault) -> Self {
        match fault {
            LocalFault::NotConnected => FuseError::NotConnected,
            LocalFault::ConnectionRefused => FuseError::ConnectionRefused,
            LocalFault::Aborted => FuseError::ConnectionAborted,
            LocalFault::Interrupted => FuseError::Interrupted,
            LocalFault::Transport => FuseError::Transport("request copy failed".into()),
            LocalFault::ProtocolViolation => {
                FuseError::ProtocolViolation("malformed reply".into())
            }
        }
    }
}
