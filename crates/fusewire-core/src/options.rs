// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount option string parsing
//!
//! The option string is a comma-separated list of `key=value` pairs and bare
//! flags. Parsing fails closed: an unknown key rejects the whole string.

use crate::error::{FuseError, FuseResult};
use crate::inode::FileKind;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Behavior toggles consumed by the VFS-facing adapters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MountFlags {
    pub default_permissions: bool,
    pub allow_other: bool,
    pub large_read: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MountOptions {
    /// Descriptor number of the daemon's device.
    pub fd: u32,
    pub rootmode: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub flags: MountFlags,
    /// `u32::MAX` when unlimited.
    pub max_read: u32,
}

impl MountOptions {
    pub fn parse(input: &str) -> FuseResult<Self> {
        let mut fd = None;
        let mut rootmode = None;
        let mut user_id = None;
        let mut group_id = None;
        let mut flags = MountFlags::default();
        let mut max_read = u32::MAX;

        for token in input.split(',').filter(|token| !token.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };
            match key {
                "fd" => fd = Some(decimal(key, value)?),
                "rootmode" => rootmode = Some(octal(key, value)?),
                "user_id" => user_id = Some(decimal(key, value)?),
                "group_id" => group_id = Some(decimal(key, value)?),
                "max_read" => max_read = decimal(key, value)?,
                "default_permissions" => flags.default_permissions = bare(key, value)?,
                "allow_other" => flags.allow_other = bare(key, value)?,
                "large_read" => flags.large_read = bare(key, value)?,
                other => {
                    return Err(FuseError::InvalidOptions(format!("unknown option '{other}'")))
                }
            }
        }

        let rootmode = required("rootmode", rootmode)?;
        if FileKind::from_mode(rootmode).is_none() {
            return Err(FuseError::InvalidOptions(format!(
                "rootmode {rootmode:o} has no file type"
            )));
        }
        Ok(Self {
            fd: required("fd", fd)?,
            rootmode,
            user_id: required("user_id", user_id)?,
            group_id: required("group_id", group_id)?,
            flags,
            max_read,
        })
    }
}

fn required(key: &str, value: Option<u32>) -> FuseResult<u32> {
    value.ok_or_else(|| FuseError::InvalidOptions(format!("missing required option '{key}'")))
}

fn decimal(key: &str, value: Option<&str>) -> FuseResult<u32> {
    value
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| FuseError::InvalidOptions(format!("'{key}' takes a decimal value")))
}

fn octal(key: &str, value: Option<&str>) -> FuseResult<u32> {
    value
        .and_then(|v| u32::from_str_radix(v, 8).ok())
        .ok_or_else(|| FuseError::InvalidOptions(format!("'{key}' takes an octal value")))
}

fn bare(key: &str, value: Option<&str>) -> FuseResult<bool> {
    match value {
        None => Ok(true),
        Some(_) => Err(FuseError::InvalidOptions(format!("'{key}' takes no value"))),
    }
}

impl FromStr for MountOptions {
    type Err = FuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The form shown in the mount table.
impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user_id={},group_id={}", self.user_id, self.group_id)?;
        if self.flags.default_permissions {
            f.write_str(",default_permissions")?;
        }
        if self.flags.allow_other {
            f.write_str(",allow_other")?;
        }
        if self.flags.large_read {
            f.write_str(",large_read")?;
        }
        if self.max_read != u32::MAX {
            write!(f, ",max_read={}", self.max_read)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_set() {
        let opts = MountOptions::parse("fd=7,rootmode=040755,user_id=0,group_id=0").expect("parse");
        assert_eq!(opts.fd, 7);
        assert_eq!(opts.rootmode, 0o40755);
        assert_eq!(opts.max_read, u32::MAX);
        assert_eq!(opts.flags, MountFlags::default());
    }

    #[test]
    fn missing_credentials_fail() {
        let err = MountOptions::parse("fd=7,rootmode=040755").expect_err("must fail");
        assert!(matches!(err, FuseError::InvalidOptions(msg) if msg.contains("user_id")));
    }

    #[test]
    fn unknown_key_fails_closed() {
        let err = MountOptions::parse("fd=7,rootmode=040755,user_id=0,group_id=0,nosuid")
            .expect_err("must fail");
        assert!(matches!(err, FuseError::InvalidOptions(msg) if msg.contains("nosuid")));
    }

    #[test]
    fn value_shapes_are_checked() {
        for bad in [
            "fd=x,rootmode=040755,user_id=0,group_id=0",
            "fd=7,rootmode=0999,user_id=0,group_id=0",
            "fd=7,rootmode=040755,user_id=0,group_id=0,allow_other=1",
            "fd,rootmode=040755,user_id=0,group_id=0",
            "fd=7,rootmode=0755,user_id=0,group_id=0",
        ] {
            assert!(
                matches!(MountOptions::parse(bad), Err(FuseError::InvalidOptions(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn display_shows_flags_and_limited_max_read() {
        let opts: MountOptions =
            "fd=3,,rootmode=0100644,user_id=1000,group_id=100,allow_other,large_read,max_read=8192"
                .parse()
                .expect("parse");
        assert_eq!(
            opts.to_string(),
            "user_id=1000,group_id=100,allow_other,large_read,max_read=8192"
        );

        let plain = MountOptions::parse("fd=3,rootmode=040700,user_id=5,group_id=6,default_permissions")
            .expect("parse");
        assert_eq!(plain.to_string(), "user_id=5,group_id=6,default_permissions");
    }
}
