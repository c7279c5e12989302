// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection tunables

use crate::error::{FuseError, FuseResult};
use crate::fault::FaultPolicy;
use serde::{Deserialize, Serialize};

/// Largest request pool a connection preallocates.
pub const MAX_OUTSTANDING_LIMIT: usize = 4096;

/// Limits and defaults applied to every connection created by a mount.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Size of the preallocated request pool, which is also the admission limit.
    pub max_outstanding: usize,
    /// Upper bound on pages attached to a single READ or WRITE.
    pub max_pages_per_request: usize,
    /// Longest name accepted by LOOKUP.
    pub name_max: usize,
    pub page_size: usize,
    /// Readahead offered to the daemon in INIT.
    pub max_readahead: u32,
    /// Read size used when the mount sets `large_read`.
    pub large_read_chunk: usize,
    pub faults: FaultPolicy,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 10,
            max_pages_per_request: 32,
            name_max: 1024,
            page_size: 4096,
            max_readahead: 128 * 1024,
            large_read_chunk: 64 * 1024,
            faults: FaultPolicy::default(),
        }
    }
}

impl ConnConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Rejects tunables that would stall a connection or turn its I/O into
    /// zero-byte transfers.
    pub fn validate(&self) -> FuseResult<()> {
        let invalid = |msg: String| Err(FuseError::InvalidConfig(msg));
        if self.max_outstanding == 0 || self.max_outstanding > MAX_OUTSTANDING_LIMIT {
            return invalid(format!(
                "max_outstanding must be between 1 and {MAX_OUTSTANDING_LIMIT}, got {}",
                self.max_outstanding
            ));
        }
        for (name, value) in [
            ("max_pages_per_request", self.max_pages_per_request),
            ("page_size", self.page_size),
            ("name_max", self.name_max),
            ("large_read_chunk", self.large_read_chunk),
        ] {
            if value == 0 {
                return invalid(format!("{name} must not be zero"));
            }
        }
        if self.max_pages_per_request.checked_mul(self.page_size).is_none() {
            return invalid("max_pages_per_request * page_size overflows".into());
        }
        Ok(())
    }

    /// Byte limit of one page-backed argument.
    pub fn max_request_bytes(&self) -> usize {
        self.max_pages_per_request * self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ConnConfig::from_json_bytes(br#"{ "max_outstanding": 2 }"#).expect("config");
        assert_eq!(config.max_outstanding, 2);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.max_request_bytes(), 32 * 4096);
        assert!(!config.faults.enabled);
        config.validate().expect("valid");
    }

    #[test]
    fn zero_sized_limits_are_rejected() {
        assert!(ConnConfig::default().validate().is_ok());
        let cases: [fn(&mut ConnConfig); 6] = [
            |c| c.max_outstanding = 0,
            |c| c.max_outstanding = MAX_OUTSTANDING_LIMIT + 1,
            |c| c.page_size = 0,
            |c| c.max_pages_per_request = 0,
            |c| c.large_read_chunk = 0,
            |c| c.max_pages_per_request = usize::MAX,
        ];
        for mutate in cases {
            let mut config = ConnConfig::default();
            mutate(&mut config);
            let err = config.validate().expect_err("must be rejected");
            assert!(matches!(err, FuseError::InvalidConfig(_)), "{config:?}");
            assert_eq!(err.errno(), -libc::EINVAL);
        }
        let config = ConnConfig::from_json_bytes(br#"{ "page_size": 0 }"#).expect("parses");
        let err = config.validate().expect_err("zero page size");
        assert!(err.to_string().contains("page_size"));
    }
}
