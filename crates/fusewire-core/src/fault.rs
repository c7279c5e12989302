// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Injected failures on the device copy paths
//!
//! Rules come from [`ConnConfig::faults`](crate::ConnConfig) and live as long
//! as the connection. Each rule counts the copies of its kind, lets the first
//! `start_after` through, then fails up to `max_faults` of the rest.

use crate::{lock, FuseError};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Mutex;

/// Which copy across the device boundary a rule targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    /// Request frame out to the daemon's buffer.
    DeviceRead,
    /// Reply frame in from the daemon's buffer.
    DeviceWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    /// A copy that touched a bad daemon buffer.
    Efault,
}

impl FaultErrno {
    fn to_error(self) -> FuseError {
        match self {
            FaultErrno::Eio => FuseError::Io(io::Error::from_raw_os_error(libc::EIO)),
            FaultErrno::Efault => FuseError::Transport("bad user buffer".into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Copies of `op` that pass before the rule starts failing them.
    #[serde(default)]
    pub start_after: u64,
    /// Failures after which the rule goes quiet; unlimited when unset.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl Default for FaultRule {
    fn default() -> Self {
        Self {
            op: FaultOp::DeviceRead,
            errno: FaultErrno::Eio,
            start_after: 0,
            max_faults: None,
        }
    }
}

/// The `faults` section of a connection config. Rules are tried in order and
/// the first one that fires decides the error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.rules.is_empty()
    }
}

#[derive(Debug)]
struct ArmedRule {
    rule: FaultRule,
    seen: u64,
    injected: u64,
}

impl ArmedRule {
    fn fire(&mut self) -> bool {
        self.seen = self.seen.saturating_add(1);
        if self.seen <= self.rule.start_after {
            return false;
        }
        if self.rule.max_faults.is_some_and(|max| self.injected >= max) {
            return false;
        }
        self.injected += 1;
        true
    }
}

/// Per-connection fault state, consulted by the device on every copy.
#[derive(Debug, Default)]
pub struct FaultInjector {
    rules: Mutex<Vec<ArmedRule>>,
}

impl FaultInjector {
    /// An inactive policy arms nothing.
    pub fn new(policy: FaultPolicy) -> Self {
        let rules = if policy.is_active() {
            policy
                .rules
                .into_iter()
                .map(|rule| ArmedRule {
                    rule,
                    seen: 0,
                    injected: 0,
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            rules: Mutex::new(rules),
        }
    }

    /// The error to fail this copy with, if any rule fires.
    pub fn check(&self, op: FaultOp) -> Option<FuseError> {
        let mut rules = lock(&self.rules);
        rules
            .iter_mut()
            .filter(|armed| armed.rule.op == op)
            .find_map(|armed| armed.fire().then(|| armed.rule.errno.to_error()))
    }

    /// Failures injected so far, across all rules.
    pub fn injected(&self) -> u64 {
        lock(&self.rules).iter().map(|armed| armed.injected).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(op: FaultOp, start_after: u64, max_faults: Option<u64>) -> FaultRule {
        FaultRule {
            op,
            errno: FaultErrno::Eio,
            start_after,
            max_faults,
        }
    }

    #[test]
    fn policy_reads_from_config_json() {
        let json = br#"{ "enabled": true, "rules": [ { "op": "device_write", "errno": "efault", "max_faults": 2 } ] }"#;
        let policy: FaultPolicy = serde_json::from_slice(json).expect("policy");
        assert!(policy.is_active());
        assert_eq!(policy.rules[0].op, FaultOp::DeviceWrite);
        assert_eq!(policy.rules[0].start_after, 0);
        assert_eq!(policy.rules[0].max_faults, Some(2));
    }

    #[test]
    fn rule_skips_then_fails_until_spent() {
        let injector = FaultInjector::new(FaultPolicy {
            enabled: true,
            rules: vec![rule(FaultOp::DeviceRead, 1, Some(2))],
        });
        let fired: Vec<bool> = (0..4)
            .map(|_| injector.check(FaultOp::DeviceRead).is_some())
            .collect();
        assert_eq!(fired, [false, true, true, false]);
        // Replies are not counted against a read rule.
        assert!(injector.check(FaultOp::DeviceWrite).is_none());
        assert_eq!(injector.injected(), 2);
    }

    #[test]
    fn first_matching_rule_decides_the_error() {
        let mut efault = rule(FaultOp::DeviceWrite, 0, Some(1));
        efault.errno = FaultErrno::Efault;
        let injector = FaultInjector::new(FaultPolicy {
            enabled: true,
            rules: vec![efault, rule(FaultOp::DeviceWrite, 0, None)],
        });
        assert!(matches!(
            injector.check(FaultOp::DeviceWrite),
            Some(FuseError::Transport(_))
        ));
        let err = injector.check(FaultOp::DeviceWrite).expect("second rule");
        assert_eq!(err.errno(), -libc::EIO);
    }

    #[test]
    fn disabled_policy_arms_nothing() {
        let injector = FaultInjector::new(FaultPolicy {
            enabled: false,
            rules: vec![FaultRule::default()],
        });
        assert!(injector.check(FaultOp::DeviceRead).is_none());
        assert_eq!(injector.injected(), 0);
    }
}
