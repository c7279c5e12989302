// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! fusewire protocol: wire types and validation
//!
//! This crate defines the SSZ layouts of request and reply frames exchanged
//! between the kernel-side connection and a userspace filesystem daemon.

pub mod abi;
pub mod frame;
pub mod validation;

// Re-export key types
pub use abi::{
    Attr, AttrOut, EntryOut, ForgetIn, InHeader, InitIn, InitOut, Kstatfs, OpenIn, OpenOut,
    Opcode, OutHeader, ReadIn, ReleaseIn, StatfsOut, WriteIn, WriteOut,
};
pub use frame::{decode_padded, split_struct, FrameError, ReplyFrame, RequestFrame};
pub use validation::*;
