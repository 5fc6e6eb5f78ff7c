// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! troupe – orchestrates a team of LLM agents through a structured
//! engineering lifecycle: refinement, planning, layered implementation in
//! isolated worktrees, and code review with supervised merges.
//!
//! This crate is the supervisor layer: it wires the member crates
//! together, drives sessions, persists their event streams, and exposes
//! the operations a CLI or TUI front end needs.

pub mod groom;
pub mod session;
pub mod supervisor;

pub use session::{persist_event, SessionSetupError};
pub use supervisor::{SessionOutcome, Workspace};

pub use troupe_config as config;
pub use troupe_core as core;
pub use troupe_model as model;
pub use troupe_store as store;
pub use troupe_tools as tools;
pub use troupe_vcs as vcs;
