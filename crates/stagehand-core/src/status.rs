// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status codes for stage executions and split coordination.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a stage execution, serialized as a single-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatusUid {
    /// Row created, never executed (`I`).
    #[default]
    #[serde(rename = "I")]
    Initial,
    /// Waiting for children to report back (`W`).
    #[serde(rename = "W")]
    Waiting,
    /// Handed off to an asynchronous collaborator (`A`).
    #[serde(rename = "A")]
    Async,
    /// Business logic currently running (`P`).
    #[serde(rename = "P")]
    Process,
    /// Finished successfully (`D`).
    #[serde(rename = "D")]
    Done,
    /// Failed in a retryable way (`E`).
    #[serde(rename = "E")]
    Error,
    /// Failed in an expected, terminal way (`F`).
    #[serde(rename = "F")]
    Failed,
    /// Failed in an unexpected, terminal way (`U`).
    #[serde(rename = "U")]
    Unknown,
}

impl StatusUid {
    /// Single-letter wire code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "I",
            Self::Waiting => "W",
            Self::Async => "A",
            Self::Process => "P",
            Self::Done => "D",
            Self::Error => "E",
            Self::Failed => "F",
            Self::Unknown => "U",
        }
    }

    /// Parse a single-letter code. Unrecognized codes yield `None`.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Initial),
            "W" => Some(Self::Waiting),
            "A" => Some(Self::Async),
            "P" => Some(Self::Process),
            "D" => Some(Self::Done),
            "E" => Some(Self::Error),
            "F" => Some(Self::Failed),
            "U" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the status ends an attempt (DONE, ERROR, FAILED, UNKNOWN).
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Failed | Self::Unknown)
    }

    /// Whether the status is a failure that gets recorded in the error list.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Failed | Self::Unknown)
    }

    /// ERROR is retryable by convention; FAILED and UNKNOWN are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error)
    }

    /// Rows in FAILED or UNKNOWN state are never resumed.
    pub fn is_reusable(&self) -> bool {
        !matches!(self, Self::Failed | Self::Unknown)
    }
}

impl fmt::Display for StatusUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a split coordination, stored under the `status` coordination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPhase {
    /// Fan-out has not happened yet.
    Starting,
    /// Children were triggered, fan-in pending.
    Waiting,
    /// Every child finished DONE.
    Done,
    /// At least one child did not finish DONE.
    Failed,
}

impl ChildPhase {
    /// Returns the string representation of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Waiting => "WAITING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a phase from its stored form.
    ///
    /// `INITIAL` and the single-letter `I` are accepted as aliases of STARTING.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTING" | "INITIAL" | "I" => Some(Self::Starting),
            "WAITING" | "W" => Some(Self::Waiting),
            "DONE" | "D" => Some(Self::Done),
            "FAILED" | "F" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether fan-in already completed for this split.
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}
