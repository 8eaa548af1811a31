//! Retention policy of a stage's history.
//!
//! A stage either keeps every simulated timestep or only a trailing window.
//! The policy fixes how much storage is allocated, how a timestep maps to a
//! storage slot, and when the slot for the next tick must be (re)allocated.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codegen::ir::{BinaryOp, LExpr};
use crate::types::NumericKind;

/// Largest `holds` window whose ring of `window + 1` slots is addressable by an `int`.
pub const MAX_WINDOW: usize = i32::MAX as usize - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldState {
    /// One slot per timestep, `0..=max_time`.
    FullHistory,
    /// `window + 1` slots, addressed modulo `window + 1`.
    PartialHistory { window: usize },
}

impl HoldState {
    /// A trailing window, or `None` when `window` is negative or above `MAX_WINDOW`.
    pub fn partial(window: i64) -> Option<HoldState> {
        usize::try_from(window)
            .ok()
            .filter(|window| *window <= MAX_WINDOW)
            .map(|window| HoldState::PartialHistory { window })
    }

    /// Number of history slots, `None` when it does not fit a `usize`.
    pub fn allocation_len(&self, max_time: usize) -> Option<usize> {
        match self {
            HoldState::FullHistory => max_time.checked_add(1),
            HoldState::PartialHistory { window } => window.checked_add(1),
        }
    }

    fn ring_len(window: usize) -> i32 {
        window
            .checked_add(1)
            .and_then(|len| i32::try_from(len).ok())
            .unwrap_or(i32::MAX)
    }

    /// Storage slot for timestep `time`. Negative times keep their sign, so a
    /// read before the first tick surfaces as an out-of-range access.
    pub fn slot(&self, time: i64) -> i64 {
        match self {
            HoldState::FullHistory => time,
            HoldState::PartialHistory { window } => time % i64::from(Self::ring_len(*window)),
        }
    }

    /// Rewrites a lowered time expression into the storage index expression.
    pub fn index_expr(&self, time: LExpr) -> LExpr {
        match self {
            HoldState::FullHistory => time,
            HoldState::PartialHistory { window } => LExpr::binary(
                BinaryOp::Modulo,
                time,
                LExpr::int32(Self::ring_len(*window)),
                NumericKind::Int32,
            ),
        }
    }

    /// Guard under which the slot for `now + 1` is allocated, `None` when it
    /// always is. Reusable elements of a windowed stage are allocated on
    /// their first occupancy only and overwritten afterwards.
    pub fn move_next_guard(&self, reusable: bool) -> Option<LExpr> {
        match self {
            HoldState::PartialHistory { window } if reusable => Some(LExpr::compare(
                BinaryOp::LessOrEqual,
                LExpr::Now,
                LExpr::int32(i32::try_from(*window).unwrap_or(i32::MAX)),
                NumericKind::Int32,
            )),
            _ => None,
        }
    }
}

impl fmt::Display for HoldState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HoldState::FullHistory => write!(f, "full history"),
            HoldState::PartialHistory { window } => write!(f, "holds {}", window),
        }
    }
}
