//! SM-2 spaced repetition scheduling
//!
//! Pure functions computing a flashcard's next interval, ease factor,
//! and due date from a review quality rating. Storage backends call
//! [`next_schedule`] and persist the result; no state lives here.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, StoreError};

/// Ease factor assigned to cards that have never been reviewed
pub const INITIAL_EASE: f64 = 2.5;
/// Lower bound of the ease factor domain
pub const MIN_EASE: f64 = 1.3;
/// Upper bound of the ease factor domain
pub const MAX_EASE: f64 = 2.5;

/// A validated SM-2 quality rating
///
/// 0 is a complete blackout, 5 a perfect response. Out-of-range values
/// are rejected here, before any card state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: u8) -> Result<Self> {
        if value > 5 {
            return Err(StoreError::QualityOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether this rating counts as a successful recall
    pub fn passed(&self) -> bool {
        self.0 >= 3
    }
}

/// The outcome of one review: the card's next scheduling state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Days until the next review
    pub interval: u32,
    /// Updated ease factor, within [`MIN_EASE`, `MAX_EASE`]
    pub ease: f64,
    /// When the card is next due
    pub due_at: DateTime<Utc>,
}

/// Compute the next schedule for a card reviewed at `now`
///
/// `interval` and `ease` are the card's pre-review values. An ease of
/// zero or below (cards written before ease tracking) is treated as
/// [`INITIAL_EASE`]. The interval is floor-truncated, never rounded,
/// so the same inputs always produce bit-identical output.
pub fn next_schedule(interval: u32, ease: f64, quality: Quality, now: DateTime<Utc>) -> Schedule {
    let prev_ease = if ease <= 0.0 { INITIAL_EASE } else { ease };
    let q = f64::from(quality.value());

    let next_ease =
        (prev_ease + (0.1 - (5.0 - q) * (0.08 + (5.0 - q) * 0.02))).clamp(MIN_EASE, MAX_EASE);

    let next_interval = if !quality.passed() {
        // Failed recall resets the card
        1
    } else if interval == 0 {
        1
    } else if interval == 1 {
        6
    } else {
        (f64::from(interval) * next_ease) as u32
    };

    Schedule {
        interval: next_interval,
        ease: next_ease,
        due_at: now + Duration::days(i64::from(next_interval)),
    }
}
