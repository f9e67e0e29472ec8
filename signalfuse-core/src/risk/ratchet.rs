//! Monotone stop level for trailing exits.
//!
//! The trailing proposal follows the best close in both directions; the
//! ratchet keeps only moves toward the position's favorable side.

use crate::domain::Side;

/// Stop level that can only move in the favorable direction:
/// - Long positions: stop can only rise
/// - Short positions: stop can only fall
#[derive(Debug, Clone, PartialEq)]
pub struct RatchetState {
    current_level: f64,
    side: Side,
}

impl RatchetState {
    /// Start the ratchet at the position's initial stop.
    pub fn with_initial_level(side: Side, initial_level: f64) -> Self {
        Self {
            current_level: initial_level,
            side,
        }
    }

    /// Apply the ratchet to a proposed stop level and return the resulting level.
    ///
    /// # Example
    /// ```
    /// use signalfuse_core::domain::Side;
    /// use signalfuse_core::risk::RatchetState;
    ///
    /// let mut ratchet = RatchetState::with_initial_level(Side::Long, 95.0);
    ///
    /// // Tightening: $95 → $100 (allowed)
    /// assert_eq!(ratchet.apply(100.0), 100.0);
    ///
    /// // Loosening: $100 → $90 (blocked, stays at $100)
    /// assert_eq!(ratchet.apply(90.0), 100.0);
    /// ```
    pub fn apply(&mut self, proposed: f64) -> f64 {
        if proposed.is_nan() {
            return self.current_level;
        }
        self.current_level = match self.side {
            Side::Long => self.current_level.max(proposed),
            Side::Short => self.current_level.min(proposed),
        };
        self.current_level
    }

    pub fn current_level(&self) -> f64 {
        self.current_level
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_only_rises() {
        let mut r = RatchetState::with_initial_level(Side::Long, 100.0);
        assert_eq!(r.apply(105.0), 105.0);
        assert_eq!(r.apply(103.0), 105.0);
        assert_eq!(r.apply(110.0), 110.0);
    }

    #[test]
    fn short_only_falls() {
        let mut r = RatchetState::with_initial_level(Side::Short, 100.0);
        assert_eq!(r.apply(95.0), 95.0);
        assert_eq!(r.apply(97.0), 95.0);
        assert_eq!(r.apply(90.0), 90.0);
    }

    #[test]
    fn nan_proposal_is_ignored() {
        let mut r = RatchetState::with_initial_level(Side::Long, 100.0);
        assert_eq!(r.apply(f64::NAN), 100.0);
        assert_eq!(r.current_level(), 100.0);
    }
}
