//! Process-lifetime policy flags.

#![allow(missing_docs)]

use std::ops::BitOr;

/// Bit-set of bridge policy flags.
///
/// The hosting framework passes a single integer at configuration time; the
/// flags are read-only for the lifetime of one handle cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyFlags(u32);

impl PolicyFlags {
    /// Warn if a routine is idle when first connected to.
    pub const WARN_IF_IDLE: PolicyFlags = PolicyFlags(1);
    /// Start a routine that is idle when first connected to.
    pub const START_IF_IDLE: PolicyFlags = PolicyFlags(2);
    /// At process exit, stop routines this process auto-started.
    pub const STOP_ON_EXIT_IF_STARTED: PolicyFlags = PolicyFlags(4);
    /// At process exit, stop every routine we connected to.
    pub const ALWAYS_STOP_ON_EXIT: PolicyFlags = PolicyFlags(8);
    /// Never start the engine; wait for an existing instance instead.
    pub const NO_AUTO_START: PolicyFlags = PolicyFlags(16);
    /// Extra diagnostic output.
    pub const VERBOSE: PolicyFlags = PolicyFlags(32);

    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PolicyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
