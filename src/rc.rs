// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! rc.rs
//!
//! The aggregate return code. Every component and every remote server contributes a set of flags,
//! and the overall result is the bitwise OR of all contributions, so a caller can test
//! `code & FLAG` without parsing any output.

use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RcFlags(u32);

impl RcFlags {
    pub const OK: RcFlags = RcFlags(0);
    /// A component is running on one of its failover servers.
    pub const MIGRATED: RcFlags = RcFlags(0x01);
    pub const CLIENT: RcFlags = RcFlags(0x02);
    pub const RECOVERING: RcFlags = RcFlags(0x04);
    pub const OFFLINE: RcFlags = RcFlags(0x08);
    pub const ERROR: RcFlags = RcFlags(0x10);
    pub const UNHEALTHY: RcFlags = RcFlags(0x20);
    pub const USER_ERROR: RcFlags = RcFlags(0x40);
    pub const RUNTIME_ERROR: RcFlags = RcFlags(0x80);
    pub const EXTERNAL: RcFlags = RcFlags(0x100);

    /// Flags that mean something went wrong, as opposed to flags that describe state.
    const FAILURES: RcFlags =
        RcFlags(Self::ERROR.0 | Self::UNHEALTHY.0 | Self::USER_ERROR.0 | Self::RUNTIME_ERROR.0);

    const NAMES: [(RcFlags, &'static str); 9] = [
        (Self::MIGRATED, "MIGRATED"),
        (Self::CLIENT, "CLIENT"),
        (Self::RECOVERING, "RECOVERING"),
        (Self::OFFLINE, "OFFLINE"),
        (Self::ERROR, "ERROR"),
        (Self::UNHEALTHY, "UNHEALTHY"),
        (Self::USER_ERROR, "USER_ERROR"),
        (Self::RUNTIME_ERROR, "RUNTIME_ERROR"),
        (Self::EXTERNAL, "EXTERNAL"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        RcFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set in `self`.
    pub fn contains(self, other: RcFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: RcFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Only the flags reporting a failure.
    pub fn failures(self) -> RcFlags {
        self & Self::FAILURES
    }

    pub fn has_failure(self) -> bool {
        self.intersects(Self::FAILURES)
    }

    /// The process exit status for this code.
    pub fn exit_code(self) -> i32 {
        self.0 as i32
    }
}

impl BitOr for RcFlags {
    type Output = RcFlags;

    fn bitor(self, rhs: RcFlags) -> RcFlags {
        RcFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RcFlags {
    fn bitor_assign(&mut self, rhs: RcFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RcFlags {
    type Output = RcFlags;

    fn bitand(self, rhs: RcFlags) -> RcFlags {
        RcFlags(self.0 & rhs.0)
    }
}

impl FromIterator<RcFlags> for RcFlags {
    fn from_iter<I: IntoIterator<Item = RcFlags>>(iter: I) -> Self {
        iter.into_iter().fold(RcFlags::OK, |acc, rc| acc | rc)
    }
}

impl fmt::Display for RcFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{} (0x{:x})", names.join("|"), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::RcFlags;

    #[test]
    fn values_are_stable() {
        assert_eq!(RcFlags::CLIENT.bits(), 0x02);
        assert_eq!(RcFlags::RECOVERING.bits(), 0x04);
        assert_eq!(RcFlags::OFFLINE.bits(), 0x08);
        assert_eq!(RcFlags::ERROR.bits(), 0x10);
        assert_eq!(RcFlags::UNHEALTHY.bits(), 0x20);
        assert_eq!(RcFlags::USER_ERROR.bits(), 0x40);
        assert_eq!(RcFlags::RUNTIME_ERROR.bits(), 0x80);
        assert_eq!(RcFlags::EXTERNAL.bits(), 0x100);
    }

    #[test]
    fn fold_is_order_independent() {
        let contributions = [
            RcFlags::OK,
            RcFlags::OFFLINE,
            RcFlags::RECOVERING,
            RcFlags::ERROR | RcFlags::CLIENT,
            RcFlags::OFFLINE,
            RcFlags::EXTERNAL,
        ];
        let expected: RcFlags = contributions.iter().copied().collect();

        // Every rotation and the reversal of the list fold to the same code.
        for start in 0..contributions.len() {
            let mut rotated = contributions.to_vec();
            rotated.rotate_left(start);
            assert_eq!(rotated.iter().copied().collect::<RcFlags>(), expected);
            rotated.reverse();
            assert_eq!(rotated.iter().copied().collect::<RcFlags>(), expected);
        }

        assert_eq!(expected.bits(), 0x08 | 0x04 | 0x10 | 0x02 | 0x100);
    }

    #[test]
    fn failures_are_separated_from_state() {
        let rc = RcFlags::OFFLINE | RcFlags::MIGRATED;
        assert!(!rc.has_failure());
        assert!(rc.contains(RcFlags::OFFLINE));

        let rc = rc | RcFlags::UNHEALTHY;
        assert!(rc.has_failure());
        assert_eq!(rc.failures(), RcFlags::UNHEALTHY);
        assert_eq!(rc.to_string(), "MIGRATED|OFFLINE|UNHEALTHY (0x29)");
        assert_eq!(RcFlags::OK.to_string(), "OK");
    }
}
