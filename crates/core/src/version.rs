//! Optimistic concurrency expectations for row writes.

/// What a writer believes the stored version of a row to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The row must not exist yet (first insert).
    Absent,
    /// The row must exist at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation for an entity last seen at `version` (0 = never stored).
    pub fn from_loaded(version: u64) -> Self {
        if version == 0 {
            ExpectedVersion::Absent
        } else {
            ExpectedVersion::Exact(version)
        }
    }

    /// Check against the stored version (`None` when the row is missing).
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exact(v), Some(a)) => v == a,
            _ => false,
        }
    }

    /// Version the row will carry after a successful write.
    pub fn next(self) -> u64 {
        match self {
            ExpectedVersion::Absent => 1,
            ExpectedVersion::Exact(v) => v + 1,
        }
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExpectedVersion::Absent => f.write_str("absent"),
            ExpectedVersion::Exact(v) => write!(f, "v{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_only_matches_missing_rows() {
        assert!(ExpectedVersion::Absent.matches(None));
        assert!(!ExpectedVersion::Absent.matches(Some(1)));
    }

    #[test]
    fn exact_requires_same_stored_version() {
        assert!(ExpectedVersion::Exact(3).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(3).matches(Some(4)));
        assert!(!ExpectedVersion::Exact(3).matches(None));
    }

    #[test]
    fn next_version_starts_at_one() {
        assert_eq!(ExpectedVersion::from_loaded(0).next(), 1);
        assert_eq!(ExpectedVersion::from_loaded(7).next(), 8);
    }
}
