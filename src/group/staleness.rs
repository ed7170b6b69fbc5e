/// Remembers the last upstream version a subscription derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalenessChecker {
    last_seen: Option<u64>,
}

impl StalenessChecker {
    /// Nothing seen yet: the first check is always stale.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(version: u64) -> Self {
        Self {
            last_seen: Some(version),
        }
    }

    /// True exactly when `current` differs from the version seen at the previous check.
    pub fn check(&mut self, current: u64) -> bool {
        let stale = self.last_seen != Some(current);
        self.last_seen = Some(current);
        stale
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }
}
