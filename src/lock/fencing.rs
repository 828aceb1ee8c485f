//! Stale-holder rejection for resource owners.
//!
//! A lock can expire while its holder is paused; the holder then resumes and
//! writes. Resources that track the highest fencing token they have accepted
//! can refuse those writes.

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fencing token {token} for '{resource}' is older than {highest}")]
pub struct StaleToken {
    pub resource: String,
    pub token: u64,
    pub highest: u64,
}

/// Highest fencing token accepted per resource.
#[derive(Debug, Default)]
pub struct FencingGate {
    highest: DashMap<String, u64>,
}

impl FencingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` unless a newer one was already accepted for `resource`.
    ///
    /// Repeating the current token is allowed so one holder can write many times.
    pub fn admit(&self, resource: &str, token: u64) -> Result<(), StaleToken> {
        let mut highest = self.highest.entry(resource.to_string()).or_insert(0);
        if token < *highest {
            tracing::warn!(resource = %resource, token, highest = *highest, "Rejected stale fencing token");
            return Err(StaleToken {
                resource: resource.to_string(),
                token,
                highest: *highest,
            });
        }
        *highest = token;
        Ok(())
    }

    pub fn highest(&self, resource: &str) -> Option<u64> {
        self.highest.get(resource).map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_older_tokens() {
        let gate = FencingGate::new();
        gate.admit("ledger", 3).unwrap();
        gate.admit("ledger", 3).unwrap();
        gate.admit("ledger", 4).unwrap();

        let err = gate.admit("ledger", 2).unwrap_err();
        assert_eq!(err.highest, 4);
        assert_eq!(gate.highest("ledger"), Some(4));
    }

    #[test]
    fn test_resources_are_independent() {
        let gate = FencingGate::new();
        gate.admit("a", 10).unwrap();
        gate.admit("b", 1).unwrap();
        assert_eq!(gate.highest("c"), None);
    }
}
