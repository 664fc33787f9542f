use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Process-lifetime map from scenario name to the instant its cooldown
/// expires. Monotonic clock; nothing is persisted. Multi-instance
/// deployments would need external coordination, which is out of scope.
pub struct CooldownTracker {
    until: Mutex<HashMap<String, Instant>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            until: Mutex::new(HashMap::new()),
        }
    }

    /// Time left on the cooldown, or None when the name is eligible.
    pub fn remaining(&self, name: &str) -> Option<Duration> {
        let until = self.until.lock().unwrap();
        until
            .get(name)
            .and_then(|t| t.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// Reset the cooldown clock to now + window.
    pub fn arm(&self, name: &str, window: Duration) {
        let mut until = self.until.lock().unwrap();
        until.insert(name.to_string(), Instant::now() + window);
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_name_is_eligible() {
        let tracker = CooldownTracker::new();
        assert!(tracker.remaining("anything").is_none());
    }

    #[test]
    fn armed_name_reports_remaining_time() {
        let tracker = CooldownTracker::new();
        tracker.arm("session_flood", Duration::from_secs(30));
        let remaining = tracker.remaining("session_flood").expect("on cooldown");
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));
    }

    #[test]
    fn zero_window_expires_immediately() {
        let tracker = CooldownTracker::new();
        tracker.arm("session_flood", Duration::ZERO);
        assert!(tracker.remaining("session_flood").is_none());
    }
}
