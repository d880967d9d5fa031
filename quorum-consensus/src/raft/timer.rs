use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout in `[base, 2 * base)`
pub fn random_election_timeout(base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1);
    let upper = base_ms.saturating_mul(2);
    if upper == base_ms {
        return Duration::from_millis(base_ms);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(base_ms..upper))
}

// Roughly 30 years, used when a configured timeout cannot be added to now
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Deadline that fires follower/candidate elections.
#[derive(Debug)]
pub struct ElectionTimer {
    base: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            deadline: deadline_after(random_election_timeout(base)),
        }
    }

    /// Re-arm with a freshly randomized timeout.
    pub fn reset(&mut self) {
        self.deadline = deadline_after(random_election_timeout(self.base));
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}
