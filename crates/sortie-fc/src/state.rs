use std::time::Duration;

use tokio::time::Instant;

/// Heartbeat timestamps of one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessState {
    pub last_received: Option<Instant>,
    pub last_sent: Option<Instant>,
}

impl LivenessState {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_received.map(|t| t.elapsed())
    }

    /// A peer that never sent a heartbeat is not alive.
    pub fn is_alive(&self, max_silence: Duration) -> bool {
        self.hb_age().map(|age| age <= max_silence).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silence_longer_than_limit_is_dead() {
        let st = LivenessState { last_received: Some(Instant::now()), last_sent: None };
        assert!(st.is_alive(Duration::from_secs(3)));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!st.is_alive(Duration::from_secs(3)));
        assert!(!LivenessState::default().is_alive(Duration::from_secs(3)));
    }
}
