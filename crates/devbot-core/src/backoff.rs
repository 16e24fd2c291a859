use std::time::Duration;

/// Reconnect delay schedule: `base * multiplier^min(attempt, max_exponent)`,
/// capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub max_exponent: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            multiplier: 1.5,
            max: Duration::from_secs(30),
            max_exponent: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.max_exponent) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}
