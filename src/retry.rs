use tracing::warn;

/// Attempts allowed per outer iteration before the failure is fatal.
pub const MAX_ATTEMPTS: u32 = 2;

/// Decision returned by the escalation policy after each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Iteration resolved healthy: sleep the interval, then start the next one.
    /// `recovered` is set when an earlier attempt in this iteration failed.
    Sleep { recovered: bool },
    /// Attempt failed: run the next attempt right away (1-based number).
    RetryNow { attempt: u32 },
    /// Every attempt in this iteration failed. Terminal.
    Fatal,
}

/// Immediate-retry escalation for failed probes.
///
/// Tracks attempts within the current iteration. One failure earns one
/// immediate retry; a failure on the retry is fatal. A resolved iteration
/// forgets its history, so failures separated by a success never combine.
#[derive(Debug)]
pub struct EscalationPolicy {
    max_attempts: u32,
    current_attempt: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS)
    }
}

impl EscalationPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            current_attempt: 0,
        }
    }

    /// Record the outcome of the attempt that just finished.
    pub fn evaluate(&mut self, succeeded: bool) -> Decision {
        self.current_attempt += 1;

        if succeeded {
            let recovered = self.current_attempt > 1;
            self.current_attempt = 0;
            return Decision::Sleep { recovered };
        }

        if self.current_attempt < self.max_attempts {
            warn!(
                attempt = self.current_attempt,
                max_attempts = self.max_attempts,
                "probe failed, retrying immediately"
            );
            Decision::RetryNow {
                attempt: self.current_attempt + 1,
            }
        } else {
            warn!(
                max_attempts = self.max_attempts,
                "probe failed on every attempt, escalating"
            );
            Decision::Fatal
        }
    }

    /// Attempts made so far in the current iteration (0 = none yet).
    #[cfg(test)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}
