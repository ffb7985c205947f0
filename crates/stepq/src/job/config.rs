//! Job configuration

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::retry::RetryPolicy;
use crate::events::LifecycleEvent;
use crate::time::{parse_interval, ParseTimeError};
use crate::validation::Validator;

/// Computes a task's priority from its input; higher runs first.
pub type PriorityFn = Arc<dyn Fn(&Value) -> i64 + Send + Sync>;

/// Synchronous lifecycle callback.
pub type LifecycleHook = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Debounce: a dispatch cancels older, not-yet-started tasks in its group
/// and defers itself by the interval.
#[derive(Debug, Clone)]
pub struct Debounce {
    /// Group id; jobs in the same queue sharing it debounce together.
    pub id: String,
    pub interval: Duration,
}

impl Debounce {
    pub fn new(id: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            interval,
        }
    }

    /// Parse the interval from a duration (`"50 ms"`) or rate (`"20/s"`)
    /// expression.
    pub fn per(id: impl Into<String>, expr: &str) -> Result<Self, ParseTimeError> {
        Ok(Self::new(id, parse_interval(expr)?))
    }
}

/// Throttle: tasks in the group start at most once per interval, admitted
/// by priority then FIFO.
#[derive(Debug, Clone)]
pub struct Throttle {
    /// Group id; jobs in the same queue sharing it throttle together.
    pub id: String,
    pub interval: Duration,
}

impl Throttle {
    pub fn new(id: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            interval,
        }
    }

    /// Parse the interval from a duration or rate expression:
    /// `"100/s"` means at most one start every 10 ms.
    pub fn per(id: impl Into<String>, expr: &str) -> Result<Self, ParseTimeError> {
        Ok(Self::new(id, parse_interval(expr)?))
    }
}

/// Rate limit: per-job minimum spacing between task starts, newest-wins
/// admission among waiting tasks.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub interval: Duration,
}

impl RateLimit {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// `"100/s"` admits at most 100 starts per second, 10 ms apart.
    pub fn per(expr: &str) -> Result<Self, ParseTimeError> {
        Ok(Self::new(parse_interval(expr)?))
    }
}

/// Configuration for a job
///
/// # Example
///
/// ```ignore
/// let config = JobConfig::new("send-email")
///     .with_retry(RetryPolicy::exponential().with_max_attempts(5))
///     .with_throttle(Throttle::per("smtp", "10/s")?)
///     .with_timeout(Duration::from_secs(300));
/// ```
#[derive(Clone)]
pub struct JobConfig {
    /// Globally unique within its queue
    pub id: String,

    /// Input validator, applied as the implicit first system step
    pub input: Option<Arc<dyn Validator>>,

    /// Output validator, applied as the implicit last system step
    pub output: Option<Arc<dyn Validator>>,

    /// Priority function of the input; higher runs first
    pub priority: Option<PriorityFn>,

    /// Task-wide duration; on expiry the task is cancelled with reason
    /// `{"type": "timeout"}`
    pub timeout: Option<Duration>,

    pub debounce: Option<Debounce>,

    pub throttle: Option<Throttle>,

    pub rate_limit: Option<RateLimit>,

    /// Default retry policy for `run` steps inside this job
    pub retry: RetryPolicy,

    pub on_start: Option<LifecycleHook>,
    pub on_settled: Option<LifecycleHook>,
    pub on_cancel: Option<LifecycleHook>,
    pub on_success: Option<LifecycleHook>,
    pub on_error: Option<LifecycleHook>,
}

impl JobConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: None,
            output: None,
            priority: None,
            timeout: None,
            debounce: None,
            throttle: None,
            rate_limit: None,
            retry: RetryPolicy::default(),
            on_start: None,
            on_settled: None,
            on_cancel: None,
            on_success: None,
            on_error: None,
        }
    }

    pub fn with_input(mut self, validator: Arc<dyn Validator>) -> Self {
        self.input = Some(validator);
        self
    }

    pub fn with_output(mut self, validator: Arc<dyn Validator>) -> Self {
        self.output = Some(validator);
        self
    }

    pub fn with_priority(
        mut self,
        priority: impl Fn(&Value) -> i64 + Send + Sync + 'static,
    ) -> Self {
        self.priority = Some(Arc::new(priority));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_debounce(mut self, debounce: Debounce) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_start(mut self, hook: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_settled(mut self, hook: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(hook));
        self
    }

    pub fn on_cancel(mut self, hook: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(hook));
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// The start-spacing gate for this job, if any: throttle group or the
    /// job-private rate limit. Throttle wins when both are configured.
    pub(crate) fn gate(&self) -> Option<(String, Duration)> {
        if let Some(throttle) = &self.throttle {
            return Some((throttle.id.clone(), throttle.interval));
        }
        self.rate_limit
            .as_ref()
            .map(|r| (format!("job/{}", self.id), r.interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_expressions() {
        assert_eq!(
            Throttle::per("g", "100/s").unwrap().interval,
            Duration::from_millis(10)
        );
        assert_eq!(
            Debounce::per("g", "20/s").unwrap().interval,
            Duration::from_millis(50)
        );
        assert_eq!(
            RateLimit::per("2/s").unwrap().interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_gate_prefers_throttle() {
        let config = JobConfig::new("j")
            .with_throttle(Throttle::new("g", Duration::from_millis(10)))
            .with_rate_limit(RateLimit::new(Duration::from_millis(20)));
        let (group, interval) = config.gate().unwrap();
        assert_eq!(group, "g");
        assert_eq!(interval, Duration::from_millis(10));
    }

    #[test]
    fn test_gate_from_rate_limit() {
        let config = JobConfig::new("j").with_rate_limit(RateLimit::new(Duration::from_millis(20)));
        let (group, interval) = config.gate().unwrap();
        assert_eq!(group, "job/j");
        assert_eq!(interval, Duration::from_millis(20));
    }

    #[test]
    fn test_no_gate_by_default() {
        assert!(JobConfig::new("j").gate().is_none());
    }
}
