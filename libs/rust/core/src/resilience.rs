//! Retry with exponential backoff and jitter, used for store writes.

use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::metrics_ext::EXTENDED_METRICS;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 5, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), jitter applied.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        let mut delay = std::cmp::min(exp, self.max_delay);
        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
            let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
            let base_ms = delay.as_millis() as i64 + offset;
            delay = Duration::from_millis(base_ms.max(0) as u64);
        }
        delay
    }
}

pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let metrics = &EXTENDED_METRICS.persistence;
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => {
                metrics.retry_exhausted_total.inc();
                return Err(e);
            }
            Err(_) => {
                let delay = cfg.delay_for(attempt);
                metrics.retries_total.inc();
                metrics.retry_delay_ms.observe(delay.as_millis() as f64);
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let cfg = RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), jitter: 0.0 };
        let mut attempts = 0;
        let res: Result<usize, &str> = retry_async(&cfg, |_i| {
            attempts += 1;
            let ok = attempts >= 3;
            async move { if ok { Ok(42) } else { Err("fail") } }
        }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let cfg = RetryConfig { max_retries: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), jitter: 0.0 };
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async(&cfg, |_i| { attempts += 1; async { Err("down") } }).await;
        assert_eq!(res, Err("down"));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn delay_is_capped() {
        let cfg = RetryConfig { max_retries: 10, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(400), jitter: 0.0 };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(5), Duration::from_millis(400));
    }
}
