use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

/// 指数退避状态
///
/// 同时用于控制平面重连（5s 起步、倍数 2、总耗时上限约 10 分钟）
/// 和节点离线降级时的有限次重试（固定 1s 间隔、共 3 次尝试）。
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    /// 总耗时预算，超过后不再给出下一次等待
    max_elapsed_time: Option<Duration>,
    /// 首次尝试之后允许的重试次数
    max_retries: Option<u32>,
    /// 随机抖动范围（0.0-1.0）
    randomization_factor: f64,
    current_interval: Duration,
    retries: u32,
    started_at: Instant,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, multiplier: f64) -> Self {
        Self {
            initial_interval,
            multiplier: multiplier.max(1.0),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            max_retries: None,
            randomization_factor: 0.0,
            current_interval: initial_interval,
            retries: 0,
            started_at: Instant::now(),
        }
    }

    /// 固定间隔的有限次重试
    pub fn constant(interval: Duration, max_retries: u32) -> Self {
        Self::new(interval, 1.0)
            .with_max_interval(interval)
            .with_max_retries(max_retries)
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    pub fn with_max_elapsed_time(mut self, max_elapsed_time: Duration) -> Self {
        self.max_elapsed_time = Some(max_elapsed_time);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// 重置为初始状态，重新开始计算耗时预算
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.retries = 0;
        self.started_at = Instant::now();
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 返回下一次等待时长；预算耗尽时返回 `None`
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max_retries) = self.max_retries {
            if self.retries >= max_retries {
                return None;
            }
        }

        let delay = self.randomize(self.current_interval);
        if let Some(max_elapsed) = self.max_elapsed_time {
            if self.started_at.elapsed() + delay > max_elapsed {
                return None;
            }
        }

        let next = self.current_interval.mul_f64(self.multiplier);
        self.current_interval = next.min(self.max_interval);
        self.retries += 1;
        Some(delay)
    }

    fn randomize(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 || interval.is_zero() {
            return interval;
        }
        let delta = interval.as_secs_f64() * self.randomization_factor;
        let low = interval.as_secs_f64() - delta;
        let high = interval.as_secs_f64() + delta;
        Duration::from_secs_f64(rand::rng().random_range(low..=high))
    }
}

/// 按退避策略重试异步操作，每次失败都会记录日志
///
/// 第一次尝试立即执行；退避预算耗尽时返回最后一次的错误。
pub async fn retry<T, E, F, Fut>(
    backoff: &mut ExponentialBackoff,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    backoff.reset();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        "{}失败（第 {} 次）: {}，{:?} 后重试",
                        operation,
                        backoff.retries(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        "{}在 {} 次重试后仍然失败，放弃: {}",
                        operation,
                        backoff.retries(),
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_intervals_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), 2.0)
            .with_max_interval(Duration::from_secs(30));

        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_backoff().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn test_constant_backoff_respects_retry_limit() {
        let mut backoff = ExponentialBackoff::constant(Duration::from_secs(1), 2);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_elapsed_budget_stops_backoff() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), 2.0)
            .with_max_elapsed_time(Duration::from_secs(8));

        assert!(backoff.next_backoff().is_some());
        // 第二次等待 10s 会超过 8s 的预算
        assert!(backoff.next_backoff().is_none());
    }

    #[test]
    fn test_randomized_delay_stays_in_range() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(10), 1.0)
            .with_randomization_factor(0.5);
        for _ in 0..20 {
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= Duration::from_secs(5) && delay <= Duration::from_secs(15));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let mut backoff = ExponentialBackoff::constant(Duration::from_millis(5), 3);

        let result: Result<u32, String> = retry(&mut backoff, "flaky op", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {n} failed"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_last_error() {
        let attempts = AtomicU32::new(0);
        let mut backoff = ExponentialBackoff::constant(Duration::from_millis(1), 2);

        let result: Result<(), String> = retry(&mut backoff, "always failing", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {n}"))
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
