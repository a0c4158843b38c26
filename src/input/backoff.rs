// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 重连退避: initial × multiplier^n, 上限 max, 叠加 ±jitter 抖动

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// 已重试次数
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 不含抖动的第 n 次等待时间
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let c = &self.config;
        let ms = c.initial_ms as f64 * c.multiplier.powi(attempt.min(64) as i32);
        Duration::from_millis(ms.min(c.max_ms as f64) as u64)
    }

    /// 下一次等待时间; 超出重试预算返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let base = self.base_delay(self.attempt);
        self.attempt += 1;

        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return Some(base);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Some(base.mul_f64(factor.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            max_retries: 6,
            jitter,
        }
    }

    #[test]
    fn exponential_capped_and_budgeted() {
        let mut b = Backoff::new(config(0.0));
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(b.attempts(), 6);
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut b = Backoff::new(config(0.1));
        for _ in 0..6 {
            let attempt = b.attempts();
            let base = b.base_delay(attempt).as_secs_f64();
            let d = b.next_delay().unwrap().as_secs_f64();
            assert!(d >= base * 0.9 - 1e-9 && d <= base * 1.1 + 1e-9);
        }
    }
}
