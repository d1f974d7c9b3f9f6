//! 重试策略
//!
//! 指数退避 + 10%~20% 抖动，上限 45 秒；以及可重试错误的判定集合。

use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;

/// 显式列出的可重试状态码（另外任何 5xx 都可重试）
const RETRYABLE_STATUS_CODES: &[u16] = &[
    408, 409, 423, 429, 500, 501, 502, 503, 504, 505, 507, 508, 510, 511, 520, 521, 522, 523,
    524, 525, 526, 527, 530,
];

/// 可重试的错误类型（大小写不敏感）
const RETRYABLE_ERROR_KINDS: &[&str] = &[
    "rate_limit_error",
    "server_error",
    "api_connection_error",
    "timeout_error",
    "service_unavailable",
    "gateway_timeout",
    "internal_server_error",
    "bad_gateway",
    "network_error",
    "request_timeout",
    "too_many_requests",
    "temporary_unavailable",
    "service_overloaded",
    "connection_error",
    "try_again_later",
    "resource_exhausted",
    "transient_error",
    "aborted",
    "unavailable",
    "busy",
    "slow_down",
];

static NETWORK_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection|timeout|curl error|network error|could not connect|timed out|connection refused|connection reset|dns lookup failed|socket error|read timeout|write timeout",
    )
    .expect("network failure pattern compiles")
});

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status) || (500..600).contains(&status)
}

pub fn is_retryable_kind(kind: &str) -> bool {
    RETRYABLE_ERROR_KINDS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(kind.trim()))
}

pub fn is_network_failure(message: &str) -> bool {
    NETWORK_FAILURE.is_match(message)
}

/// 重试策略配置
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 单个模型最多重试次数（首次请求不计）
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_millis(45_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 第 attempt 次失败后的等待：base × 2^(attempt-1) × (1 + jitter)，不超过 max_delay
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let base_ms = self.base_delay.as_millis() as f64 * f64::from(1u32 << exp);
        let delay_ms = base_ms * (1.0 + jitter.clamp(0.0, 1.0));
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 带随机抖动（10%~20%）的等待时长
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.10..=0.20);
        self.backoff_delay(attempt, jitter)
    }
}
