//! Concurrency Limits - 리소스 키별 동시 실행 제한 설정
//!
//! 키는 모델 ID (`provider/model`) 또는 에이전트 이름이다.
//! 가장 구체적인 설정이 우선한다: 모델 → provider prefix → 에이전트 → 기본값.
//! 제한값 0은 무제한을 의미한다.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 기본 동시 실행 제한
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 3;

/// 대기열 타임아웃 기본값 (5분)
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// 같은 키에서 연속 시작 사이의 최소 간격
pub const DEFAULT_MIN_START_INTERVAL_MS: u64 = 100;

/// 동시 실행 제한 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// 전역 기본 제한 (0 = 무제한)
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// 모델 ID별 제한 (예: `anthropic/claude-sonnet-4`)
    #[serde(default)]
    pub model_limits: HashMap<String, usize>,

    /// Provider별 제한 (예: `anthropic`)
    #[serde(default)]
    pub provider_limits: HashMap<String, usize>,

    /// 에이전트 이름별 제한
    #[serde(default)]
    pub agent_limits: HashMap<String, usize>,

    /// 대기열 타임아웃 (ms)
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// 시작 간 최소 간격 (ms)
    #[serde(default = "default_min_start_interval_ms")]
    pub min_start_interval_ms: u64,
}

fn default_limit() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

fn default_queue_timeout_ms() -> u64 {
    DEFAULT_QUEUE_TIMEOUT_MS
}

fn default_min_start_interval_ms() -> u64 {
    DEFAULT_MIN_START_INTERVAL_MS
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_CONCURRENCY_LIMIT,
            model_limits: HashMap::new(),
            provider_limits: HashMap::new(),
            agent_limits: HashMap::new(),
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            min_start_interval_ms: DEFAULT_MIN_START_INTERVAL_MS,
        }
    }
}

impl ConcurrencyConfig {
    /// 모든 키 무제한
    pub fn unlimited() -> Self {
        Self {
            default_limit: 0,
            min_start_interval_ms: 0,
            ..Default::default()
        }
    }

    /// 키에 적용되는 제한 조회 (0 = 무제한)
    pub fn resolve_limit(&self, key: &str) -> usize {
        if let Some(limit) = self.model_limits.get(key) {
            return *limit;
        }

        if let Some((provider, _)) = key.split_once('/') {
            if let Some(limit) = self.provider_limits.get(provider) {
                return *limit;
            }
        }

        if let Some(limit) = self.agent_limits.get(key) {
            return *limit;
        }

        self.default_limit
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn min_start_interval(&self) -> Duration {
        Duration::from_millis(self.min_start_interval_ms)
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_model_limit(mut self, model: impl Into<String>, limit: usize) -> Self {
        self.model_limits.insert(model.into(), limit);
        self
    }

    pub fn with_provider_limit(mut self, provider: impl Into<String>, limit: usize) -> Self {
        self.provider_limits.insert(provider.into(), limit);
        self
    }

    pub fn with_agent_limit(mut self, agent: impl Into<String>, limit: usize) -> Self {
        self.agent_limits.insert(agent.into(), limit);
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_min_start_interval(mut self, interval: Duration) -> Self {
        self.min_start_interval_ms = interval.as_millis() as u64;
        self
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub(crate) fn merge(&mut self, other: ConcurrencyConfig) {
        if other.default_limit != DEFAULT_CONCURRENCY_LIMIT {
            self.default_limit = other.default_limit;
        }
        if other.queue_timeout_ms != DEFAULT_QUEUE_TIMEOUT_MS {
            self.queue_timeout_ms = other.queue_timeout_ms;
        }
        if other.min_start_interval_ms != DEFAULT_MIN_START_INTERVAL_MS {
            self.min_start_interval_ms = other.min_start_interval_ms;
        }
        self.model_limits.extend(other.model_limits);
        self.provider_limits.extend(other.provider_limits);
        self.agent_limits.extend(other.agent_limits);
    }
}
