//! Conductor Config - 통합 설정
//!
//! 글로벌(`~/.config/conductor/conductor.json`)과 프로젝트
//! (`.conductor/conductor.json`) 설정을 병합한다. 프로젝트가 우선.

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::ConcurrencyConfig;

/// 설정 파일명
pub const CONDUCTOR_CONFIG_FILE: &str = "conductor.json";

// ============================================================================
// Conductor Config (통합)
// ============================================================================

/// Conductor 통합 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConductorConfig {
    /// 동시 실행 제한
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// 활동 관찰자 (폴링)
    #[serde(default)]
    pub observer: ObserverConfig,

    /// 백그라운드 태스크 spawn/대기
    #[serde(default)]
    pub spawn: SpawnConfig,
}

impl ConductorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let global = JsonStore::global().ok();
        let project = JsonStore::current_project().ok();
        Self::load_layers(global.as_ref(), project.as_ref())
    }

    /// 지정된 저장소들에서 순서대로 병합 로드 (뒤가 우선)
    pub fn load_layers(global: Option<&JsonStore>, project: Option<&JsonStore>) -> Result<Self> {
        let mut config = Self::new();

        for store in [global, project].into_iter().flatten() {
            if let Some(layer) = store.load_optional::<ConductorConfig>(CONDUCTOR_CONFIG_FILE)? {
                debug!("Loaded config layer from {}", store.base_dir().display());
                config.merge(layer);
            }
        }

        Ok(config)
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        let store = JsonStore::global()?;
        store.save(CONDUCTOR_CONFIG_FILE, self)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self) -> Result<()> {
        let store = JsonStore::current_project()?;
        store.save(CONDUCTOR_CONFIG_FILE, self)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: ConductorConfig) {
        self.concurrency.merge(other.concurrency);
        self.observer.merge(other.observer);
        self.spawn.merge(other.spawn);
    }
}

// ============================================================================
// Observer Config
// ============================================================================

/// 활동 관찰자 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverConfig {
    /// 기본 폴링 간격 (ms)
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// 최대 폴링 간격 (ms)
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// 안정 상태일 때 간격 배수
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// 완료로 판단하기 위한 연속 안정 폴링 횟수
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: u32,

    /// 안정성 기반 완료 전 최소 실행 시간 (ms)
    #[serde(default = "default_min_runtime_ms")]
    pub min_runtime_ms: u64,

    /// 마지막 활동 이후 "stuck" 판단 시간 (ms)
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,

    /// "stuck" 판단 전 최소 실행 시간 (ms)
    #[serde(default = "default_stuck_min_runtime_ms")]
    pub stuck_min_runtime_ms: u64,

    /// 연속 조회 실패가 이 횟수에 도달하면 한 번 로그
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

fn default_base_interval_ms() -> u64 {
    2_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_stable_threshold() -> u32 {
    3
}

fn default_min_runtime_ms() -> u64 {
    10_000
}

fn default_stuck_threshold_ms() -> u64 {
    5 * 60 * 1000
}

fn default_stuck_min_runtime_ms() -> u64 {
    60_000
}

fn default_error_threshold() -> u32 {
    3
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            backoff_factor: default_backoff_factor(),
            stable_threshold: default_stable_threshold(),
            min_runtime_ms: default_min_runtime_ms(),
            stuck_threshold_ms: default_stuck_threshold_ms(),
            stuck_min_runtime_ms: default_stuck_min_runtime_ms(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl ObserverConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.base_interval_ms))
    }

    pub fn min_runtime(&self) -> Duration {
        Duration::from_millis(self.min_runtime_ms)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn stuck_min_runtime(&self) -> Duration {
        Duration::from_millis(self.stuck_min_runtime_ms)
    }

    fn merge(&mut self, other: ObserverConfig) {
        let defaults = ObserverConfig::default();
        if other.base_interval_ms != defaults.base_interval_ms {
            self.base_interval_ms = other.base_interval_ms;
        }
        if other.max_interval_ms != defaults.max_interval_ms {
            self.max_interval_ms = other.max_interval_ms;
        }
        if other.backoff_factor != defaults.backoff_factor {
            self.backoff_factor = other.backoff_factor;
        }
        if other.stable_threshold != defaults.stable_threshold {
            self.stable_threshold = other.stable_threshold;
        }
        if other.min_runtime_ms != defaults.min_runtime_ms {
            self.min_runtime_ms = other.min_runtime_ms;
        }
        if other.stuck_threshold_ms != defaults.stuck_threshold_ms {
            self.stuck_threshold_ms = other.stuck_threshold_ms;
        }
        if other.stuck_min_runtime_ms != defaults.stuck_min_runtime_ms {
            self.stuck_min_runtime_ms = other.stuck_min_runtime_ms;
        }
        if other.error_threshold != defaults.error_threshold {
            self.error_threshold = other.error_threshold;
        }
    }
}

// ============================================================================
// Spawn Config
// ============================================================================

/// 출력 파일 기본 디렉토리
fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
        .join("outputs")
}

/// spawn/출력 대기 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    /// 큰 출력을 기록할 디렉토리
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// 이 크기(bytes)를 넘는 출력은 파일 경로로 반환
    #[serde(default = "default_inline_output_limit")]
    pub inline_output_limit: usize,

    /// 출력 대기 기본 타임아웃 (ms)
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// 동기 spawn-and-wait 최대 대기 (ms)
    #[serde(default = "default_sync_wait_cap_ms")]
    pub sync_wait_cap_ms: u64,

    /// 대기 중 ledger 확인 간격 (ms)
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,
}

fn default_inline_output_limit() -> usize {
    16 * 1024
}

fn default_wait_timeout_ms() -> u64 {
    30_000
}

fn default_sync_wait_cap_ms() -> u64 {
    30 * 60 * 1000
}

fn default_wait_poll_interval_ms() -> u64 {
    250
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            inline_output_limit: default_inline_output_limit(),
            wait_timeout_ms: default_wait_timeout_ms(),
            sync_wait_cap_ms: default_sync_wait_cap_ms(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
        }
    }
}

impl SpawnConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn sync_wait_cap(&self) -> Duration {
        Duration::from_millis(self.sync_wait_cap_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(1))
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    fn merge(&mut self, other: SpawnConfig) {
        let defaults = SpawnConfig::default();
        if other.output_dir != defaults.output_dir {
            self.output_dir = other.output_dir;
        }
        if other.inline_output_limit != defaults.inline_output_limit {
            self.inline_output_limit = other.inline_output_limit;
        }
        if other.wait_timeout_ms != defaults.wait_timeout_ms {
            self.wait_timeout_ms = other.wait_timeout_ms;
        }
        if other.sync_wait_cap_ms != defaults.sync_wait_cap_ms {
            self.sync_wait_cap_ms = other.sync_wait_cap_ms;
        }
        if other.wait_poll_interval_ms != defaults.wait_poll_interval_ms {
            self.wait_poll_interval_ms = other.wait_poll_interval_ms;
        }
    }
}
