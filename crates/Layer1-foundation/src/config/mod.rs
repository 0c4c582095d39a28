//! Config - 통합 설정 관리
//!
//! - `limits.rs` - 리소스 키별 동시 실행 제한
//! - `conductor.rs` - ConductorConfig 통합 설정 (observer, spawn 포함)

mod conductor;
mod limits;

pub use conductor::{ConductorConfig, ObserverConfig, SpawnConfig, CONDUCTOR_CONFIG_FILE};
pub use limits::{
    ConcurrencyConfig, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_MIN_START_INTERVAL_MS,
    DEFAULT_QUEUE_TIMEOUT_MS,
};
