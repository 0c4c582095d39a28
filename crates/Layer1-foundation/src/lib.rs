//! # conductor-foundation
//!
//! Foundation layer for Conductor:
//! - Error: 공통 에러 타입 (`Error`, `Result`)
//! - Config: 통합 설정 (ConductorConfig - concurrency, observer, spawn)
//! - Storage: JsonStore (설정 및 linkage 파일)

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    ConcurrencyConfig, ConductorConfig, ObserverConfig, SpawnConfig, CONDUCTOR_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;
