//! Storage module for Conductor
//!
//! - `json`: JSON - 설정 및 linkage 파일 저장/로드

mod json;

// JSON Storage (범용)
pub use json::JsonStore;
