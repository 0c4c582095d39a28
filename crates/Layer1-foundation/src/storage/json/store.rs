//! JSON 파일 저장소

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// 글로벌/프로젝트 디렉토리 이름
pub const APP_DIR_NAME: &str = "conductor";

/// JSON 파일 저장소
///
/// `filename`은 base_dir 기준 상대 경로이며 하위 디렉토리를 포함할 수 있다
/// (예: `linkage/feature-a/task-1.json`).
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// 글로벌 설정 (~/.config/conductor/)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join(APP_DIR_NAME);
        Ok(Self::new(dir))
    }

    /// 프로젝트 설정 (.conductor/)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(format!(".{}", APP_DIR_NAME)))
    }

    /// 현재 디렉토리 프로젝트 설정
    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.base_dir);
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// JSON 로드
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let path = self.file_path(filename);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// JSON 로드 (Optional)
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(None);
        }
        self.load(filename).map(Some)
    }

    /// JSON 저장
    pub fn save<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let path = self.file_path(filename);
        self.ensure_parent(&path)?;
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Storage(format!("Failed to serialize: {}", e)))?;
        std::fs::write(&path, content)
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// 기존 JSON 객체에 필드를 병합하여 저장 (없으면 새로 생성)
    ///
    /// `patch`의 최상위 필드가 기존 값을 덮어쓴다. 기존 파일이 객체가 아니면
    /// `patch`로 교체한다.
    pub fn patch(&self, filename: &str, patch: &serde_json::Value) -> Result<serde_json::Value> {
        let mut current = self
            .load_optional::<serde_json::Value>(filename)?
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        match (current.as_object_mut(), patch.as_object()) {
            (Some(target), Some(fields)) => {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            _ => current = patch.clone(),
        }

        self.save(filename, &current)?;
        Ok(current)
    }

    /// 파일 존재 여부
    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }

    /// 파일 삭제
    pub fn remove(&self, filename: &str) -> Result<()> {
        let path = self.file_path(filename);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                Error::Storage(format!("Failed to remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}
