//! 시크릿 클라이언트.
//!
//! 거래소 자격 증명, DB URL, 수집 대상 목록(심볼/타임프레임)을 조회합니다.
//!
//! - 1차 저장소: [`SecretStore`] 구현 (기본은 키별 파일 디렉토리, 예: `/run/secrets`)
//! - 대체 경로: 프로세스 환경 변수
//!
//! 클라이언트는 전역 싱글톤이 아니라 명시적으로 생성되어 수집기/감독자에 주입되며,
//! `init()`/`close()` 수명 주기를 가집니다. 대체 경로 사용 여부는 [`SecretsHealth`]로
//! 드러나고 헬스 체크 대상이 됩니다.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use feed_core::SecretsConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 시크릿 에러.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secrets client is not initialized")]
    NotInitialized,

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    #[error("malformed secret {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("secret backend error: {0}")]
    Backend(String),
}

/// 시크릿 저장소 백엔드.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &str;

    /// 키에 해당하는 값. 없으면 `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<SecretString>, SecretsError>;

    /// 백엔드 접근 가능 여부.
    async fn health_check(&self) -> Result<(), SecretsError>;
}

// ============================================================================
// 파일 기반 저장소
// ============================================================================

/// 키 하나당 파일 하나인 디렉토리 저장소 (Docker/Kubernetes secrets 형식).
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SecretsError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(SecretsError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<SecretString>, SecretsError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(SecretString::from(raw.trim_end().to_string()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SecretsError::Backend(format!("{}: {}", path.display(), e))),
        }
    }

    async fn health_check(&self) -> Result<(), SecretsError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SecretsError::Backend(format!(
                "{} is not a directory",
                self.dir.display()
            ))),
            Err(e) => Err(SecretsError::Backend(format!("{}: {}", self.dir.display(), e))),
        }
    }
}

// ============================================================================
// 클라이언트
// ============================================================================

/// 시크릿 접근 경로 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsHealth {
    /// 1차 저장소 정상
    Primary,
    /// 1차 저장소 불가, 환경 변수로 필요한 키를 모두 조회 가능
    Fallback,
    /// 초기화 전/종료 후이거나 필요한 키를 조회할 수 없음
    Unavailable,
}

/// 시크릿 클라이언트.
pub struct SecretsClient {
    primary: Option<Arc<dyn SecretStore>>,
    required_keys: Vec<String>,
    initialized: AtomicBool,
    primary_available: AtomicBool,
}

impl SecretsClient {
    /// 1차 저장소를 지정해 생성합니다. `None`이면 환경 변수만 사용합니다.
    pub fn new(primary: Option<Arc<dyn SecretStore>>) -> Self {
        Self {
            primary,
            required_keys: Vec::new(),
            initialized: AtomicBool::new(false),
            primary_available: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &SecretsConfig) -> Self {
        let primary = config
            .dir
            .as_ref()
            .map(|dir| Arc::new(FileSecretStore::new(dir)) as Arc<dyn SecretStore>);
        Self::new(primary)
    }

    /// 대체 경로 헬스 체크에서 반드시 조회 가능해야 하는 키.
    pub fn with_required_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// 클라이언트를 초기화합니다. 1차 저장소를 확인하고 현재 상태를 반환합니다.
    pub async fn init(&self) -> SecretsHealth {
        self.initialized.store(true, Ordering::Release);
        let primary_ok = self.check_primary().await;
        self.primary_available.store(primary_ok, Ordering::Release);

        let health = self.health().await;
        info!(
            backend = self.primary.as_ref().map(|p| p.name()).unwrap_or("env"),
            health = ?health,
            "Secrets client initialized"
        );
        health
    }

    /// 클라이언트를 닫습니다. 이후 조회는 `NotInitialized`로 실패합니다.
    pub fn close(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.primary_available.store(false, Ordering::Release);
            info!("Secrets client closed");
        }
    }

    /// 닫고 다시 초기화합니다 (복구 동작).
    pub async fn reinit(&self) -> SecretsHealth {
        self.close();
        self.init().await
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn check_primary(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };
        match primary.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = primary.name(), error = %e, "Primary secret store unavailable");
                false
            }
        }
    }

    /// 현재 접근 경로 상태를 점검합니다.
    pub async fn health(&self) -> SecretsHealth {
        if !self.is_initialized() {
            return SecretsHealth::Unavailable;
        }

        let primary_ok = self.check_primary().await;
        self.primary_available.store(primary_ok, Ordering::Release);
        if primary_ok {
            return SecretsHealth::Primary;
        }

        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .filter(|key| env_lookup(key).is_none())
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            SecretsHealth::Fallback
        } else {
            debug!(?missing, "Environment fallback is missing required keys");
            SecretsHealth::Unavailable
        }
    }

    /// 문자열 시크릿을 조회합니다.
    pub async fn get_string(&self, key: &str) -> Result<SecretString, SecretsError> {
        self.get_optional(key)
            .await?
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    /// 문자열 시크릿을 조회합니다. 어디에도 없으면 `Ok(None)`.
    pub async fn get_optional(&self, key: &str) -> Result<Option<SecretString>, SecretsError> {
        if !self.is_initialized() {
            return Err(SecretsError::NotInitialized);
        }

        if let Some(primary) = self.primary.as_ref().filter(|_| self.primary_available.load(Ordering::Acquire)) {
            match primary.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(SecretsError::InvalidKey(k)) => return Err(SecretsError::InvalidKey(k)),
                Err(e) => {
                    warn!(key, error = %e, "Primary secret lookup failed, using environment");
                    self.primary_available.store(false, Ordering::Release);
                }
            }
        }

        Ok(env_lookup(key))
    }

    /// 목록 시크릿을 조회합니다. JSON 배열 또는 쉼표 구분 문자열을 받습니다.
    pub async fn get_list(&self, key: &str) -> Result<Vec<String>, SecretsError> {
        let raw = self.get_string(key).await?;
        parse_list(key, raw.expose_secret())
    }
}

fn env_lookup(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn parse_list(key: &str, raw: &str) -> Result<Vec<String>, SecretsError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let items: Vec<String> = serde_json::from_str(trimmed).map_err(|e| SecretsError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect());
    }

    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}
