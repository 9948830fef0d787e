//! 생존 신호 파일.
//!
//! 외부 프로세스 감독자(systemd, Kubernetes exec probe 등)가 읽을 수 있도록
//! 헬스 체크마다 마지막 시각과 전체 상태를 파일에 기록합니다.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 생존 신호 내용.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// RFC3339 시각
    pub timestamp: String,
    pub healthy: bool,
    /// "normal" | "degraded"
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 생존 신호 기록기.
pub struct LivenessMarker {
    path: Option<PathBuf>,
    last_beat: Mutex<Option<DateTime<Utc>>>,
}

impl LivenessMarker {
    /// `path`가 `None`이면 파일 없이 시각만 기록합니다.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            last_beat: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// 생존 신호를 기록합니다. 파일 쓰기 실패는 로그만 남깁니다.
    pub async fn beat(&self, healthy: bool, mode: &str, reason: Option<&str>) {
        let now = Utc::now();
        *self.last_beat.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);

        let Some(path) = &self.path else {
            return;
        };
        let heartbeat = Heartbeat {
            timestamp: now.to_rfc3339(),
            healthy,
            mode: mode.to_string(),
            reason: reason.map(String::from),
        };
        if let Err(e) = write_atomic(path, &heartbeat).await {
            warn!(path = %path.display(), error = %e, "Failed to write liveness marker");
        }
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        *self.last_beat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 기록된 생존 신호를 읽습니다.
    pub async fn read(&self) -> Option<Heartbeat> {
        let raw = tokio::fs::read_to_string(self.path.as_ref()?).await.ok()?;
        serde_json::from_str(&raw).ok()
    }
}

async fn write_atomic(path: &PathBuf, heartbeat: &Heartbeat) -> std::io::Result<()> {
    let body = serde_json::to_vec(heartbeat)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}
