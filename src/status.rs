use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 上报时携带的固定工作节点标识
pub const WORKER_ID: &str = "github-actions";

const STATUS_PATH: &str = "/api/stream-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Streaming,
    Stopped,
    Error,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Streaming => "streaming",
            StreamStatus::Stopped => "stopped",
            StreamStatus::Error => "error",
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    status: StreamStatus,
    timestamp: String,
    worker: &'a str,
}

/// 向外部服务上报生命周期状态
///
/// 未配置地址时所有调用均为空操作；网络错误只记录警告，从不向上传播。
#[derive(Debug, Clone)]
pub struct StatusReporter {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl StatusReporter {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client for status reports: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            endpoint: base_url.map(|base| format!("{}{}", base.trim_end_matches('/'), STATUS_PATH)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    pub async fn report(&self, status: StreamStatus) {
        let Some(endpoint) = &self.endpoint else {
            debug!("Status reporting disabled, skipping '{}'", status.as_str());
            return;
        };

        let payload = StatusPayload {
            status,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            worker: WORKER_ID,
        };

        let result = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => info!("Status reported: {}", status.as_str()),
            Err(e) => warn!("Could not report status '{}': {}", status.as_str(), e),
        }
    }
}
