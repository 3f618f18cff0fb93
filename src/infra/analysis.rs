//! 失败分析客户端
//!
//! 将部署日志末尾发送到外部文本补全接口，获取故障诊断和修复建议。
//! 尽力而为：失败只会被报告，永远不会改变部署状态。

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// 接口协议版本
const API_VERSION: &str = "2023-06-01";

/// 固定的诊断指令
const INSTRUCTION: &str = "You are a Docker and deployment expert. Analyze the following \
deployment log, explain what went wrong in plain language, and give concrete, practical \
steps to fix it:";

/// 分析块分隔符
pub const ANALYSIS_BEGIN: &str = "--- ANALYSIS ---";
pub const ANALYSIS_END: &str = "--- END ANALYSIS ---";

/// 分析错误
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("No analysis API key configured.")]
    MissingKey,

    #[error("analysis request failed: {0}")]
    Request(String),

    #[error("analysis request timed out")]
    Timeout,

    #[error("analysis API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid analysis API response: {0}")]
    InvalidResponse(String),
}

/// 失败分析器
#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    /// 分析日志末尾，返回诊断文本
    async fn analyze(&self, api_key: &str, log_tail: &str) -> Result<String, AnalysisError>;
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message; 1],
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// 文本补全 HTTP 客户端
///
/// 复用连接池，每个请求独立超时
#[derive(Clone)]
pub struct AnalysisClient {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

impl AnalysisClient {
    /// 创建客户端
    ///
    /// # Arguments
    /// * `endpoint` - 文本补全接口 URL
    /// * `model` - 模型名称
    /// * `timeout` - 单次请求超时
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            max_tokens: 1024,
        })
    }
}

#[async_trait]
impl FailureAnalyzer for AnalysisClient {
    async fn analyze(&self, api_key: &str, log_tail: &str) -> Result<String, AnalysisError> {
        if api_key.is_empty() {
            return Err(AnalysisError::MissingKey);
        }

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: [Message {
                role: "user",
                content: format!("{}\n\n{}", INSTRUCTION, log_tail),
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout
                } else {
                    AnalysisError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AnalysisError::Request(e.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Analysis API returned an error");
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body: truncate_chars(&text, 200).to_string(),
            });
        }

        let analysis = extract_text(&text)?;
        info!(chars = analysis.len(), "Received failure analysis");
        Ok(analysis)
    }
}

/// 解析接口响应，取第一个文本块
fn extract_text(body: &str) -> Result<String, AnalysisError> {
    let parsed: MessagesResponse =
        serde_json::from_str(body).map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;
    parsed
        .content
        .into_iter()
        .find_map(|block| block.text)
        .ok_or_else(|| AnalysisError::InvalidResponse("no text content".to_string()))
}

/// 取日志最后 `max_chars` 个字符（按字符边界截断）
pub fn log_tail(log: &str, max_chars: usize) -> &str {
    let count = log.chars().count();
    if count <= max_chars {
        return log;
    }
    match log.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &log[idx..],
        None => log,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// 追加到部署日志的分析块
pub fn format_analysis_block(analysis: &str) -> String {
    format!("\n{}\n{}\n{}", ANALYSIS_BEGIN, analysis.trim(), ANALYSIS_END)
}
