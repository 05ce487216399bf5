//! 主机与来宾之间的消息定义（请求/响应信封）。
//!
//! 协议形态：
//! - JSON 序列化，字段名使用 PascalCase（`RequestId`、`RequestType`、`Timestamp` 等）
//! - 请求通过 `RequestType` 字段区分类型，响应通过 `ResponseType` 字段区分类型
//! - `Timestamp` 为 RFC 3339 UTC 时间
//!
//! 传输层只把信封当作不透明字符串；[`RequestMessage`] / [`ResponseMessage`] 是通道层的载体。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// 当前协议版本。
pub const PROTOCOL_VERSION: u32 = 1;

/// 成功。
pub const STATUS_SUCCESS: u32 = 0;
/// 请求无法解析或类型未知（E_INVALIDARG）。
pub const STATUS_INVALID_REQUEST: u32 = 0x8007_0057;
/// 请求执行失败（E_FAIL）。
pub const STATUS_FAILED: u32 = 0x8000_4005;
/// 队列已满（HRESULT_FROM_WIN32(ERROR_BUSY)）。
pub const STATUS_TOO_MANY_REQUESTS: u32 = 0x8007_00AA;

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// 通道层收到的一条完整请求。
///
/// - `request_id`：存储中的逻辑名，即主机写入时使用的通信 ID
/// - `request_data`：重组后的请求内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub request_id: String,
    pub request_data: String,
}

/// 通道层发送/收到的一条完整响应。
///
/// 进度响应的 `communication_id` 为 `<通信ID>_Progress_<序号>`，最终响应为通信 ID 本身。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub communication_id: String,
    pub response_data: String,
}

/// 请求信封。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestEnvelope {
    pub request_id: String,
    #[serde(flatten)]
    pub body: RequestBody,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// 请求类型及其参数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "RequestType", rename_all_fields = "PascalCase")]
pub enum RequestBody {
    GetVersion,
    IsUserLoggedIn,
    GetState,
    /// 确认已收到某条响应，来宾据此删除自己写出的分片。
    Ack { ack_communication_id: String },
    /// 应用一份配置文档（YAML 文本）。
    Configure { configure: String },
}

impl RequestBody {
    /// 类型名，与 `RequestType` 字段取值一致。
    pub fn type_name(&self) -> &'static str {
        match self {
            RequestBody::GetVersion => "GetVersion",
            RequestBody::IsUserLoggedIn => "IsUserLoggedIn",
            RequestBody::GetState => "GetState",
            RequestBody::Ack { .. } => "Ack",
            RequestBody::Configure { .. } => "Configure",
        }
    }
}

impl RequestEnvelope {
    /// 以随机 `RequestId` 和当前时间创建请求。
    pub fn new(body: RequestBody) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            body,
            version: PROTOCOL_VERSION,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// 配置应用结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Outcome", rename_all_fields = "PascalCase")]
pub enum ConfigurationOutcome {
    Applied,
    /// 配置文档无法打开/解析，附带出错位置。
    OpenFailed {
        result_code: u32,
        field: String,
        value: String,
        line: u32,
        column: u32,
    },
    Failed { result_code: u32, description: String },
}

impl ConfigurationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConfigurationOutcome::Applied)
    }
}

/// 来宾侧请求队列快照。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentState {
    #[serde(default)]
    pub running: Option<String>,
    #[serde(default)]
    pub queued: Vec<String>,
}

/// 响应信封。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    pub request_id: String,
    #[serde(flatten)]
    pub body: ResponseBody,
    pub status: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// 响应类型及其内容。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ResponseType", rename_all_fields = "PascalCase")]
pub enum ResponseBody {
    GetVersion { agent_version: String },
    IsUserLoggedIn { logged_in_users: Vec<String> },
    GetState { state: AgentState },
    /// 长任务执行过程中的进度文本。
    Progress { message: String },
    Configure { outcome: ConfigurationOutcome },
    TooManyRequests,
    Error,
}

impl ResponseEnvelope {
    pub fn new(request_id: impl Into<String>, body: ResponseBody) -> Self {
        Self {
            request_id: request_id.into(),
            body,
            status: STATUS_SUCCESS,
            error_description: None,
            version: PROTOCOL_VERSION,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// 失败响应，`status` 应为非 0 值。
    pub fn error(request_id: impl Into<String>, status: u32, description: impl Into<String>) -> Self {
        Self {
            status,
            error_description: Some(description.into()),
            ..Self::new(request_id, ResponseBody::Error)
        }
    }

    pub fn too_many_requests(request_id: impl Into<String>) -> Self {
        Self {
            status: STATUS_TOO_MANY_REQUESTS,
            error_description: Some("请求队列已满".to_string()),
            ..Self::new(request_id, ResponseBody::TooManyRequests)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestIdOnly {
    request_id: Option<String>,
}

/// 宽松地读取 `RequestId`：负载不是 JSON 或不含该字段时返回 `None`。
///
/// 用于无法完整解析的请求（仍需带上原 ID 回复错误）以及主机侧按 ID 过滤旧响应。
pub fn request_id_of(raw: &str) -> Option<String> {
    serde_json::from_str::<RequestIdOnly>(raw).ok()?.request_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn request_uses_pascal_case_wire_names() {
        let request = RequestEnvelope::new(RequestBody::Ack {
            ack_communication_id: "DevSetup{3}".to_string(),
        });
        let value: Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(value["RequestType"], "Ack");
        assert_eq!(value["AckCommunicationId"], "DevSetup{3}");
        assert_eq!(value["Version"], 1);
        assert!(value["RequestId"].is_string());
        assert!(value["Timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn parses_request_with_seven_digit_fraction() {
        let raw = r#"{"RequestId":"DevSetup{1}","RequestType":"GetVersion","Version":1,"Timestamp":"2023-11-21T08:08:58.6287789Z"}"#;
        let request = RequestEnvelope::from_json(raw).unwrap();
        assert_eq!(request.body, RequestBody::GetVersion);
        assert_eq!(request.request_id, "DevSetup{1}");
    }

    #[test]
    fn unknown_request_type_is_rejected_but_id_is_recoverable() {
        let raw = r#"{"RequestId":"abc","RequestType":"Reboot","Timestamp":"2023-11-21T08:08:58Z"}"#;
        assert!(RequestEnvelope::from_json(raw).is_err());
        assert_eq!(request_id_of(raw).as_deref(), Some("abc"));
        assert_eq!(request_id_of("not json"), None);
    }

    #[test]
    fn configuration_outcome_is_tagged() {
        let response = ResponseEnvelope::new(
            "r1",
            ResponseBody::Configure {
                outcome: ConfigurationOutcome::OpenFailed {
                    result_code: 0x8A15_C001,
                    field: "resources".to_string(),
                    value: "x".to_string(),
                    line: 3,
                    column: 5,
                },
            },
        );
        let json = response.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ResponseType"], "Configure");
        assert_eq!(value["Outcome"]["Outcome"], "OpenFailed");
        assert_eq!(value["Outcome"]["Line"], 3);
        assert_eq!(ResponseEnvelope::from_json(&json).unwrap(), response);
    }

    #[test]
    fn error_responses_carry_non_zero_status() {
        let busy = ResponseEnvelope::too_many_requests("r2");
        assert!(!busy.is_success());
        assert_eq!(busy.body, ResponseBody::TooManyRequests);

        let invalid = ResponseEnvelope::error("r3", STATUS_INVALID_REQUEST, "bad");
        let value: Value = serde_json::from_str(&invalid.to_json().unwrap()).unwrap();
        assert_eq!(value["ResponseType"], "Error");
        assert_eq!(value["ErrorDescription"], "bad");
        assert_eq!(value["Status"], STATUS_INVALID_REQUEST);
    }
}
