//! 来宾代理内置的请求类型。
//!
//! | RequestType | 状态请求 | 行为 |
//! |---|---|---|
//! | `GetVersion` | 是 | 返回代理版本 |
//! | `IsUserLoggedIn` | 是 | 返回交互式登录的用户 |
//! | `GetState` | 是 | 返回执行中/排队中的请求快照 |
//! | `Ack` | 是 | 删除被确认的响应，不回复 |
//! | `Configure` | 否 | 写出配置文档，执行外部命令，逐行上报输出 |
//!
//! 无法解析的请求回复 `Error`（非 0 状态）。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use guestlink_core::cancel::CancellationToken;
use guestlink_core::message::{
    request_id_of, AgentState, ConfigurationOutcome, RequestBody, RequestEnvelope, ResponseBody,
    ResponseEnvelope, STATUS_FAILED, STATUS_INVALID_REQUEST,
};
use guestlink_core::paths::ensure_dir;
use guestlink_core::request::{
    HostRequest, HostResponse, ProgressHandler, RequestContext, RequestFactory, ResponseSink,
};
use tracing::{info, warn};
use uuid::Uuid;

/// 配置文档无效（与 WinGet 配置错误码一致）。
pub const CONFIG_ERROR_INVALID_FILE: u32 = 0x8A15_C001;

/// 外部命令参数中的文档路径占位符。
pub const FILE_PLACEHOLDER: &str = "{file}";

/// 查询交互式用户的函数。
pub type UserLister = Arc<dyn Fn() -> Result<Vec<String>> + Send + Sync>;

/// `Configure` 请求的执行设置。
#[derive(Debug, Clone)]
pub struct ConfigureSettings {
    pub command: Vec<String>,
    pub work_dir: PathBuf,
}

/// 内置请求工厂。
pub struct BuiltinRequestFactory {
    agent_version: String,
    users: UserLister,
    configure: ConfigureSettings,
}

impl BuiltinRequestFactory {
    pub fn new(agent_version: impl Into<String>, users: UserLister, configure: ConfigureSettings) -> Self {
        Self {
            agent_version: agent_version.into(),
            users,
            configure,
        }
    }
}

impl RequestFactory for BuiltinRequestFactory {
    fn create(&self, context: RequestContext) -> Box<dyn HostRequest> {
        let communication_id = context.message.request_id.clone();
        let envelope = match RequestEnvelope::from_json(&context.message.request_data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(communication_id = %communication_id, error = %e, "无法解析的请求");
                return Box::new(InvalidRequest {
                    request_id: request_id_of(&context.message.request_data)
                        .unwrap_or_else(|| communication_id.clone()),
                    communication_id,
                    reason: e.to_string(),
                });
            }
        };

        let header = Header {
            request_id: envelope.request_id,
            communication_id,
            request_type: envelope.body.type_name(),
        };
        match envelope.body {
            RequestBody::GetVersion => Box::new(StatusRequest {
                header,
                answer: StatusAnswer::Version(self.agent_version.clone()),
            }),
            RequestBody::IsUserLoggedIn => Box::new(StatusRequest {
                header,
                answer: StatusAnswer::Users(Arc::clone(&self.users)),
            }),
            RequestBody::GetState => Box::new(StatusRequest {
                header,
                answer: StatusAnswer::State(context.state),
            }),
            RequestBody::Ack { ack_communication_id } => Box::new(AckRequest {
                header,
                acked: ack_communication_id,
                sink: context.sink,
            }),
            RequestBody::Configure { configure } => Box::new(ConfigureRequest {
                header,
                document: configure,
                settings: self.configure.clone(),
            }),
        }
    }
}

struct Header {
    request_id: String,
    communication_id: String,
    request_type: &'static str,
}

/// 为 [`HostRequest`] 生成与 [`Header`] 相关的访问方法。
macro_rules! header_accessors {
    () => {
        fn request_id(&self) -> &str {
            &self.header.request_id
        }

        fn communication_id(&self) -> &str {
            &self.header.communication_id
        }

        fn request_type(&self) -> &str {
            self.header.request_type
        }
    };
}

fn reply(envelope: &ResponseEnvelope) -> Result<HostResponse> {
    Ok(HostResponse::reply(envelope.to_json().context("序列化响应失败")?))
}

struct InvalidRequest {
    request_id: String,
    communication_id: String,
    reason: String,
}

impl HostRequest for InvalidRequest {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn communication_id(&self) -> &str {
        &self.communication_id
    }

    fn request_type(&self) -> &str {
        "Invalid"
    }

    fn is_status_request(&self) -> bool {
        true
    }

    fn execute(&mut self, _progress: &ProgressHandler, _cancel: &CancellationToken) -> Result<HostResponse> {
        reply(&ResponseEnvelope::error(
            self.request_id.clone(),
            STATUS_INVALID_REQUEST,
            format!("无法解析的请求: {}", self.reason),
        ))
    }
}

enum StatusAnswer {
    Version(String),
    Users(UserLister),
    State(AgentState),
}

struct StatusRequest {
    header: Header,
    answer: StatusAnswer,
}

impl HostRequest for StatusRequest {
    header_accessors!();

    fn is_status_request(&self) -> bool {
        true
    }

    fn execute(&mut self, _progress: &ProgressHandler, _cancel: &CancellationToken) -> Result<HostResponse> {
        let body = match &self.answer {
            StatusAnswer::Version(version) => ResponseBody::GetVersion {
                agent_version: version.clone(),
            },
            StatusAnswer::Users(list_users) => ResponseBody::IsUserLoggedIn {
                logged_in_users: list_users().context("查询登录用户失败")?,
            },
            StatusAnswer::State(state) => ResponseBody::GetState { state: state.clone() },
        };
        reply(&ResponseEnvelope::new(self.header.request_id.clone(), body))
    }
}

struct AckRequest {
    header: Header,
    acked: String,
    sink: Arc<dyn ResponseSink>,
}

impl HostRequest for AckRequest {
    header_accessors!();

    fn is_status_request(&self) -> bool {
        true
    }

    fn execute(&mut self, _progress: &ProgressHandler, _cancel: &CancellationToken) -> Result<HostResponse> {
        self.sink.delete_response(&self.acked);
        Ok(HostResponse::silent())
    }
}

struct ConfigureRequest {
    header: Header,
    document: String,
    settings: ConfigureSettings,
}

impl HostRequest for ConfigureRequest {
    header_accessors!();

    fn is_status_request(&self) -> bool {
        false
    }

    fn execute(&mut self, progress: &ProgressHandler, cancel: &CancellationToken) -> Result<HostResponse> {
        let request_id = self.header.request_id.clone();
        let outcome = self.apply(progress, cancel)?;
        let mut response = ResponseEnvelope::new(request_id, ResponseBody::Configure { outcome: outcome.clone() });
        match &outcome {
            ConfigurationOutcome::Applied => {}
            ConfigurationOutcome::OpenFailed { result_code, .. } => {
                response.status = *result_code;
                response.error_description = Some("配置文档无效".to_string());
            }
            ConfigurationOutcome::Failed { result_code, description } => {
                response.status = *result_code;
                response.error_description = Some(description.clone());
            }
        }
        reply(&response)
    }
}

impl ConfigureRequest {
    fn apply(&self, progress: &ProgressHandler, cancel: &CancellationToken) -> Result<ConfigurationOutcome> {
        if self.document.trim().is_empty() {
            return Ok(ConfigurationOutcome::OpenFailed {
                result_code: CONFIG_ERROR_INVALID_FILE,
                field: String::new(),
                value: String::new(),
                line: 0,
                column: 0,
            });
        }
        let Some((program, args)) = self.settings.command.split_first() else {
            return Ok(ConfigurationOutcome::Failed {
                result_code: STATUS_FAILED,
                description: "未配置执行命令".to_string(),
            });
        };

        ensure_dir(&self.settings.work_dir)?;
        let file = WorkFile(self.settings.work_dir.join(format!("{}.yaml", Uuid::new_v4())));
        std::fs::write(&file.0, &self.document)
            .with_context(|| format!("写入配置文档失败: {}", file.0.display()))?;
        let file_arg = file.0.to_string_lossy().into_owned();
        let args: Vec<String> = args.iter().map(|a| a.replace(FILE_PLACEHOLDER, &file_arg)).collect();

        info!(program = %program, communication_id = %self.header.communication_id, "开始应用配置");
        let mut child = match Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Ok(ConfigurationOutcome::Failed {
                    result_code: STATUS_FAILED,
                    description: format!("启动 {program} 失败: {e}"),
                })
            }
        };

        let (tx, rx) = mpsc::channel::<String>();
        let stdout_reader = child.stdout.take().map(|stdout| {
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).split(b'\n').map_while(|l| l.ok()) {
                    let text = String::from_utf8_lossy(&line).trim_end().to_string();
                    if !text.is_empty() && tx.send(text).is_err() {
                        break;
                    }
                }
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });

        let mut cancelled = false;
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(line) => {
                    let envelope =
                        ResponseEnvelope::new(self.header.request_id.clone(), ResponseBody::Progress { message: line });
                    if let Err(e) = progress.report(envelope.to_json()?) {
                        warn!(error = %e, "写出进度失败");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if cancel.is_cancelled() {
                cancelled = true;
                let _ = child.kill();
                break;
            }
        }

        let status = child.wait().context("等待配置命令退出失败")?;
        if let Some(handle) = stdout_reader {
            let _ = handle.join();
        }
        let stderr = stderr_reader.and_then(|h| h.join().ok()).unwrap_or_default();

        if cancelled {
            return Ok(ConfigurationOutcome::Failed {
                result_code: STATUS_FAILED,
                description: "已取消".to_string(),
            });
        }
        if status.success() {
            info!(communication_id = %self.header.communication_id, "配置应用完成");
            return Ok(ConfigurationOutcome::Applied);
        }
        // 退出码按 u32 位模式保留（HRESULT 为负数）
        let code = status.code().map(|c| c as u32).unwrap_or(STATUS_FAILED);
        Ok(ConfigurationOutcome::Failed {
            result_code: if code == 0 { STATUS_FAILED } else { code },
            description: if stderr.is_empty() {
                format!("{program} 退出: {status}")
            } else {
                stderr
            },
        })
    }
}

/// 配置文档临时文件，离开作用域时删除。
struct WorkFile(PathBuf);

impl Drop for WorkFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestlink_core::message::{RequestMessage, ResponseMessage};
    use guestlink_core::store::StoreError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<ResponseMessage>>,
        deleted: Mutex<Vec<String>>,
    }

    impl ResponseSink for RecordingSink {
        fn send_response(&self, response: &ResponseMessage) -> Result<(), StoreError> {
            self.sent.lock().unwrap().push(response.clone());
            Ok(())
        }

        fn delete_response(&self, communication_id: &str) {
            self.deleted.lock().unwrap().push(communication_id.to_string());
        }
    }

    struct CleanupDir(PathBuf);

    impl Drop for CleanupDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn factory(command: Vec<String>, work_dir: PathBuf) -> BuiltinRequestFactory {
        BuiltinRequestFactory::new(
            "1.2.3",
            Arc::new(|| Ok(vec!["alice".to_string()])),
            ConfigureSettings { command, work_dir },
        )
    }

    fn run(factory: &BuiltinRequestFactory, sink: &Arc<RecordingSink>, body: &str) -> (Box<dyn HostRequest>, HostResponse) {
        let context = RequestContext {
            message: RequestMessage {
                request_id: "DevSetup{1}".to_string(),
                request_data: body.to_string(),
            },
            state: AgentState {
                running: Some("Configure(DevSetup{0})".to_string()),
                queued: Vec::new(),
            },
            sink: sink.clone(),
        };
        let mut request = factory.create(context);
        let progress = ProgressHandler::new(sink.clone(), "DevSetup{1}");
        let response = request.execute(&progress, &CancellationToken::new()).unwrap();
        (request, response)
    }

    fn envelope(body: RequestBody) -> String {
        RequestEnvelope::new(body).to_json().unwrap()
    }

    #[test]
    fn status_requests_answer_inline() {
        let sink = Arc::new(RecordingSink::default());
        let f = factory(Vec::new(), std::env::temp_dir());

        let (request, response) = run(&f, &sink, &envelope(RequestBody::GetVersion));
        assert!(request.is_status_request());
        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        assert_eq!(parsed.body, ResponseBody::GetVersion { agent_version: "1.2.3".to_string() });

        let (_, response) = run(&f, &sink, &envelope(RequestBody::IsUserLoggedIn));
        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        assert_eq!(
            parsed.body,
            ResponseBody::IsUserLoggedIn { logged_in_users: vec!["alice".to_string()] }
        );

        let (_, response) = run(&f, &sink, &envelope(RequestBody::GetState));
        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        match parsed.body {
            ResponseBody::GetState { state } => assert!(state.running.is_some()),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn ack_deletes_response_without_reply() {
        let sink = Arc::new(RecordingSink::default());
        let f = factory(Vec::new(), std::env::temp_dir());
        let body = envelope(RequestBody::Ack {
            ack_communication_id: "DevSetup{7}_Progress_2".to_string(),
        });
        let (_, response) = run(&f, &sink, &body);
        assert!(!response.send_response);
        assert_eq!(*sink.deleted.lock().unwrap(), vec!["DevSetup{7}_Progress_2".to_string()]);
    }

    #[test]
    fn unparseable_request_gets_error_with_original_id() {
        let sink = Arc::new(RecordingSink::default());
        let f = factory(Vec::new(), std::env::temp_dir());
        let (request, response) = run(&f, &sink, r#"{"RequestId":"r9","RequestType":"Reboot"}"#);
        assert!(request.is_status_request());
        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        assert_eq!(parsed.request_id, "r9");
        assert_eq!(parsed.status, STATUS_INVALID_REQUEST);
    }

    #[test]
    fn empty_configuration_document_fails_to_open() {
        let sink = Arc::new(RecordingSink::default());
        let f = factory(vec!["unused".to_string()], std::env::temp_dir());
        let (request, response) = run(&f, &sink, &envelope(RequestBody::Configure { configure: "  ".to_string() }));
        assert!(!request.is_status_request());
        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        assert_eq!(parsed.status, CONFIG_ERROR_INVALID_FILE);
        assert!(matches!(
            parsed.body,
            ResponseBody::Configure { outcome: ConfigurationOutcome::OpenFailed { .. } }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn configure_streams_output_as_progress() {
        let dir = CleanupDir(std::env::temp_dir().join(format!("guestlink-agent-{}", Uuid::new_v4())));
        let sink = Arc::new(RecordingSink::default());
        let command = vec!["sh".to_string(), "-c".to_string(), "cat \"$0\"; echo done".to_string(), FILE_PLACEHOLDER.to_string()];
        let f = factory(command, dir.0.clone());
        let body = envelope(RequestBody::Configure {
            configure: "properties:\n  resources: []".to_string(),
        });
        let (_, response) = run(&f, &sink, &body);

        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.body, ResponseBody::Configure { outcome: ConfigurationOutcome::Applied });

        let progress: Vec<String> = sink
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| match ResponseEnvelope::from_json(&m.response_data).unwrap().body {
                ResponseBody::Progress { message } => message,
                other => panic!("unexpected body {other:?}"),
            })
            .collect();
        assert_eq!(progress, vec!["properties:", "  resources: []", "done"]);
        let names: Vec<String> = sink.sent.lock().unwrap().iter().map(|m| m.communication_id.clone()).collect();
        assert_eq!(names[0], "DevSetup{1}_Progress_1");
        // 工作文件已删除
        assert_eq!(std::fs::read_dir(&dir.0).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_exit_code_and_stderr() {
        let dir = CleanupDir(std::env::temp_dir().join(format!("guestlink-agent-{}", Uuid::new_v4())));
        let sink = Arc::new(RecordingSink::default());
        let command = vec!["sh".to_string(), "-c".to_string(), "echo broken >&2; exit 3".to_string()];
        let f = factory(command, dir.0.clone());
        let body = envelope(RequestBody::Configure { configure: "x: 1".to_string() });
        let (_, response) = run(&f, &sink, &body);
        let parsed = ResponseEnvelope::from_json(&response.data).unwrap();
        assert_eq!(parsed.status, 3);
        assert_eq!(
            parsed.body,
            ResponseBody::Configure {
                outcome: ConfigurationOutcome::Failed { result_code: 3, description: "broken".to_string() }
            }
        );
    }
}
