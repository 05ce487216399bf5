//! 与指定虚拟机的一次请求会话。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use guestlink_core::cancel::CancellationToken;
use guestlink_core::config::{load_or_default, HostConfig};
use guestlink_core::host::HostChannel;
use guestlink_core::message::{RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope, ResponseMessage};
use guestlink_core::paths;
use guestlink_core::session::GuestSession;
use guestlink_core::state::SessionCheckpoint;
use guestlink_core::store::KvpStore;
use guestlink_windows::vmkvp::{find_vm, VmKvpStore};
use tracing::{info, warn};

use crate::Cli;

/// 执行一次请求并打印结果。
///
/// 主要步骤：
/// 1) 读取配置并定位虚拟机
/// 2) 从检查点恢复通信 ID 计数
/// 3) 在阻塞线程中发送请求并等待响应，同时监听 Ctrl-C
/// 4) 保存检查点，输出最终响应
///
/// 异常处理：
/// - 虚拟机不存在、会话失败：返回错误
/// - 来宾返回非 0 状态：打印响应后返回错误
pub async fn execute(cli: Cli, body: RequestBody) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::default_host_config()?,
    };
    let config: HostConfig = load_or_default(&config_path)?;
    let timeout = cli
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.response_timeout());

    let vm = tokio::task::spawn_blocking({
        let name = cli.vm.clone();
        move || find_vm(&name)
    })
    .await
    .context("定位虚拟机的任务异常退出")??;
    info!(vm = %vm.element_name, id = %vm.name, "已定位虚拟机");

    let sessions_dir = match &config.state_dir {
        Some(dir) => dir.clone(),
        None => paths::default_sessions_dir()?,
    };
    let checkpoint_path = paths::session_file(&sessions_dir, &vm.name);

    let cancel = CancellationToken::new();
    let request = RequestEnvelope::new(body);
    let worker = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        let vm_id = vm.name.clone();
        let checkpoint_path = checkpoint_path.clone();
        move || -> Result<ResponseEnvelope> {
            let store: Arc<dyn KvpStore> = Arc::new(VmKvpStore::new(vm_id.clone())?);
            let channel = HostChannel::new(Arc::clone(&store), store, config.protocol.codec());
            let session = GuestSession::new(channel).with_poll_interval(config.protocol.poll_interval());
            if let Some(checkpoint) = SessionCheckpoint::load(&checkpoint_path)? {
                session.set_next_communication_id_counter(checkpoint.next_communication_id);
            }

            let result = session.run_request(&request, timeout, &cancel, print_progress);

            let checkpoint = SessionCheckpoint::new(vm_id, session.next_communication_id_counter());
            if let Err(e) = checkpoint.save(&checkpoint_path) {
                warn!(error = %format!("{e:#}"), "保存会话检查点失败");
            }
            Ok(result?)
        }
    });

    let response = tokio::select! {
        joined = worker => joined.context("请求任务异常退出")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("收到 Ctrl-C，正在取消请求");
            cancel.cancel();
            bail!("请求已取消");
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.is_success() {
        bail!(
            "来宾返回失败状态 0x{:08X}: {}",
            response.status,
            response.error_description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// 打印进度消息；最终响应由调用方输出。
fn print_progress(message: &ResponseMessage) {
    if let Ok(envelope) = ResponseEnvelope::from_json(&message.response_data) {
        if let ResponseBody::Progress { message } = envelope.body {
            eprintln!("{message}");
        }
    }
}
