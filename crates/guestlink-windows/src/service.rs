//! 来宾代理的 Windows 服务注册/注销（基于 `windows-service` crate）。
//!
//! 权限要求：
//! - 创建/删除服务需要管理员权限
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::ffi::OsString;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use windows_service::service::{
    ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState, ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

/// 默认服务名。
pub const DEFAULT_SERVICE_NAME: &str = "GuestLinkAgent";

const DISPLAY_NAME: &str = "GuestLink Guest Agent";
const DESCRIPTION: &str = "通过 Hyper-V 数据交换接收主机请求并在来宾内执行配置任务。";

/// 安装或更新代理服务（LocalSystem，自动启动）。
///
/// 参数：
/// - `service_name`：服务名
/// - `exe`：代理可执行文件路径
/// - `args`：服务启动参数
///
/// 异常处理：
/// - 打开服务管理器失败：返回错误
/// - 服务已存在（1073）时改为打开已有服务并更新描述，允许重复安装
pub fn install_service(service_name: &str, exe: &Path, args: &[String]) -> Result<()> {
    let manager_access = ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE;
    let service_manager =
        ServiceManager::local_computer(None::<&str>, manager_access).context("打开 ServiceManager 失败")?;

    let service_info = ServiceInfo {
        name: OsString::from(service_name),
        display_name: OsString::from(DISPLAY_NAME),
        service_type: ServiceType::OWN_PROCESS,
        start_type: ServiceStartType::AutoStart,
        error_control: ServiceErrorControl::Normal,
        executable_path: exe.to_path_buf(),
        launch_arguments: args.iter().map(OsString::from).collect(),
        dependencies: vec![],
        account_name: None,
        account_password: None,
    };

    let service = service_manager
        .create_service(&service_info, ServiceAccess::CHANGE_CONFIG)
        .or_else(|e| match e {
            windows_service::Error::Winapi(e) if e.raw_os_error() == Some(1073) => {
                Ok(service_manager.open_service(service_name, ServiceAccess::CHANGE_CONFIG)?)
            }
            other => Err(other),
        })
        .context("创建/打开服务失败")?;

    service.set_description(DESCRIPTION).context("设置服务描述失败")?;
    info!(service_name, exe = %exe.display(), "服务已安装");
    Ok(())
}

/// 停止（若在运行）并删除代理服务。
///
/// 异常处理：
/// - 打开服务或删除服务失败时返回错误（通常是权限不足或服务不存在）
/// - 停止失败只记录日志，删除会在服务停止后生效
pub fn uninstall_service(service_name: &str) -> Result<()> {
    let service_manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
        .context("打开 ServiceManager 失败")?;
    let service = service_manager
        .open_service(
            service_name,
            ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE,
        )
        .with_context(|| format!("打开服务失败: {service_name}"))?;

    let running = service
        .query_status()
        .map(|status| status.current_state != ServiceState::Stopped)
        .unwrap_or(false);
    if running {
        if let Err(e) = service.stop() {
            tracing::warn!(service_name, error = %e, "停止服务失败");
        }
    }
    service.delete().with_context(|| format!("删除服务失败: {service_name}"))?;
    info!(service_name, "服务已删除");
    Ok(())
}
