//! 代理进程：参数解析、日志初始化、服务调度与主循环装配。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use guestlink_core::cancel::CancellationToken;
use guestlink_core::config::{load_or_default, AgentConfig};
use guestlink_core::guest::GuestChannel;
use guestlink_core::notifier::EventNotifier;
use guestlink_core::paths;
use guestlink_core::request::RequestManager;
use guestlink_core::store::KvpStore;
use guestlink_windows::registry::{hive_name, RegistryKvpStore};
use guestlink_windows::watcher::RegistryChangeSource;
use guestlink_windows::{elevation, process, service};
use once_cell::sync::OnceCell;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::{define_windows_service, service_dispatcher};

use crate::requests::{BuiltinRequestFactory, ConfigureSettings};

/// 运行参数。
///
/// 说明：
/// - `--run-console`：以控制台模式运行（用于开发调试）
/// - `--service-name`：服务名（与安装时保持一致）
/// - `--config`：配置文件路径，缺省为 `%ProgramData%\GuestLink\agent.json`
#[derive(Debug, Parser)]
#[command(name = "guestlink-agent", version)]
struct Args {
    #[arg(long, default_value_t = false)]
    run_console: bool,

    #[arg(long, default_value = service::DEFAULT_SERVICE_NAME)]
    service_name: String,

    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 将当前可执行文件注册为自动启动的服务。
    Install,
    /// 停止并删除服务。
    Uninstall,
}

/// 服务名（由命令行参数注入，供 `service_dispatcher` 回调使用）。
static SERVICE_NAME: OnceCell<String> = OnceCell::new();

/// 配置文件路径（服务回调中读取）。
static CONFIG_PATH: OnceCell<Option<PathBuf>> = OnceCell::new();

/// 停止信号（SCM Stop 控制码或 Ctrl-C 触发）。
static STOP: OnceCell<CancellationToken> = OnceCell::new();

fn stop_token() -> &'static CancellationToken {
    STOP.get_or_init(CancellationToken::new)
}

/// 程序入口：根据参数选择子命令、控制台模式或服务模式。
///
/// 异常处理：
/// - 服务调度器启动失败会返回错误（通常是直接双击运行而非由 SCM 启动）
pub fn main() -> Result<()> {
    let args = Args::parse();
    CONFIG_PATH.set(args.config.clone()).ok();

    match args.command {
        Some(Commands::Install) => {
            init_console_logging();
            elevation::require_admin("安装服务")?;
            let exe = std::env::current_exe().context("获取当前可执行文件路径失败")?;
            let mut launch = vec!["--service-name".to_string(), args.service_name.clone()];
            if let Some(config) = &args.config {
                launch.push("--config".to_string());
                launch.push(config.display().to_string());
            }
            return service::install_service(&args.service_name, &exe, &launch);
        }
        Some(Commands::Uninstall) => {
            init_console_logging();
            elevation::require_admin("删除服务")?;
            return service::uninstall_service(&args.service_name);
        }
        None => {}
    }

    if args.run_console {
        init_console_logging();
        spawn_ctrl_c_listener();
        return run_agent_loop();
    }

    let _log_guard = init_file_logging();
    SERVICE_NAME.set(args.service_name).ok();
    let service_name = SERVICE_NAME.get().map(String::as_str).unwrap_or(service::DEFAULT_SERVICE_NAME);
    service_dispatcher::start(service_name, ffi_service_main).context("启动服务调度器失败")?;
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_console_logging() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).with_target(false).init();
}

/// 服务模式日志：按天滚动写入日志目录；目录不可用时退回标准输出。
///
/// 返回值：
/// - 文件日志的后台写线程守卫，进程退出前需保持存活以刷新缓冲
fn init_file_logging() -> Option<WorkerGuard> {
    let dir = paths::default_log_dir().and_then(|dir| paths::ensure_dir(&dir).map(|_| dir));
    match dir {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "guestlink-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(false))
                .init();
            Some(guard)
        }
        Err(_) => {
            init_console_logging();
            None
        }
    }
}

/// 后台线程等待 Ctrl-C，收到后触发停止信号。
fn spawn_ctrl_c_listener() {
    let spawned = std::thread::Builder::new()
        .name("guestlink-ctrl-c".to_string())
        .spawn(|| {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "创建 Ctrl-C 监听运行时失败");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                info!("收到 Ctrl-C，正在退出");
                stop_token().cancel();
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "创建 Ctrl-C 监听线程失败");
    }
}

define_windows_service!(ffi_service_main, service_main);

/// Windows Service 入口（由 `service_dispatcher` 调用）。
///
/// 注意：
/// - 该函数签名由宏固定；真实逻辑在 [`run_service`]。
fn service_main(_arguments: Vec<OsString>) {
    if let Err(e) = run_service() {
        error!(error = %format!("{e:#}"), "服务异常退出");
    }
}

fn service_status(state: ServiceState, exit_code: u32) -> ServiceStatus {
    ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted: if state == ServiceState::Running {
            ServiceControlAccept::STOP
        } else {
            ServiceControlAccept::empty()
        },
        exit_code: ServiceExitCode::Win32(exit_code),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}

/// 服务主流程：注册控制处理器、上报运行状态、进入主循环，退出后上报停止状态。
///
/// 异常处理：
/// - 注册/上报状态失败会返回错误（通常为服务环境异常）
/// - 主循环失败时以非 0 退出码上报停止状态
fn run_service() -> Result<()> {
    let service_name = SERVICE_NAME.get().map(String::as_str).unwrap_or(service::DEFAULT_SERVICE_NAME);

    let status_handle = service_control_handler::register(service_name, move |control_event| match control_event {
        ServiceControl::Stop => {
            stop_token().cancel();
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
        _ => ServiceControlHandlerResult::NotImplemented,
    })?;

    status_handle.set_service_status(service_status(ServiceState::Running, 0))?;

    let result = run_agent_loop();
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "代理主循环失败");
    }

    status_handle.set_service_status(service_status(ServiceState::Stopped, u32::from(result.is_err())))?;
    Ok(())
}

/// 代理主循环：装配存储、通知器、通道与请求管理器，处理请求直到停止信号。
///
/// 异常处理：
/// - 配置读取失败、注册表键打开失败：返回错误
fn run_agent_loop() -> Result<()> {
    let config_path = match CONFIG_PATH.get().cloned().flatten() {
        Some(path) => path,
        None => paths::default_agent_config()?,
    };
    let config: AgentConfig = load_or_default(&config_path)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        hive = hive_name(config.hive),
        from_host = %config.from_host_key,
        to_host = %config.to_host_key,
        "guestlink-agent 启动"
    );

    let inbound = RegistryKvpStore::open(config.hive, &config.from_host_key).context("打开主机数据键失败")?;
    let outbound = RegistryKvpStore::open(config.hive, &config.to_host_key).context("打开来宾数据键失败")?;
    let source = RegistryChangeSource::open(config.hive, &config.from_host_key).context("打开变化通知失败")?;

    let inbound: Arc<dyn KvpStore> = Arc::new(inbound);
    let outbound: Arc<dyn KvpStore> = Arc::new(outbound);
    let channel = Arc::new(
        GuestChannel::new(inbound, outbound, EventNotifier::new(source), config.protocol.codec())
            .with_fallback_poll(config.fallback_poll()),
    );
    channel.purge_stale();

    let work_dir = paths::default_work_dir()?;
    let factory = BuiltinRequestFactory::new(
        env!("CARGO_PKG_VERSION"),
        Arc::new(process::interactive_users),
        ConfigureSettings {
            command: config.configure_command.clone(),
            work_dir,
        },
    );

    let cancel = stop_token().clone();
    let manager = RequestManager::new(channel.clone(), Arc::new(factory), config.queue_capacity, cancel);
    manager.serve(channel.as_ref(), config.fallback_poll());

    if !manager.wait_idle(Duration::from_secs(10)) {
        warn!("等待执行中的请求结束超时");
    }
    info!("guestlink-agent 已停止");
    Ok(())
}
