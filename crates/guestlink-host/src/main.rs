//! 主机侧命令行：通过 Hyper-V 数据交换向来宾代理发送请求。
//!
//! 职责：
//! - 按名称或 GUID 定位虚拟机，建立到来宾代理的会话
//! - 发送请求、实时打印进度、输出最终响应（JSON）
//! - 在会话检查点中保存下一个通信 ID 计数，避免重启后与来宾遗留条目冲突
//!
//! 权限要求：
//! - 需要 Hyper-V 管理员权限（调用 `root\virtualization\v2`）
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use guestlink_core::message::RequestBody;

#[cfg(windows)]
mod run;

/// 命令行参数。
#[derive(Debug, Parser)]
#[command(name = "guestlink-host", version)]
struct Cli {
    /// 虚拟机名称或 GUID。
    #[arg(long)]
    vm: String,

    /// 配置文件路径，缺省为 `%ProgramData%\GuestLink\host.json`。
    #[arg(long)]
    config: Option<PathBuf>,

    /// 等待最终响应的超时（秒），缺省取配置文件。
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 查询来宾代理版本。
    Version,
    /// 查询交互式登录的用户。
    LoggedIn,
    /// 查询来宾代理的执行中/排队中请求。
    State,
    /// 在来宾中应用配置文档。
    Configure {
        #[arg(long)]
        file: PathBuf,
    },
}

impl Commands {
    /// 构造请求体。
    ///
    /// 异常处理：
    /// - 配置文档读取失败返回错误
    fn request_body(&self) -> Result<RequestBody> {
        Ok(match self {
            Commands::Version => RequestBody::GetVersion,
            Commands::LoggedIn => RequestBody::IsUserLoggedIn,
            Commands::State => RequestBody::GetState,
            Commands::Configure { file } => RequestBody::Configure {
                configure: std::fs::read_to_string(file)
                    .with_context(|| format!("读取配置文档失败: {}", file.display()))?,
            },
        })
    }
}

/// 程序入口：解析参数、初始化日志并执行请求。
///
/// 异常处理：
/// - 请求失败、超时、被取消或来宾返回非 0 状态时以错误退出
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let body = cli.command.request_body()?;
    execute(cli, body).await
}

#[cfg(windows)]
async fn execute(cli: Cli, body: RequestBody) -> Result<()> {
    run::execute(cli, body).await
}

#[cfg(not(windows))]
async fn execute(_cli: Cli, _body: RequestBody) -> Result<()> {
    anyhow::bail!("guestlink-host 只能在 Hyper-V 主机（Windows）上运行")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_configure_command() {
        let cli = Cli::try_parse_from([
            "guestlink-host",
            "--vm",
            "dev-box",
            "--timeout-secs",
            "90",
            "configure",
            "--file",
            "setup.yaml",
        ])
        .unwrap();
        assert_eq!(cli.vm, "dev-box");
        assert_eq!(cli.timeout_secs, Some(90));
        assert!(matches!(cli.command, Commands::Configure { ref file } if file == &PathBuf::from("setup.yaml")));
    }

    #[test]
    fn status_commands_map_to_request_types() {
        assert_eq!(Commands::Version.request_body().unwrap(), RequestBody::GetVersion);
        assert_eq!(Commands::LoggedIn.request_body().unwrap(), RequestBody::IsUserLoggedIn);
        assert_eq!(Commands::State.request_body().unwrap(), RequestBody::GetState);
    }

    #[test]
    fn missing_configuration_file_is_an_error() {
        let command = Commands::Configure {
            file: PathBuf::from("definitely-missing-guestlink.yaml"),
        };
        assert!(command.request_body().is_err());
    }
}
