//! 来宾代理（Windows Service 形态）。
//!
//! 职责：
//! - 监听主机写入的数据交换键，重组请求并交给请求管理器
//! - 状态请求立即回复，配置类请求进入有界队列由单个工作线程执行
//! - 通过 `install` / `uninstall` 子命令注册或删除自身服务
//!
//! 运行方式：
//! - 服务模式（默认）：由 SCM 启动，日志按天滚动写入 `%ProgramData%\GuestLink\logs`
//! - 控制台模式（`--run-console`）：日志输出到控制台，Ctrl-C 退出
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

#[cfg_attr(not(windows), allow(dead_code))]
mod requests;

#[cfg(windows)]
mod agent;

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    agent::main()
}

#[cfg(not(windows))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("guestlink-agent 只能在 Windows 来宾中运行")
}
