//! Windows 平台能力封装（注册表 KVP、变化通知、Hyper-V 数据交换、服务、权限检测）。
//!
//! 目标：
//! - 将 Windows 专有 API 集中封装，核心协议只依赖 `guestlink-core` 中的 trait
//! - 统一错误风格：存储相关返回 `StoreError`，其余以 `anyhow::Result` 向上返回
//!
//! 权限要求：
//! - 来宾侧读写 `HKLM\SOFTWARE\Microsoft\Virtual Machine\*` 需要管理员/SYSTEM
//! - 主机侧调用 `root\virtualization\v2` 需要 Hyper-V 管理员权限
//!
//! 非 Windows 平台上本 crate 为空。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

#[cfg(windows)]
pub mod elevation;
#[cfg(windows)]
pub mod powershell;
#[cfg(windows)]
pub mod process;
#[cfg(windows)]
pub mod registry;
#[cfg(windows)]
pub mod service;
#[cfg(windows)]
pub mod vmkvp;
#[cfg(windows)]
pub mod watcher;
