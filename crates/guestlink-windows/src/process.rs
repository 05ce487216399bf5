//! 交互式登录用户检测。
//!
//! 实现策略：
//! - 以正在运行的 `explorer.exe`（桌面外壳）判断是否有用户交互式登录
//! - 通过进程所属用户 SID 反查用户名；查不到时使用 SID 文本
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::BTreeSet;

use anyhow::Result;
use sysinfo::{ProcessRefreshKind, RefreshKind, System, Users};

/// 桌面外壳进程名。
const SHELL_PROCESS: &str = "explorer.exe";

/// 返回当前交互式登录的用户名（去重、排序）。
///
/// 异常处理：
/// - sysinfo API 本身不抛错；保留 `Result` 以统一上层接口
pub fn interactive_users() -> Result<Vec<String>> {
    let mut system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    system.refresh_processes();
    let users = Users::new_with_refreshed_list();

    let mut names = BTreeSet::new();
    for process in system.processes().values() {
        if !process.name().eq_ignore_ascii_case(SHELL_PROCESS) {
            continue;
        }
        if let Some(uid) = process.user_id() {
            let name = users
                .get_user_by_id(uid)
                .map(|user| user.name().to_string())
                .unwrap_or_else(|| format!("{uid:?}"));
            names.insert(name);
        }
    }
    Ok(names.into_iter().collect())
}
