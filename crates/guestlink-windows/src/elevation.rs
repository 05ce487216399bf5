//! 提权/权限相关检测。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use anyhow::{bail, Result};
use windows::Win32::UI::Shell::IsUserAnAdmin;

/// 判断当前进程是否以管理员权限运行。
///
/// 安全注意：
/// - 仅用于在执行系统修改前给出明确提示，不能作为完整的安全边界
pub fn is_running_as_admin() -> bool {
    unsafe { IsUserAnAdmin().as_bool() }
}

/// 要求管理员权限；否则返回带操作名的错误。
///
/// 参数：
/// - `action`：即将执行的操作（用于错误信息）
pub fn require_admin(action: &str) -> Result<()> {
    if !is_running_as_admin() {
        bail!("{action} 需要管理员权限，请以管理员身份重新运行");
    }
    Ok(())
}
