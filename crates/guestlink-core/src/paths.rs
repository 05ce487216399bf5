//! 统一路径与目录约定（主要面向 Windows ProgramData）。
//!
//! 目标：
//! - 将配置、日志、会话检查点等落盘路径集中管理
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// ProgramData 下的产品目录名。
///
/// 示例（默认）：
/// - `%ProgramData%\GuestLink`
pub const VENDOR_DIR: &str = "GuestLink";

/// 获取本项目在 ProgramData 下的根目录。
///
/// 异常处理：
/// - 当环境变量 `ProgramData` 不存在或不可读时，返回错误。
pub fn program_data_dir() -> Result<PathBuf> {
    let program_data = std::env::var("ProgramData").context("读取 ProgramData 环境变量失败")?;
    Ok(PathBuf::from(program_data).join(VENDOR_DIR))
}

/// 确保目录存在（不存在则递归创建）。
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("创建目录失败: {}", path.display()))?;
    Ok(())
}

/// `%ProgramData%\GuestLink\agent.json`
pub fn default_agent_config() -> Result<PathBuf> {
    Ok(program_data_dir()?.join("agent.json"))
}

/// `%ProgramData%\GuestLink\host.json`
pub fn default_host_config() -> Result<PathBuf> {
    Ok(program_data_dir()?.join("host.json"))
}

/// `%ProgramData%\GuestLink\logs`
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(program_data_dir()?.join("logs"))
}

/// `%ProgramData%\GuestLink\sessions`
pub fn default_sessions_dir() -> Result<PathBuf> {
    Ok(program_data_dir()?.join("sessions"))
}

/// 配置文档的临时工作目录。
///
/// 返回值：
/// - `%ProgramData%\GuestLink\work`
pub fn default_work_dir() -> Result<PathBuf> {
    Ok(program_data_dir()?.join("work"))
}

/// 某台虚拟机的会话检查点文件。
///
/// 参数：
/// - `dir`：检查点目录
/// - `vm_id`：虚拟机 ID；路径分隔符等非法字符替换为 `_`
pub fn session_file(dir: &Path, vm_id: &str) -> PathBuf {
    let safe: String = vm_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{safe}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_file_sanitizes_vm_id() {
        let dir = Path::new("sessions");
        assert_eq!(
            session_file(dir, "6f1a3c1e-0000-4000-8000-000000000001"),
            dir.join("6f1a3c1e-0000-4000-8000-000000000001.json")
        );
        assert_eq!(session_file(dir, r"..\evil"), dir.join("___evil.json"));
    }
}
