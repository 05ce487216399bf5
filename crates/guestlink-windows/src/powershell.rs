//! PowerShell 脚本执行（用于访问 `root\virtualization\v2` CIM 命名空间）。
//!
//! 说明：
//! - 通过 `powershell.exe -Command` 执行内置脚本，避免直接处理 COM VARIANT/SAFEARRAY
//! - 参数一律经环境变量传入，脚本文本保持固定，不做字符串拼接
//! - 脚本以 JSON 输出结果，由调用方用 serde 解析
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;

/// 执行脚本并返回标准输出。
///
/// 参数：
/// - `script`：脚本文本
/// - `envs`：传给脚本的环境变量（脚本内以 `$env:NAME` 读取）
///
/// 异常处理：
/// - 启动失败：返回错误（通常是系统缺失 PowerShell 或权限问题）
/// - 退出码非 0：返回错误并携带 stdout/stderr，便于日志与人工复现
pub fn run_script(script: &str, envs: &[(&str, &str)]) -> Result<String> {
    let out = Command::new("powershell.exe")
        .args(["-NoLogo", "-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command", script])
        .envs(envs.iter().copied())
        .output()
        .context("执行 powershell.exe 失败")?;
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    if out.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    Err(anyhow!("PowerShell 执行失败: {}\n{}\n{}", out.status, stdout.trim(), stderr.trim()))
}

/// 执行脚本并将输出解析为 JSON。
pub fn run_json<T: DeserializeOwned>(script: &str, envs: &[(&str, &str)]) -> Result<T> {
    let stdout = run_script(script, envs)?;
    serde_json::from_str(stdout.trim()).with_context(|| format!("解析 PowerShell 输出失败: {}", stdout.trim()))
}
