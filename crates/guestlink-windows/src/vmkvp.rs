//! 主机侧：按虚拟机划分的 Hyper-V 数据交换存储。
//!
//! 实现：
//! - 写入/删除：`Msvm_VirtualSystemManagementService.AddKvpItems` / `RemoveKvpItems`
//!   - 返回 0：同步完成
//!   - 返回 4096：已启动异步作业，每 300ms 查询一次 `Msvm_ConcreteJob`，
//!     直到离开 Starting/Running；结束状态不是 Completed 时返回作业错误码与描述；
//!     超过 120s 仍未结束视为失败
//!   - 其他返回值：失败
//! - 读取：虚拟机关联的 `Msvm_KvpExchangeComponent.GuestExchangeItems`，逐条解析 CIM-XML
//!
//! 命名空间：`root\virtualization\v2`
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use guestlink_core::cancel::Deadline;
use guestlink_core::exchange_item::ExchangeItem;
use guestlink_core::store::{KvpStore, StoreError};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::powershell::run_json;

/// 方法同步完成。
pub const RETURN_COMPLETED: u32 = 0;
/// 方法已启动异步作业。
pub const RETURN_JOB_STARTED: u32 = 4096;

const JOB_STATE_STARTING: u16 = 3;
const JOB_STATE_RUNNING: u16 = 4;
const JOB_STATE_COMPLETED: u16 = 7;

/// 作业状态查询间隔。
pub const JOB_POLL_INTERVAL: Duration = Duration::from_millis(300);
/// 单个作业的最长等待时间。
pub const JOB_TIMEOUT: Duration = Duration::from_secs(120);

const FIND_VM_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$id = $env:GUESTLINK_VM
$vm = Get-CimInstance -Namespace 'root\virtualization\v2' -ClassName Msvm_ComputerSystem `
    -Filter "Caption='Virtual Machine' AND (Name='$id' OR ElementName='$id')" | Select-Object -First 1
if (-not $vm) { throw "未找到虚拟机: $id" }
[pscustomobject]@{ Name = $vm.Name; ElementName = $vm.ElementName } | ConvertTo-Json -Compress
"#;

const MODIFY_ITEMS_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$ns = 'root\virtualization\v2'
$vm = Get-CimInstance -Namespace $ns -ClassName Msvm_ComputerSystem -Filter "Name='$env:GUESTLINK_VM_ID'"
if (-not $vm) { throw "未找到虚拟机: $env:GUESTLINK_VM_ID" }
$svc = Get-CimInstance -Namespace $ns -ClassName Msvm_VirtualSystemManagementService
$r = Invoke-CimMethod -InputObject $svc -MethodName $env:GUESTLINK_METHOD `
    -Arguments @{ TargetSystem = $vm; DataItems = @($env:GUESTLINK_DATA_ITEM) }
$jobId = $null
if ($r.Job) { $jobId = $r.Job.InstanceID }
[pscustomobject]@{ ReturnValue = [uint32]$r.ReturnValue; JobId = $jobId } | ConvertTo-Json -Compress
"#;

const JOB_STATE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$job = Get-CimInstance -Namespace 'root\virtualization\v2' -ClassName Msvm_ConcreteJob `
    -Filter "InstanceID='$env:GUESTLINK_JOB_ID'"
if (-not $job) { throw "未找到作业: $env:GUESTLINK_JOB_ID" }
[pscustomobject]@{
    JobState = [uint16]$job.JobState
    ErrorCode = [uint32]$job.ErrorCode
    ErrorDescription = [string]$job.ErrorDescription
} | ConvertTo-Json -Compress
"#;

const READ_ITEMS_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$vm = Get-CimInstance -Namespace 'root\virtualization\v2' -ClassName Msvm_ComputerSystem `
    -Filter "Name='$env:GUESTLINK_VM_ID'"
if (-not $vm) { throw "未找到虚拟机: $env:GUESTLINK_VM_ID" }
$kvp = Get-CimAssociatedInstance -InputObject $vm -ResultClassName Msvm_KvpExchangeComponent
$items = @()
if ($kvp -and $kvp.GuestExchangeItems) { $items = @($kvp.GuestExchangeItems) }
ConvertTo-Json -InputObject $items -Compress
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MethodResult {
    return_value: u32,
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobStatus {
    job_state: u16,
    #[serde(default)]
    error_code: u32,
    #[serde(default)]
    error_description: Option<String>,
}

/// 已定位的虚拟机。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VmIdentity {
    /// 虚拟机 GUID（`Msvm_ComputerSystem.Name`）。
    pub name: String,
    pub element_name: String,
}

/// WQL 过滤串中不允许出现的字符。
fn validate_query_value(value: &str) -> Result<()> {
    if value.is_empty() || value.contains(['\'', '"', '`', '\\']) {
        bail!("非法的虚拟机标识: {value:?}");
    }
    Ok(())
}

/// 按 GUID 或显示名定位虚拟机。
pub fn find_vm(name_or_id: &str) -> Result<VmIdentity> {
    validate_query_value(name_or_id)?;
    run_json(FIND_VM_SCRIPT, &[("GUESTLINK_VM", name_or_id)])
}

/// 单台虚拟机的数据交换存储。
pub struct VmKvpStore {
    vm_id: String,
}

impl VmKvpStore {
    /// 参数：
    /// - `vm_id`：虚拟机 GUID
    pub fn new(vm_id: impl Into<String>) -> Result<Self, StoreError> {
        let vm_id = vm_id.into();
        validate_query_value(&vm_id).map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(Self { vm_id })
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// 调用 `AddKvpItems` / `RemoveKvpItems` 并等待其完成。
    fn modify(&self, method: &str, item: &ExchangeItem) -> Result<(), StoreError> {
        let xml = item.to_cim_xml();
        let result: MethodResult = run_json(
            MODIFY_ITEMS_SCRIPT,
            &[
                ("GUESTLINK_VM_ID", self.vm_id.as_str()),
                ("GUESTLINK_METHOD", method),
                ("GUESTLINK_DATA_ITEM", xml.as_str()),
            ],
        )
        .map_err(|e| StoreError::Platform {
            code: 0,
            description: format!("{method}: {e:#}"),
        })?;

        match result.return_value {
            RETURN_COMPLETED => Ok(()),
            RETURN_JOB_STARTED => {
                let job_id = result.job_id.ok_or_else(|| StoreError::Platform {
                    code: RETURN_JOB_STARTED,
                    description: format!("{method}: 作业已启动但未返回作业引用"),
                })?;
                wait_for_job(method, &job_id)
            }
            code => Err(StoreError::Platform {
                code,
                description: format!("{method} 返回失败"),
            }),
        }
    }
}

/// 轮询异步作业直到结束。
fn wait_for_job(method: &str, job_id: &str) -> Result<(), StoreError> {
    poll_job(method, JOB_TIMEOUT, JOB_POLL_INTERVAL, || {
        run_json(JOB_STATE_SCRIPT, &[("GUESTLINK_JOB_ID", job_id)]).map_err(|e| StoreError::Platform {
            code: RETURN_JOB_STARTED,
            description: format!("{method}: 查询作业失败: {e:#}"),
        })
    })
}

/// 按 `interval` 查询作业状态，直到结束或超过 `timeout`。
fn poll_job(
    method: &str,
    timeout: Duration,
    interval: Duration,
    mut query: impl FnMut() -> Result<JobStatus, StoreError>,
) -> Result<(), StoreError> {
    let deadline = Deadline::after(timeout);
    loop {
        let status = query()?;
        match status.job_state {
            JOB_STATE_STARTING | JOB_STATE_RUNNING => {
                let Some(remaining) = deadline.remaining() else {
                    return Err(StoreError::Platform {
                        code: RETURN_JOB_STARTED,
                        description: format!("{method}: 作业在 {}s 内未结束", timeout.as_secs()),
                    });
                };
                std::thread::sleep(interval.min(remaining));
            }
            JOB_STATE_COMPLETED => return Ok(()),
            state => {
                debug!(method, state, "作业未成功结束");
                return Err(StoreError::Platform {
                    code: status.error_code,
                    description: status
                        .error_description
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| format!("{method} 作业结束状态 {state}")),
                });
            }
        }
    }
}

impl KvpStore for VmKvpStore {
    fn write(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.modify("AddKvpItems", &ExchangeItem::host(name, value))
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.modify("RemoveKvpItems", &ExchangeItem::host(name, ""))
    }

    fn read_all(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let raw: Vec<Option<String>> = run_json(READ_ITEMS_SCRIPT, &[("GUESTLINK_VM_ID", self.vm_id.as_str())])
            .map_err(|e| StoreError::Read(format!("{e:#}")))?;
        let mut entries = BTreeMap::new();
        for xml in raw.into_iter().flatten() {
            match ExchangeItem::from_cim_xml(&xml) {
                Ok(item) if item.name.starts_with(prefix) => {
                    entries.insert(item.name, item.data);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "跳过无法解析的数据交换条目"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(job_state: u16) -> JobStatus {
        JobStatus {
            job_state,
            error_code: 32768,
            error_description: None,
        }
    }

    #[test]
    fn job_that_never_finishes_times_out() {
        let mut queries = 0;
        let err = poll_job("AddKvpItems", Duration::from_millis(50), Duration::from_millis(5), || {
            queries += 1;
            Ok(status(JOB_STATE_RUNNING))
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Platform { code: RETURN_JOB_STARTED, .. }));
        assert!(queries > 1);
    }

    #[test]
    fn job_completes_after_running() {
        let mut states = vec![JOB_STATE_COMPLETED, JOB_STATE_RUNNING, JOB_STATE_STARTING];
        poll_job("AddKvpItems", Duration::from_secs(5), Duration::from_millis(1), || {
            Ok(status(states.pop().unwrap()))
        })
        .unwrap();
    }

    #[test]
    fn failed_job_reports_its_error_code() {
        let err = poll_job("RemoveKvpItems", Duration::from_secs(5), Duration::from_millis(1), || Ok(status(10)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Platform { code: 32768, .. }));
    }
}
