//! GuestLink 核心库（跨平台，不依赖 Windows API）。
//!
//! 功能：
//! - 基于 Hyper-V 数据交换（KVP）的主机↔来宾可靠消息协议：分片、重组、确认、去重、清理
//! - 来宾侧请求管理：状态请求直通，长任务进入有界队列由单个工作线程执行
//! - 请求/响应信封、配置模型、会话检查点与统一路径约定
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

pub mod cancel;
pub mod codec;
pub mod config;
pub mod exchange_item;
pub mod guest;
pub mod host;
pub mod message;
pub mod notifier;
pub mod paths;
pub mod request;
pub mod session;
pub mod state;
pub mod store;
