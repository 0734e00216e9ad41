// 声明所有模块
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod network_interface;
pub mod network_monitor;
pub mod proxy_resolver;
pub mod registration;
pub mod sip_message;
pub mod sip_transport;
pub mod utils;

#[cfg(test)]
mod test_support;

/// 重新导出thiserror错误类型
pub use crate::error::{ConfigError, FailureKind, RegistrationError, RegistrationResult};

/// 主要API重新导出，简化使用
pub use crate::config::{ImsConfig, NetworkType, SipProtocol};
pub use crate::connection_manager::{ConnectionManager, ImsCoreListener};
pub use crate::network_interface::NetworkInterface;
pub use crate::network_monitor::{HostNetworkMonitor, NetworkMonitor};
pub use crate::proxy_resolver::{HickoryDnsLookup, ProxyResolver};
pub use crate::registration::{ReasonCode, RegistrationListener, RegistrationManager, RegistrationState};
pub use crate::sip_transport::{RsipstackTransport, SipTransport};

use std::sync::Arc;

/// ims-connect 库的版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 便捷函数：用本机网卡、系统 DNS 和 rsipstack 传输创建连接管理器
pub fn create_connection_manager(
    config: ImsConfig,
    monitor: HostNetworkMonitor,
    listener: Arc<dyn ImsCoreListener>,
) -> Result<Arc<ConnectionManager>, ConfigError> {
    config.validate()?;
    let user_agent = config.user_agent.clone();
    Ok(ConnectionManager::new(
        Arc::new(config),
        Arc::new(monitor),
        listener,
        Arc::new(HickoryDnsLookup::new()),
        move |_| -> Arc<dyn SipTransport> { Arc::new(RsipstackTransport::new(user_agent.clone())) },
    ))
}
