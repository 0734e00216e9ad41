/// 系统网络状态
///
/// ConnectionManager 在连接事件中通过 `NetworkMonitor` 查询当前活动网络、本地 IP、
/// SIM 运营商和账号，事件本身不携带数据，只触发一次重新检查。
use crate::config::NetworkType;
use std::net::IpAddr;
use tracing::debug;

/// 当前活动网络
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveNetwork {
    pub network_type: NetworkType,
    pub connected: bool,
    pub roaming: bool,
    /// 移动网络的 APN
    pub apn: Option<String>,
}

pub trait NetworkMonitor: Send + Sync {
    /// 当前活动网络，没有网络时为 None
    fn active_network(&self) -> Option<ActiveNetwork>;

    /// 指定接口的本地 IP
    fn local_ip_address(&self, network_type: NetworkType) -> Option<IpAddr>;

    /// SIM 运营商名称
    fn sim_operator_name(&self) -> String;

    /// 上次使用的账号
    fn last_user_account(&self) -> Option<String>;

    /// 当前 SIM 对应的账号
    fn current_user_account(&self) -> Option<String>;
}

/// 按接口名推断网络类型
pub fn classify_interface(name: &str) -> NetworkType {
    const MOBILE_PREFIXES: [&str; 5] = ["rmnet", "wwan", "ccmni", "pdp", "usb"];
    let lower = name.to_ascii_lowercase();
    if MOBILE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        NetworkType::Mobile
    } else {
        NetworkType::Wifi
    }
}

/// 基于本机网卡的实现
///
/// 第一个非回环 IPv4 接口视为活动网络，接口名决定网络类型，也可以固定类型
pub struct HostNetworkMonitor {
    forced_type: Option<NetworkType>,
    operator: String,
    account: Option<String>,
}

impl HostNetworkMonitor {
    pub fn new(operator: impl Into<String>, account: Option<String>) -> Self {
        Self {
            forced_type: None,
            operator: operator.into(),
            account,
        }
    }

    pub fn with_network_type(mut self, network_type: NetworkType) -> Self {
        self.forced_type = Some(network_type);
        self
    }

    fn first_interface(&self) -> Option<(String, IpAddr)> {
        let interfaces = match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                debug!("读取网卡失败: {}", e);
                return None;
            }
        };
        interfaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .find_map(|i| match i.addr {
                get_if_addrs::IfAddr::V4(ref addr) => Some((i.name.clone(), IpAddr::V4(addr.ip))),
                _ => None,
            })
    }
}

impl NetworkMonitor for HostNetworkMonitor {
    fn active_network(&self) -> Option<ActiveNetwork> {
        let (name, _) = self.first_interface()?;
        Some(ActiveNetwork {
            network_type: self.forced_type.unwrap_or_else(|| classify_interface(&name)),
            connected: true,
            roaming: false,
            apn: None,
        })
    }

    fn local_ip_address(&self, _network_type: NetworkType) -> Option<IpAddr> {
        self.first_interface().map(|(_, ip)| ip)
    }

    fn sim_operator_name(&self) -> String {
        self.operator.clone()
    }

    fn last_user_account(&self) -> Option<String> {
        self.account.clone()
    }

    fn current_user_account(&self) -> Option<String> {
        self.account.clone()
    }
}
