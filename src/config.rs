/// IMS 连接配置
///
/// 取代全局设置单例：所有组件通过构造函数拿到同一个 `Arc<ImsConfig>`
use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 物理网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Mobile,
    Wifi,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Mobile => write!(f, "mobile"),
            NetworkType::Wifi => write!(f, "wifi"),
        }
    }
}

impl FromStr for NetworkType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mobile" => Ok(NetworkType::Mobile),
            "wifi" | "wi-fi" => Ok(NetworkType::Wifi),
            _ => Err(ConfigError::Parse(format!("未知网络类型: {}", s))),
        }
    }
}

/// 允许接入 IMS 的网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkAccessType {
    Mobile,
    Wifi,
    #[default]
    Any,
}

impl NetworkAccessType {
    /// 当前活动网络是否被授权
    pub fn allows(&self, network: NetworkType) -> bool {
        match self {
            NetworkAccessType::Any => true,
            NetworkAccessType::Mobile => network == NetworkType::Mobile,
            NetworkAccessType::Wifi => network == NetworkType::Wifi,
        }
    }
}

/// SIP 传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SipProtocol {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl SipProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipProtocol::Udp => "UDP",
            SipProtocol::Tcp => "TCP",
            SipProtocol::Tls => "TLS",
        }
    }

    /// NAPTR 记录中对应的服务字段
    pub fn naptr_service(&self) -> &'static str {
        match self {
            SipProtocol::Udp => "SIP+D2U",
            SipProtocol::Tcp => "SIP+D2T",
            SipProtocol::Tls => "SIPS+D2T",
        }
    }
}

impl fmt::Display for SipProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SipProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(SipProtocol::Udp),
            "tcp" => Ok(SipProtocol::Tcp),
            "tls" => Ok(SipProtocol::Tls),
            _ => Err(ConfigError::Parse(format!("未知SIP协议: {}", s))),
        }
    }
}

/// 认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticationMode {
    /// 基于 SIM 的 GIBA，无显式口令
    Giba,
    /// HTTP Digest MD5
    #[default]
    Digest,
}

impl FromStr for AuthenticationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "giba" => Ok(AuthenticationMode::Giba),
            "digest" => Ok(AuthenticationMode::Digest),
            _ => Err(ConfigError::Parse(format!("未知认证方式: {}", s))),
        }
    }
}

/// 电量下限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinimumBatteryLevel {
    /// 从不因电量断开
    #[default]
    NeverStop,
    /// 电量百分比小于等于该值且未充电时断开
    Percent(u8),
}

/// 单个网络接口的代理配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// 代理主机名或IP（为空表示该接口未配置）
    pub host: String,
    pub port: u16,
    pub protocol: SipProtocol,
    pub auth_mode: AuthenticationMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5060,
            protocol: SipProtocol::Udp,
            auth_mode: AuthenticationMode::Digest,
        }
    }
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16, protocol: SipProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            ..Default::default()
        }
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthenticationMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }
}

/// Digest 方式使用的用户资料
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfileConfig {
    /// 公有身份的用户部分
    pub username: String,
    /// 私有身份（IMPI），为空时使用 username
    pub private_id: String,
    pub home_domain: String,
    pub password: String,
    /// 为空时使用服务器挑战中的 realm
    pub realm: String,
}

/// GIBA 使用的 SIM 身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimIdentity {
    pub imsi: String,
    pub mcc: u16,
    pub mnc: u16,
}

/// 注册的能力开关（决定 feature tag 集合）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityConfig {
    pub im_session: bool,
    pub video_share: bool,
    pub ip_voice_call: bool,
    pub ip_video_call: bool,
    pub automata: bool,
    pub image_share: bool,
    pub geoloc_push: bool,
    pub file_transfer_http: bool,
    /// 扩展服务 IARI 后缀
    pub extensions: Vec<String>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            im_session: true,
            video_share: false,
            ip_voice_call: false,
            ip_video_call: false,
            automata: false,
            image_share: true,
            geoloc_push: true,
            file_transfer_http: true,
            extensions: Vec::new(),
        }
    }
}

/// IMS 连接总配置
#[derive(Debug, Clone)]
pub struct ImsConfig {
    pub network_access: NetworkAccessType,
    /// 运营商名称，为空表示不校验
    pub operator: String,
    /// 移动网络 APN 白名单，为空表示不校验
    pub apn_whitelist: Vec<String>,
    pub mobile_proxy: ProxyConfig,
    pub wifi_proxy: ProxyConfig,
    pub user: UserProfileConfig,
    pub sim: Option<SimIdentity>,
    /// REGISTER 请求的过期时间（秒）
    pub register_expire_period: u32,
    pub register_retry_base_time: Duration,
    pub register_retry_max_time: Duration,
    pub service_polling_period: Duration,
    pub service_start_retry: Duration,
    pub sip_timeout: Duration,
    pub min_battery_level: MinimumBatteryLevel,
    pub gruu_enabled: bool,
    pub keep_alive_enabled: bool,
    pub keep_alive_period: Duration,
    /// 设备实例ID，例如 `<urn:uuid:...>`
    pub instance_id: String,
    pub user_agent: String,
    pub capabilities: CapabilityConfig,
}

impl Default for ImsConfig {
    fn default() -> Self {
        Self {
            network_access: NetworkAccessType::Any,
            operator: String::new(),
            apn_whitelist: Vec::new(),
            mobile_proxy: ProxyConfig::default(),
            wifi_proxy: ProxyConfig::default(),
            user: UserProfileConfig::default(),
            sim: None,
            register_expire_period: 600,
            register_retry_base_time: Duration::from_secs(5),
            register_retry_max_time: Duration::from_secs(300),
            service_polling_period: Duration::from_secs(300),
            service_start_retry: Duration::from_secs(5),
            sip_timeout: Duration::from_secs(30),
            min_battery_level: MinimumBatteryLevel::NeverStop,
            gruu_enabled: true,
            keep_alive_enabled: true,
            keep_alive_period: Duration::from_secs(30),
            instance_id: format!("<urn:uuid:{}>", uuid::Uuid::new_v4()),
            user_agent: format!("ims-connect/{}", env!("CARGO_PKG_VERSION")),
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl ImsConfig {
    /// 创建 Digest 认证的配置，两个接口共用同一代理
    pub fn new(proxy: &str, username: &str, home_domain: &str, password: &str) -> Result<Self, ConfigError> {
        let (host, port) = split_host_port(proxy)?;
        let proxy = ProxyConfig::new(host, port, SipProtocol::Udp);
        let config = Self {
            mobile_proxy: proxy.clone(),
            wifi_proxy: proxy,
            user: UserProfileConfig {
                username: username.to_string(),
                home_domain: home_domain.to_string(),
                password: password.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_network_access(mut self, access: NetworkAccessType) -> Self {
        self.network_access = access;
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    pub fn with_mobile_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.mobile_proxy = proxy;
        self
    }

    pub fn with_wifi_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.wifi_proxy = proxy;
        self
    }

    pub fn with_user(mut self, user: UserProfileConfig) -> Self {
        self.user = user;
        self
    }

    pub fn with_sim(mut self, sim: SimIdentity) -> Self {
        self.sim = Some(sim);
        self
    }

    pub fn with_expire_period(mut self, seconds: u32) -> Self {
        self.register_expire_period = seconds;
        self
    }

    pub fn with_retry_times(mut self, base: Duration, max: Duration) -> Self {
        self.register_retry_base_time = base;
        self.register_retry_max_time = max;
        self
    }

    pub fn with_min_battery_level(mut self, level: MinimumBatteryLevel) -> Self {
        self.min_battery_level = level;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityConfig) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// 指定接口的代理配置
    pub fn proxy_for(&self, network: NetworkType) -> &ProxyConfig {
        match network {
            NetworkType::Mobile => &self.mobile_proxy,
            NetworkType::Wifi => &self.wifi_proxy,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.register_expire_period == 0 {
            return Err(ConfigError::Invalid("register_expire_period 不能为 0".into()));
        }
        if self.register_retry_base_time > self.register_retry_max_time {
            return Err(ConfigError::Invalid(
                "register_retry_base_time 大于 register_retry_max_time".into(),
            ));
        }
        for proxy in [&self.mobile_proxy, &self.wifi_proxy] {
            if proxy.host.is_empty() {
                continue;
            }
            match proxy.auth_mode {
                AuthenticationMode::Giba => {
                    if self.sim.is_none() {
                        return Err(ConfigError::Missing("sim (GIBA 需要 IMSI)".into()));
                    }
                }
                AuthenticationMode::Digest => {
                    if self.user.username.is_empty() {
                        return Err(ConfigError::Missing("user.username".into()));
                    }
                    if self.user.home_domain.is_empty() {
                        return Err(ConfigError::Missing("user.home_domain".into()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// 拆分 `host[:port]`，支持 `[v6]:port`
pub fn split_host_port(value: &str) -> Result<(String, u16), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Missing("proxy".into()));
    }
    if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| ConfigError::Parse(value.to_string()))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| ConfigError::Parse(value.to_string()))?,
            None => 5060,
        };
        return Ok((host.to_string(), port));
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().map_err(|_| ConfigError::Parse(value.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((value.to_string(), 5060)),
    }
}
