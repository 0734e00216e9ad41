/// IMS 网络接口
///
/// 一个接口对应一种物理接入（移动网络或 Wi-Fi），包含：
/// - 该接入的代理配置与 DNS 解析缓存
/// - 认证策略（按配置选择 GIBA 或 Digest）
/// - RegistrationManager
/// - NAT 场景下的 OPTIONS 保活
use crate::config::{ImsConfig, NetworkType, ProxyConfig};
use crate::error::{RegistrationError, RegistrationResult};
use crate::proxy_resolver::{DnsResolvedFields, ProxyResolver};
use crate::registration::{
    AuthProcedure, AuthProcedureFactory, NatState, RegistrationListener, RegistrationManager,
};
use crate::sip_message;
use crate::sip_transport::{SipTransport, StackConfig};
use crate::utils::format_host;
use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct NetworkInterface {
    network_type: NetworkType,
    config: Arc<ImsConfig>,
    proxy: ProxyConfig,
    resolver: Arc<ProxyResolver>,
    transport: Arc<dyn SipTransport>,
    auth: Arc<dyn AuthProcedure>,
    listener: Arc<dyn RegistrationListener>,
    registration: Arc<RegistrationManager>,
    access_ip: RwLock<Option<IpAddr>>,
    dns_cache: Mutex<Option<DnsResolvedFields>>,
    stack: Mutex<Option<StackConfig>>,
    keep_alive: Mutex<Option<CancellationToken>>,
}

impl NetworkInterface {
    pub fn new(
        network_type: NetworkType,
        config: Arc<ImsConfig>,
        resolver: Arc<ProxyResolver>,
        transport: Arc<dyn SipTransport>,
        listener: Arc<dyn RegistrationListener>,
        battery_low: Arc<AtomicBool>,
    ) -> Self {
        let proxy = config.proxy_for(network_type).clone();
        let auth = AuthProcedureFactory::create(proxy.auth_mode, &config);
        let registration = RegistrationManager::new(
            config.clone(),
            proxy.protocol,
            transport.clone(),
            auth.clone(),
            listener.clone(),
            battery_low,
        );
        info!(
            "创建 {} 接口: 代理 {}:{} ({}, {})",
            network_type,
            proxy.host,
            proxy.port,
            proxy.protocol,
            auth.name()
        );

        Self {
            network_type,
            config,
            proxy,
            resolver,
            transport,
            auth,
            listener,
            registration,
            access_ip: RwLock::new(None),
            dns_cache: Mutex::new(None),
            stack: Mutex::new(None),
            keep_alive: Mutex::new(None),
        }
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    pub fn auth(&self) -> &Arc<dyn AuthProcedure> {
        &self.auth
    }

    pub fn registration(&self) -> &Arc<RegistrationManager> {
        &self.registration
    }

    /// 配置了代理主机才算已配置
    pub fn is_configured(&self) -> bool {
        !self.proxy.host.trim().is_empty()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_registered()
    }

    pub fn access_ip(&self) -> Option<IpAddr> {
        self.access_ip.read().ok().and_then(|ip| *ip)
    }

    /// 绑定本地 IP
    pub fn connect(&self, ip: IpAddr) {
        info!("{} 接口连接，本地IP {}", self.network_type, ip);
        if let Ok(mut access) = self.access_ip.write() {
            *access = Some(ip);
        }
    }

    pub fn disconnect(&self) {
        if let Ok(mut access) = self.access_ip.write() {
            *access = None;
        }
    }

    pub fn cached_dns(&self) -> Option<DnsResolvedFields> {
        self.dns_cache.lock().ok().and_then(|c| *c)
    }

    /// 使 DNS 缓存失效，下次注册重新解析
    pub fn invalidate_dns(&self) {
        if let Ok(mut cache) = self.dns_cache.lock() {
            if cache.take().is_some() {
                debug!("{} 接口 DNS 缓存已失效", self.network_type);
            }
        }
    }

    pub fn nat_state(&self) -> NatState {
        self.registration.nat_state()
    }

    pub fn is_behind_nat(&self) -> bool {
        self.nat_state().behind_nat
    }

    pub fn nat_public_address(&self) -> Option<String> {
        self.nat_state().public_address
    }

    pub fn nat_public_port(&self) -> Option<u16> {
        self.nat_state().public_port
    }

    /// 服务器要求的重试等待时间
    pub fn retry_after(&self) -> Duration {
        self.registration.retry_after()
    }

    /// 注册：解析代理（有缓存时跳过）、初始化协议栈、执行 REGISTER
    ///
    /// 已注册时直接返回，刷新由 RegistrationManager 的定时器负责
    pub async fn register(&self) -> RegistrationResult<()> {
        let local_ip = self.access_ip().ok_or(RegistrationError::NotConnected)?;
        if !self.is_configured() {
            return Err(RegistrationError::NotConfigured);
        }
        if self.registration.is_registered() {
            debug!("{} 接口已注册", self.network_type);
            return Ok(());
        }

        let result = self.try_register(local_ip).await;
        match &result {
            Ok(()) => {
                if self.is_behind_nat() && self.config.keep_alive_enabled {
                    self.start_keep_alive();
                }
            }
            Err(_) => {
                self.invalidate_dns();
                self.forget_stack();
            }
        }
        result
    }

    async fn try_register(&self, local_ip: IpAddr) -> RegistrationResult<()> {
        let resolved = match self.cached_dns() {
            Some(resolved) => resolved,
            None => {
                let resolved = self
                    .resolver
                    .resolve(&self.proxy.host, self.proxy.port, self.proxy.protocol)
                    .await
                    .inspect_err(|e| self.listener.on_registration_failed(e))?;
                if let Ok(mut cache) = self.dns_cache.lock() {
                    *cache = Some(resolved);
                }
                resolved
            }
        };

        let stack = StackConfig {
            local_ip,
            remote_ip: resolved.ip,
            remote_port: resolved.port,
            protocol: self.proxy.protocol,
            network: self.network_type,
        };
        if self.stack_is_up(&stack) {
            debug!("{} 接口协议栈未变化，沿用 {}", self.network_type, stack.remote_addr());
        } else {
            self.transport
                .init_stack(stack.clone())
                .await
                .inspect_err(|e| self.listener.on_registration_failed(e))?;
            if let Ok(mut current) = self.stack.lock() {
                *current = Some(stack);
            }
        }

        self.registration.register().await
    }

    /// 协议栈已按相同的本地 IP 和远端地址初始化
    fn stack_is_up(&self, stack: &StackConfig) -> bool {
        self.transport.local_addr().is_some()
            && self.stack.lock().ok().is_some_and(|current| current.as_ref() == Some(stack))
    }

    /// 失败后下次注册重新初始化协议栈
    fn forget_stack(&self) {
        if let Ok(mut current) = self.stack.lock() {
            *current = None;
        }
    }

    async fn close_stack(&self) {
        self.forget_stack();
        self.transport.close_stack().await;
    }

    /// 优雅注销：通知服务器后关闭协议栈
    pub async fn unregister(&self) {
        self.stop_keep_alive();
        self.registration.unregistration().await;
        self.close_stack().await;
    }

    /// 强制终止：不通知服务器
    pub async fn registration_terminated(&self) {
        self.stop_keep_alive();
        self.registration.stop_registration().await;
        self.close_stack().await;
    }

    fn start_keep_alive(&self) {
        let Some(local_addr) = self.transport.local_addr() else {
            return;
        };
        let Some(resolved) = self.cached_dns() else {
            return;
        };

        let token = CancellationToken::new();
        if let Ok(mut keep_alive) = self.keep_alive.lock() {
            if keep_alive.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            *keep_alive = Some(token.clone());
        }

        let target = format!("sip:{}:{}", format_host(&resolved.ip), resolved.port);
        let local_party = self.auth.public_uri();
        let protocol = self.proxy.protocol;
        let period = self.config.keep_alive_period;
        let timeout = self.config.sip_timeout;
        let user_agent = self.config.user_agent.clone();
        let transport = self.transport.clone();

        info!("启动 NAT 保活: {} 每 {:?}", target, period);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let request = match sip_message::build_options(&target, &local_party, local_addr, protocol, &user_agent) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("构造保活请求失败: {}", e);
                        break;
                    }
                };
                match transport.send_and_wait(request, timeout).await {
                    Ok(Some(resp)) => debug!("保活响应: {}", resp.status_code),
                    Ok(None) => warn!("保活超时"),
                    Err(e) => warn!("保活发送失败: {}", e),
                }
            }
            debug!("NAT 保活已停止");
        });
    }

    fn stop_keep_alive(&self) {
        if let Ok(mut keep_alive) = self.keep_alive.lock() {
            if let Some(token) = keep_alive.take() {
                token.cancel();
            }
        }
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.keep_alive
            .lock()
            .ok()
            .is_some_and(|k| k.as_ref().is_some_and(|t| !t.is_cancelled()))
    }
}
