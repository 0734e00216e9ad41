/// IMS 连接管理
///
/// 监听连接变化和电量变化，选择当前网络接口，并运行后台轮询循环：
/// 未注册时注册（失败后指数退避），注册后启动并定期检查 IMS 服务。
///
/// 连接事件之间通过 `event_lock` 串行执行；轮询循环用代数（generation）和
/// CancellationToken 标识，停止后旧循环在下一个等待点退出。
use crate::config::{ImsConfig, MinimumBatteryLevel, NetworkType};
use crate::error::RegistrationError;
use crate::network_interface::NetworkInterface;
use crate::network_monitor::NetworkMonitor;
use crate::proxy_resolver::{DnsLookup, ProxyResolver};
use crate::registration::{ReasonCode, RegistrationListener};
use crate::sip_transport::SipTransport;
use crate::utils::{jitter_coefficient, registration_backoff};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 上层 IMS 核心的回调
pub trait ImsCoreListener: RegistrationListener {
    /// 核心是否初始化完成（未完成时不启动服务）
    fn is_initialization_finished(&self) -> bool;

    fn start_services(&self);

    fn stop_services(&self);

    /// 已注册且服务已启动时的周期检查
    fn check_services(&self);

    /// 检测到 SIM 卡/账号变化
    fn on_sim_changed(&self);
}

/// 把 ImsCoreListener 当作 RegistrationListener 交给网络接口
struct CoreListenerBridge(Arc<dyn ImsCoreListener>);

impl RegistrationListener for CoreListenerBridge {
    fn on_registration_successful(&self) {
        self.0.on_registration_successful();
    }

    fn on_registration_failed(&self, error: &RegistrationError) {
        self.0.on_registration_failed(error);
    }

    fn on_registration_terminated(&self, reason: ReasonCode) {
        self.0.on_registration_terminated(reason);
    }
}

struct PollingHandle {
    generation: u64,
    token: CancellationToken,
}

pub struct ConnectionManager {
    config: Arc<ImsConfig>,
    monitor: Arc<dyn NetworkMonitor>,
    listener: Arc<dyn ImsCoreListener>,
    mobile: Arc<NetworkInterface>,
    wifi: Arc<NetworkInterface>,
    current: RwLock<NetworkType>,
    event_lock: Mutex<()>,
    disconnected_by_battery: Arc<AtomicBool>,
    services_started: AtomicBool,
    generation: AtomicU64,
    polling: StdMutex<Option<PollingHandle>>,
    terminated: AtomicBool,
}

impl ConnectionManager {
    /// 创建两个网络接口，默认使用移动网络接口
    ///
    /// `transport_factory` 为每个接口创建独立的 SIP 传输
    pub fn new<F>(
        config: Arc<ImsConfig>,
        monitor: Arc<dyn NetworkMonitor>,
        listener: Arc<dyn ImsCoreListener>,
        dns: Arc<dyn DnsLookup>,
        transport_factory: F,
    ) -> Arc<Self>
    where
        F: Fn(NetworkType) -> Arc<dyn SipTransport>,
    {
        let resolver = Arc::new(ProxyResolver::new(dns));
        let bridge: Arc<dyn RegistrationListener> = Arc::new(CoreListenerBridge(listener.clone()));
        let disconnected_by_battery = Arc::new(AtomicBool::new(false));

        let build = |network_type| {
            Arc::new(NetworkInterface::new(
                network_type,
                config.clone(),
                resolver.clone(),
                transport_factory(network_type),
                bridge.clone(),
                disconnected_by_battery.clone(),
            ))
        };
        let mobile = build(NetworkType::Mobile);
        let wifi = build(NetworkType::Wifi);

        Arc::new(Self {
            config,
            monitor,
            listener,
            mobile,
            wifi,
            current: RwLock::new(NetworkType::Mobile),
            event_lock: Mutex::new(()),
            disconnected_by_battery,
            services_started: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            polling: StdMutex::new(None),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn interface(&self, network_type: NetworkType) -> &Arc<NetworkInterface> {
        match network_type {
            NetworkType::Mobile => &self.mobile,
            NetworkType::Wifi => &self.wifi,
        }
    }

    pub fn current_interface(&self) -> Arc<NetworkInterface> {
        let current = self.current.read().map(|c| *c).unwrap_or(NetworkType::Mobile);
        self.interface(current).clone()
    }

    fn set_current(&self, network_type: NetworkType) {
        if let Ok(mut current) = self.current.write() {
            *current = network_type;
        }
    }

    /// 当前接口是 Wi-Fi
    pub fn is_connected_to_wifi(&self) -> bool {
        self.current_interface().network_type() == NetworkType::Wifi
    }

    /// 当前接口是移动网络
    pub fn is_connected_to_mobile(&self) -> bool {
        self.current_interface().network_type() == NetworkType::Mobile
    }

    pub fn is_in_roaming(&self) -> bool {
        self.monitor.active_network().is_some_and(|n| n.roaming)
    }

    pub fn is_disconnected_by_battery(&self) -> bool {
        self.disconnected_by_battery.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.current_interface().is_registered()
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.current_interface().registration().reason_code()
    }

    pub fn is_polling(&self) -> bool {
        self.polling.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    // ---- 连接事件 ----

    /// 系统连接状态变化，在独立任务中重新检查
    pub fn on_connectivity_changed(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.connection_event().await })
    }

    /// 处理一次连接事件
    pub async fn connection_event(self: &Arc<Self>) {
        let _event = self.event_lock.lock().await;
        self.handle_connection_event().await;
    }

    async fn handle_connection_event(self: &Arc<Self>) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        if self.is_disconnected_by_battery() {
            debug!("电量过低，忽略连接事件");
            return;
        }

        let Some(active) = self.monitor.active_network() else {
            info!("没有可用网络，断开 IMS");
            self.disconnect_from_ims().await;
            return;
        };

        // SIM 热插拔检测
        if active.network_type == NetworkType::Mobile {
            if let Some(last) = self.monitor.last_user_account() {
                let changed = match self.monitor.current_user_account() {
                    Some(current) => !current.eq_ignore_ascii_case(&last),
                    None => true,
                };
                if changed {
                    warn!("SIM 卡已变化");
                    self.listener.on_sim_changed();
                    return;
                }
            }
        }

        let current = self.current_interface();
        let local_ip: Option<IpAddr>;
        if active.network_type != current.network_type() {
            info!(
                "网络接入变化: {} -> {}",
                current.network_type(),
                active.network_type
            );
            self.disconnect_from_ims().await;
            current.invalidate_dns();

            self.set_current(active.network_type);
            self.current_interface().invalidate_dns();
            local_ip = self.monitor.local_ip_address(active.network_type);
        } else {
            local_ip = self.monitor.local_ip_address(active.network_type);
            if let Some(ip) = local_ip {
                match current.access_ip() {
                    Some(last) if last == ip => {
                        debug!("本地IP未变化: {}", ip);
                        return;
                    }
                    Some(last) => {
                        info!("本地IP变化: {} -> {}", last, ip);
                        self.disconnect_from_ims().await;
                    }
                    None => {}
                }
            }
        }

        let local_ip = match local_ip {
            Some(ip) if active.connected => ip,
            _ => {
                info!("网络未连接，断开 IMS");
                self.disconnect_from_ims().await;
                return;
            }
        };

        if !self.config.network_access.allows(active.network_type) {
            warn!("网络接入 {} 未授权", active.network_type);
            return;
        }

        if !self.config.operator.is_empty()
            && !self.monitor.sim_operator_name().eq_ignore_ascii_case(&self.config.operator)
        {
            warn!("运营商未授权: {}", self.monitor.sim_operator_name());
            return;
        }

        if active.network_type == NetworkType::Mobile && !self.config.apn_whitelist.is_empty() {
            let allowed = active.apn.as_ref().is_some_and(|apn| {
                self.config
                    .apn_whitelist
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(apn))
            });
            if !allowed {
                warn!("APN 未授权: {:?}", active.apn);
                return;
            }
        }

        let current = self.current_interface();
        if !current.is_configured() {
            warn!("{} 接口未配置", current.network_type());
            return;
        }

        self.connect_to_ims(local_ip);
    }

    fn connect_to_ims(self: &Arc<Self>, ip: IpAddr) {
        self.current_interface().connect(ip);
        self.start_polling();
    }

    async fn disconnect_from_ims(&self) {
        self.stop_polling();
        let current = self.current_interface();
        current.registration_terminated().await;
        current.disconnect();
    }

    // ---- 电量事件 ----

    /// 电量变化，在独立任务中处理
    pub fn on_battery_changed(self: &Arc<Self>, level: u8, plugged: bool) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.battery_event(level, plugged).await })
    }

    pub async fn battery_event(self: &Arc<Self>, level: u8, plugged: bool) {
        let limit = match self.config.min_battery_level {
            MinimumBatteryLevel::NeverStop => {
                self.disconnected_by_battery.store(false, Ordering::SeqCst);
                return;
            }
            MinimumBatteryLevel::Percent(limit) => limit,
        };
        debug!("电量 {}%，充电: {}", level, plugged);

        if level <= limit && !plugged {
            if !self.disconnected_by_battery.swap(true, Ordering::SeqCst) {
                info!("电量低于 {}%，断开 IMS", limit);
                let _event = self.event_lock.lock().await;
                self.disconnect_from_ims().await;
            }
        } else if self.disconnected_by_battery.swap(false, Ordering::SeqCst) {
            info!("电量恢复，重新连接");
            self.connection_event().await;
        }
    }

    // ---- 轮询循环 ----

    fn start_polling(self: &Arc<Self>) {
        let Ok(mut polling) = self.polling.lock() else {
            return;
        };
        if polling.is_some() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        *polling = Some(PollingHandle {
            generation,
            token: token.clone(),
        });

        info!("启动 IMS 轮询 (generation {})", generation);
        let manager = self.clone();
        tokio::spawn(async move { manager.polling_loop(generation, token).await });
    }

    fn stop_polling(&self) {
        let handle = self.polling.lock().ok().and_then(|mut p| p.take());
        if let Some(handle) = handle {
            info!("停止 IMS 轮询 (generation {})", handle.generation);
            self.generation.fetch_add(1, Ordering::SeqCst);
            handle.token.cancel();
        }
        if self.services_started.swap(false, Ordering::SeqCst) {
            self.listener.stop_services();
        }
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn polling_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        let mut failures: u32 = 0;

        while self.is_current_generation(generation) {
            let iface = self.current_interface();

            if !iface.is_registered() {
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = iface.register() => result,
                };
                if !self.is_current_generation(generation) {
                    break;
                }
                match result {
                    Ok(()) => {
                        failures = 0;
                        self.start_services_once();
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        warn!("IMS 注册失败 ({} 次): {}", failures, e);
                        iface.invalidate_dns();
                    }
                }
            } else if self.listener.is_initialization_finished() {
                if self.services_started.load(Ordering::SeqCst) {
                    self.listener.check_services();
                } else {
                    self.start_services_once();
                }
            }

            if !self.is_current_generation(generation) {
                break;
            }

            let pause = self.next_pause(&iface, failures);
            debug!("{:?} 后再次轮询", pause);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!("IMS 轮询退出 (generation {})", generation);
    }

    fn start_services_once(&self) {
        if self.listener.is_initialization_finished() && !self.services_started.swap(true, Ordering::SeqCst) {
            info!("启动 IMS 服务");
            self.listener.start_services();
        }
    }

    fn next_pause(&self, iface: &NetworkInterface, failures: u32) -> Duration {
        if !iface.is_registered() {
            let retry_after = iface.retry_after();
            if !retry_after.is_zero() {
                return retry_after;
            }
            registration_backoff(
                self.config.register_retry_base_time,
                self.config.register_retry_max_time,
                failures,
                jitter_coefficient(),
            )
        } else if !self.services_started.load(Ordering::SeqCst) {
            self.config.service_start_retry
        } else {
            self.config.service_polling_period
        }
    }

    /// 停止连接管理并注销
    pub async fn terminate(&self) {
        info!("终止 IMS 连接管理");
        let _event = self.event_lock.lock().await;
        self.terminated.store(true, Ordering::SeqCst);
        self.stop_polling();
        self.current_interface().unregister().await;
        info!("IMS 连接管理已终止");
    }
}
