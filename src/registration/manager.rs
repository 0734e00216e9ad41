/// REGISTER 状态机
///
/// 一个 RegistrationManager 对应一个网络接口，负责：
/// - 维护注册对话（Call-ID、CSeq、目标、路由）
/// - 处理 200/302/401/423/4xx/5xx/6xx 响应和超时
/// - NAT 检测、定时刷新注册、注销
///
/// 同一个 manager 上的注册、注销和停止通过内部异步锁串行执行。
use super::feature_tags::FeatureTagSet;
use super::traits::{AuthProcedure, ReasonCode, RegistrationListener, RegistrationState};
use crate::config::{ImsConfig, SipProtocol};
use crate::error::{FailureKind, RegistrationError, RegistrationResult};
use crate::sip_message::{self, RegisterParams, PUBLIC_GRUU_PARAM, SIP_INSTANCE_PARAM, TEMP_GRUU_PARAM};
use crate::sip_transport::{RegistrationInfo, SipTransport};
use crate::utils::{jitter_coefficient, make_call_id, scale};
use rsip::{Host, Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 401 以及 4xx/5xx/6xx 的重试上限
pub const MAX_REGISTRATION_FAILURES: u32 = 3;

const REFRESH_MARGIN_SECS: u32 = 600;
const REFRESH_MARGIN_THRESHOLD_SECS: u32 = 1200;

/// 计算下一次刷新注册的延迟
///
/// 过期时间大于 1200 秒时提前 600 秒刷新，否则在过期时间的 50%~100% 之间随机取值
pub fn refresh_delay(expiry: u32) -> Duration {
    if expiry > REFRESH_MARGIN_THRESHOLD_SECS {
        Duration::from_secs(u64::from(expiry - REFRESH_MARGIN_SECS))
    } else {
        scale(Duration::from_secs(u64::from(expiry)), jitter_coefficient())
    }
}

/// 注册对话
#[derive(Debug, Clone)]
struct DialogContext {
    call_id: String,
    cseq: u32,
    target: String,
    local_party: String,
    remote_party: String,
    route: Vec<String>,
}

#[derive(Debug, Default)]
struct RetryBudget {
    unauthorized: u32,
    error_responses: u32,
    redirects: u32,
}

/// NAT 状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatState {
    pub behind_nat: bool,
    pub public_address: Option<String>,
    pub public_port: Option<u16>,
}

struct Inner {
    dialog: Option<DialogContext>,
    budget: RetryBudget,
}

/// 注册进行中的标记，drop 时清除
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn same_host(host: &Host, local: IpAddr) -> bool {
    match host {
        Host::IpAddr(ip) => *ip == local,
        Host::Domain(_) => false,
    }
}

pub struct RegistrationManager {
    config: Arc<ImsConfig>,
    protocol: SipProtocol,
    transport: Arc<dyn SipTransport>,
    auth: Arc<dyn AuthProcedure>,
    listener: Arc<dyn RegistrationListener>,
    battery_low: Arc<AtomicBool>,
    inner: Mutex<Inner>,
    refresh: StdMutex<Option<CancellationToken>>,
    state: AtomicU8,
    reason: AtomicU8,
    in_flight: AtomicBool,
    pending_unregister: AtomicBool,
    expire_period: AtomicU32,
    retry_after_ms: AtomicU64,
    nat: RwLock<NatState>,
    info: RwLock<RegistrationInfo>,
}

impl RegistrationManager {
    pub fn new(
        config: Arc<ImsConfig>,
        protocol: SipProtocol,
        transport: Arc<dyn SipTransport>,
        auth: Arc<dyn AuthProcedure>,
        listener: Arc<dyn RegistrationListener>,
        battery_low: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let expire_period = config.register_expire_period;
        Arc::new(Self {
            config,
            protocol,
            transport,
            auth,
            listener,
            battery_low,
            inner: Mutex::new(Inner {
                dialog: None,
                budget: RetryBudget::default(),
            }),
            refresh: StdMutex::new(None),
            state: AtomicU8::new(0),
            reason: AtomicU8::new(ReasonCode::Unspecified.as_u8()),
            in_flight: AtomicBool::new(false),
            pending_unregister: AtomicBool::new(false),
            expire_period: AtomicU32::new(expire_period),
            retry_after_ms: AtomicU64::new(0),
            nat: RwLock::new(NatState::default()),
            info: RwLock::new(RegistrationInfo::default()),
        })
    }

    // ---- 状态访问 ----

    pub fn state(&self) -> RegistrationState {
        match self.state.load(Ordering::SeqCst) {
            1 => RegistrationState::Registering,
            2 => RegistrationState::Registered,
            _ => RegistrationState::Unregistered,
        }
    }

    fn set_state(&self, state: RegistrationState) {
        let value = match state {
            RegistrationState::Unregistered => 0,
            RegistrationState::Registering => 1,
            RegistrationState::Registered => 2,
        };
        self.state.store(value, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    pub fn reason_code(&self) -> ReasonCode {
        ReasonCode::from_u8(self.reason.load(Ordering::SeqCst))
    }

    fn set_reason(&self, reason: ReasonCode) {
        self.reason.store(reason.as_u8(), Ordering::SeqCst);
    }

    /// 当前协商的过期时间（秒）
    pub fn expire_period(&self) -> u32 {
        self.expire_period.load(Ordering::SeqCst)
    }

    /// 服务器通过 Retry-After 要求的等待时间，零表示没有
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms.load(Ordering::SeqCst))
    }

    pub fn nat_state(&self) -> NatState {
        self.nat.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn registration_info(&self) -> RegistrationInfo {
        self.info.read().map(|i| i.clone()).unwrap_or_default()
    }

    fn set_nat(&self, nat: NatState) {
        if let Ok(mut current) = self.nat.write() {
            *current = nat;
        }
    }

    fn failure_reason(&self) -> ReasonCode {
        if self.battery_low.load(Ordering::SeqCst) {
            ReasonCode::BatteryLow
        } else {
            ReasonCode::ConnectionLost
        }
    }

    // ---- 刷新定时器 ----

    fn cancel_refresh(&self) {
        if let Ok(mut refresh) = self.refresh.lock() {
            if let Some(token) = refresh.take() {
                token.cancel();
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, delay: Duration) {
        let token = CancellationToken::new();
        if let Ok(mut refresh) = self.refresh.lock() {
            if let Some(old) = refresh.replace(token.clone()) {
                old.cancel();
            }
        }

        info!("下次注册刷新在 {:?} 后", delay);
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("注册刷新已取消");
                }
                _ = tokio::time::sleep(delay) => {
                    manager.refresh_registration(token).await;
                }
            }
        });
    }

    async fn refresh_registration(self: &Arc<Self>, token: CancellationToken) {
        let inner = self.inner.lock().await;
        if token.is_cancelled() {
            return;
        }
        info!("刷新注册");
        if let Err(e) = self.run_attempt(inner).await {
            warn!("刷新注册失败: {}", e);
        }
    }

    // ---- 注册 ----

    /// 执行一次注册（包括 401/423/302 等的重发），失败时转换为状态迁移和监听器通知
    pub async fn register(self: &Arc<Self>) -> RegistrationResult<()> {
        let inner = self.inner.lock().await;
        self.run_attempt(inner).await
    }

    async fn run_attempt(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>) -> RegistrationResult<()> {
        let _in_flight = InFlight::enter(&self.in_flight);
        // 刷新期间保持已注册
        if !self.is_registered() {
            self.set_state(RegistrationState::Registering);
        }

        match self.attempt(&mut inner).await {
            Ok(()) => {
                if self.pending_unregister.swap(false, Ordering::SeqCst) {
                    info!("注册期间收到注销请求，立即注销");
                    self.unregister_locked(&mut inner).await;
                }
                Ok(())
            }
            Err(e) => {
                self.fail(&mut inner, &e);
                Err(e)
            }
        }
    }

    fn new_dialog(&self, local_addr: SocketAddr) -> DialogContext {
        let public_uri = self.auth.public_uri();
        DialogContext {
            call_id: make_call_id(Some(&local_addr.ip().to_string())),
            cseq: 1,
            target: format!("sip:{}", self.auth.home_domain()),
            local_party: public_uri.clone(),
            remote_party: public_uri,
            route: self.transport.default_route(),
        }
    }

    fn build_request(
        &self,
        dialog: &DialogContext,
        local_addr: SocketAddr,
        expires: u32,
        feature_tags: &FeatureTagSet,
    ) -> RegistrationResult<Request> {
        let instance_id = if self.config.gruu_enabled && !self.config.instance_id.is_empty() {
            Some(self.config.instance_id.as_str())
        } else {
            None
        };
        let mut request = sip_message::build_register(&RegisterParams {
            target: &dialog.target,
            local_party: &dialog.local_party,
            remote_party: &dialog.remote_party,
            call_id: &dialog.call_id,
            cseq: dialog.cseq,
            route: &dialog.route,
            local_addr,
            protocol: self.protocol,
            expires,
            feature_tags: feature_tags.as_slice(),
            instance_id,
            user_agent: &self.config.user_agent,
        })?;
        self.auth.write_security_header(&mut request)?;
        Ok(request)
    }

    async fn send(&self, request: Request) -> RegistrationResult<Response> {
        debug!("发送 REGISTER:\n{}", request);
        match self.transport.send_and_wait(request, self.config.sip_timeout).await? {
            Some(response) => {
                debug!("收到响应: {}", response.status_code);
                Ok(response)
            }
            None => Err(RegistrationError::Timeout(self.config.sip_timeout)),
        }
    }

    async fn attempt(self: &Arc<Self>, inner: &mut Inner) -> RegistrationResult<()> {
        let local_addr = self.transport.local_addr().ok_or(RegistrationError::NotConnected)?;

        match inner.dialog.as_mut() {
            Some(dialog) => dialog.cseq += 1,
            None => {
                self.auth.init();
                inner.dialog = Some(self.new_dialog(local_addr));
                self.expire_period
                    .store(self.config.register_expire_period, Ordering::SeqCst);
            }
        }
        inner.budget = RetryBudget::default();
        self.retry_after_ms.store(0, Ordering::SeqCst);

        // 配置可能在两次注册之间变化
        let feature_tags = FeatureTagSet::from_config(&self.config.capabilities);
        let mut expires = self.expire_period();

        loop {
            let dialog = inner
                .dialog
                .as_mut()
                .ok_or_else(|| RegistrationError::protocol("注册对话已丢失"))?;
            let request = self.build_request(dialog, local_addr, expires, &feature_tags)?;
            info!(
                "发送 REGISTER: {} cseq={} expires={} ({})",
                dialog.target,
                dialog.cseq,
                expires,
                self.auth.name()
            );
            let response = self.send(request).await?;

            let code = sip_message::status_code(&response);
            match code {
                200 => {
                    self.handle_success(&response, local_addr, expires)?;
                    return Ok(());
                }
                302 => {
                    inner.budget.redirects += 1;
                    if inner.budget.redirects >= MAX_REGISTRATION_FAILURES {
                        return Err(RegistrationError::protocol("302 重定向次数过多"));
                    }
                    let contact = sip_message::contacts(&response.headers)
                        .into_iter()
                        .next()
                        .ok_or_else(|| RegistrationError::protocol("302 缺少 Contact"))?;
                    info!("注册被重定向到 {}", contact.uri);
                    dialog.target = contact.uri.to_string();
                    dialog.cseq += 1;
                }
                401 => {
                    inner.budget.unauthorized += 1;
                    if inner.budget.unauthorized >= MAX_REGISTRATION_FAILURES {
                        return Err(RegistrationError::RetryExhausted {
                            kind: FailureKind::Unauthorized,
                            count: inner.budget.unauthorized,
                        });
                    }
                    info!("收到 401，第 {} 次认证", inner.budget.unauthorized);
                    self.auth.read_security_header(&response)?;
                    dialog.cseq += 1;
                }
                423 => {
                    let min = sip_message::min_expires(&response.headers)
                        .ok_or_else(|| RegistrationError::protocol("423 缺少 Min-Expires"))?;
                    info!("过期时间太短，采用 Min-Expires: {}", min);
                    self.expire_period.store(min, Ordering::SeqCst);
                    expires = min;
                    dialog.cseq += 1;
                }
                404 | 408 | 480 | 500..=599 | 600 => {
                    if let Some(delay) = sip_message::retry_after(&response.headers).filter(|d| !d.is_zero()) {
                        warn!("收到 {}，服务器要求 {:?} 后重试", code, delay);
                        self.retry_after_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
                        return Err(RegistrationError::RetryAfter { code, delay });
                    }
                    inner.budget.error_responses += 1;
                    if inner.budget.error_responses >= MAX_REGISTRATION_FAILURES {
                        return Err(RegistrationError::RetryExhausted {
                            kind: FailureKind::ErrorResponse,
                            count: inner.budget.error_responses,
                        });
                    }
                    warn!("收到 {}，重发注册 ({}/{})", code, inner.budget.error_responses, MAX_REGISTRATION_FAILURES);
                    dialog.cseq += 1;
                }
                _ => {
                    return Err(RegistrationError::UnexpectedStatus {
                        code,
                        reason: response.status_code.to_string(),
                    });
                }
            }
        }
    }

    fn handle_success(self: &Arc<Self>, response: &Response, local_addr: SocketAddr, requested: u32) -> RegistrationResult<()> {
        self.auth.read_security_header(response)?;

        let info = self.extract_info(response);
        self.detect_nat(response, local_addr.ip());

        let expiry = self.negotiated_expiry(response, local_addr.ip()).unwrap_or(requested);
        if expiry == 0 {
            return Err(RegistrationError::protocol("200 OK 的过期时间为 0"));
        }
        self.expire_period.store(expiry, Ordering::SeqCst);

        self.transport.set_registration_info(&info);
        if let Ok(mut current) = self.info.write() {
            *current = info;
        }

        self.set_state(RegistrationState::Registered);
        self.set_reason(ReasonCode::Unspecified);
        info!("注册成功，过期时间 {} 秒", expiry);

        self.schedule_refresh(refresh_delay(expiry));
        self.listener.on_registration_successful();
        Ok(())
    }

    fn extract_info(&self, response: &Response) -> RegistrationInfo {
        let mut info = RegistrationInfo {
            associated_uris: sip_message::associated_uris(&response.headers),
            service_route: sip_message::service_routes(&response.headers),
            ..Default::default()
        };

        if self.config.gruu_enabled {
            let instance = self.config.instance_id.trim_matches('"');
            if let Some(contact) = sip_message::contacts(&response.headers)
                .into_iter()
                .find(|c| c.param(SIP_INSTANCE_PARAM) == Some(instance))
            {
                info.public_gruu = contact.param(PUBLIC_GRUU_PARAM).map(str::to_string);
                info.temp_gruu = contact.param(TEMP_GRUU_PARAM).map(str::to_string);
            }
        }
        info
    }

    /// 比较顶层 Via 的 received/rport 与本地地址
    fn detect_nat(&self, response: &Response, local_ip: IpAddr) {
        let Some(via) = sip_message::top_via(&response.headers) else {
            return;
        };
        let via_mismatch = !same_host(&via.host, local_ip);
        let received = via.received.filter(|r| *r != local_ip);

        if via_mismatch || received.is_some() {
            let public_address = received.map(|ip| ip.to_string()).unwrap_or_else(|| via.host.to_string());
            let public_port = via.rport.or(via.port);
            info!("检测到NAT: 公网地址 {}:{:?}", public_address, public_port);
            self.set_nat(NatState {
                behind_nat: true,
                public_address: Some(public_address),
                public_port,
            });
        } else {
            self.set_nat(NatState::default());
        }
    }

    /// 协商的过期时间：优先本机 Contact 的 expires 参数，其次 Expires 头
    ///
    /// 本机 Contact 存在但没有 expires 时返回 None，保持请求的值
    fn negotiated_expiry(&self, response: &Response, local_ip: IpAddr) -> Option<u32> {
        let contacts = sip_message::contacts(&response.headers);
        let mut own = contacts
            .iter()
            .filter(|c| same_host(c.host(), local_ip))
            .peekable();
        if own.peek().is_none() {
            return sip_message::expires(&response.headers);
        }
        own.find_map(|c| c.expires())
    }

    fn fail(&self, inner: &mut Inner, err: &RegistrationError) {
        let reason = self.failure_reason();
        error!("注册失败 [{}]: {} ({})", err.error_code(), err, reason);
        self.set_state(RegistrationState::Unregistered);
        self.set_reason(reason);
        inner.dialog = None;
        self.cancel_refresh();
        self.pending_unregister.store(false, Ordering::SeqCst);
        self.listener.on_registration_failed(err);
    }

    // ---- 注销 ----

    /// 注销（发送 expires=0），未注册时无操作
    ///
    /// 如果有注册正在进行，先标记延迟注销，由进行中的注册在成功后执行
    pub async fn unregistration(&self) {
        if self.in_flight.load(Ordering::SeqCst) {
            debug!("注册进行中，延迟注销");
            self.pending_unregister.store(true, Ordering::SeqCst);
        }
        let mut inner = self.inner.lock().await;
        self.pending_unregister.store(false, Ordering::SeqCst);
        self.unregister_locked(&mut inner).await;
    }

    async fn unregister_locked(&self, inner: &mut Inner) {
        if !self.is_registered() {
            debug!("未注册，忽略注销");
            return;
        }
        self.cancel_refresh();

        if let (Some(dialog), Some(local_addr)) = (inner.dialog.as_mut(), self.transport.local_addr()) {
            let tags = FeatureTagSet::from_config(&self.config.capabilities);
            for _ in 0..MAX_REGISTRATION_FAILURES {
                dialog.cseq += 1;
                let request = match self.build_request(dialog, local_addr, 0, &tags) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("构造注销请求失败: {}", e);
                        break;
                    }
                };
                match self.send(request).await {
                    Ok(response) if sip_message::status_code(&response) == 401 => {
                        if self.auth.read_security_header(&response).is_err() {
                            break;
                        }
                    }
                    Ok(response) if sip_message::status_code(&response) == 200 => {
                        info!("注销成功");
                        if let Ok(mut nat) = self.nat.write() {
                            nat.public_address = None;
                            nat.public_port = None;
                        }
                        break;
                    }
                    Ok(response) => {
                        warn!("注销响应: {}", response.status_code);
                        break;
                    }
                    Err(e) => {
                        warn!("注销失败（忽略）: {}", e);
                        break;
                    }
                }
            }
        }

        inner.dialog = None;
        self.set_nat(NatState::default());
        self.set_state(RegistrationState::Unregistered);
        let reason = self.failure_reason();
        self.set_reason(reason);
        info!("注册已终止 ({})", reason);
        self.listener.on_registration_terminated(reason);
    }

    /// 不通知服务器，直接停止注册
    pub async fn stop_registration(&self) {
        self.cancel_refresh();
        let mut inner = self.inner.lock().await;
        self.cancel_refresh();
        inner.dialog = None;

        let was_registered = self.is_registered();
        self.set_state(RegistrationState::Unregistered);
        if was_registered {
            let reason = self.failure_reason();
            self.set_reason(reason);
            info!("注册已停止 ({})", reason);
            self.listener.on_registration_terminated(reason);
        }
    }

    /// 本地停止后在后台重新注册（配置变化时使用）
    pub fn restart(self: &Arc<Self>) -> JoinHandle<RegistrationResult<()>> {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.stop_registration().await;
            manager.register().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthenticationMode;
    use crate::registration::AuthProcedureFactory;
    use crate::test_support::{response, MockTransport, RecordingListener};

    const LOCAL: &str = "10.0.0.2:5060";

    fn config() -> Arc<ImsConfig> {
        Arc::new(ImsConfig::new("ims.example.com", "alice", "example.com", "secret").unwrap())
    }

    fn manager(transport: Arc<MockTransport>, listener: Arc<RecordingListener>) -> Arc<RegistrationManager> {
        let config = config();
        let auth = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
        RegistrationManager::new(
            config,
            SipProtocol::Udp,
            transport,
            auth,
            listener,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn ok(expires: &str) -> Response {
        response(
            200,
            vec![
                ("Via", "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK1;rport=5060;received=10.0.0.2"),
                ("Expires", expires),
            ],
        )
    }

    fn challenge() -> Response {
        response(401, vec![("WWW-Authenticate", "Digest realm=\"example.com\",nonce=\"n\"")])
    }

    fn cseq(request: &Request) -> String {
        sip_message::first_header(&request.headers, "CSeq").unwrap_or_default()
    }

    #[tokio::test]
    async fn test_challenge_then_success() {
        let transport = MockTransport::new(LOCAL);
        transport.push(challenge());
        transport.push(ok("3600"));
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());

        manager.register().await.unwrap();
        assert!(manager.is_registered());
        assert_eq!(manager.expire_period(), 3600);
        assert_eq!(listener.successes(), 1);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(cseq(&requests[0]), "1 REGISTER");
        assert_eq!(cseq(&requests[1]), "2 REGISTER");
        assert!(sip_message::first_header(&requests[0].headers, "Authorization").is_none());
        assert!(sip_message::first_header(&requests[1].headers, "Authorization").is_some());
        assert_eq!(
            sip_message::first_header(&requests[0].headers, "Call-ID"),
            sip_message::first_header(&requests[1].headers, "Call-ID")
        );
    }

    #[tokio::test]
    async fn test_three_401_is_fatal() {
        let transport = MockTransport::new(LOCAL);
        for _ in 0..5 {
            transport.push(challenge());
        }
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());

        let err = manager.register().await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::RetryExhausted {
                kind: FailureKind::Unauthorized,
                count: 3
            }
        ));
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(manager.state(), RegistrationState::Unregistered);
        assert_eq!(manager.reason_code(), ReasonCode::ConnectionLost);
        assert_eq!(listener.failures(), 1);
    }

    #[tokio::test]
    async fn test_423_min_expires_persists() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(423, vec![("Min-Expires", "600")]));
        transport.push(response(200, vec![]));
        let listener = RecordingListener::new();
        let config = Arc::new(
            ImsConfig::new("ims.example.com", "alice", "example.com", "secret")
                .unwrap()
                .with_expire_period(300),
        );
        let auth = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
        let manager = RegistrationManager::new(
            config,
            SipProtocol::Udp,
            transport.clone(),
            auth,
            listener,
            Arc::new(AtomicBool::new(false)),
        );

        manager.register().await.unwrap();
        let requests = transport.requests();
        assert_eq!(sip_message::expires(&requests[0].headers), Some(300));
        assert_eq!(sip_message::expires(&requests[1].headers), Some(600));
        assert_eq!(manager.expire_period(), 600);

        // 刷新继续使用 600
        transport.push(response(200, vec![]));
        manager.register().await.unwrap();
        let requests = transport.requests();
        assert_eq!(sip_message::expires(&requests[2].headers), Some(600));
        assert_eq!(cseq(&requests[2]), "3 REGISTER");
    }

    #[tokio::test]
    async fn test_423_without_min_expires_is_fatal() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(423, vec![]));
        let manager = manager(transport, RecordingListener::new());
        assert!(matches!(manager.register().await, Err(RegistrationError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_three_error_responses_are_fatal() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(503, vec![]));
        transport.push(response(404, vec![]));
        transport.push(response(480, vec![]));
        let manager = manager(transport.clone(), RecordingListener::new());

        let err = manager.register().await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::RetryExhausted {
                kind: FailureKind::ErrorResponse,
                count: 3
            }
        ));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_after_recorded() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(503, vec![("Retry-After", "120")]));
        let manager = manager(transport.clone(), RecordingListener::new());

        let err = manager.register().await.unwrap_err();
        assert_eq!(err.sip_status_code(), Some(503));
        assert_eq!(manager.retry_after(), Duration::from_secs(120));
        assert_eq!(transport.requests().len(), 1);

        // 下一次注册开始时清零
        transport.push(ok("600"));
        manager.register().await.unwrap();
        assert_eq!(manager.retry_after(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_redirect_rewrites_target() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(302, vec![("Contact", "<sip:registrar2.example.com>")]));
        transport.push(ok("600"));
        let manager = manager(transport.clone(), RecordingListener::new());

        manager.register().await.unwrap();
        let requests = transport.requests();
        assert_eq!(requests[1].uri.to_string(), "sip:registrar2.example.com");
        assert_eq!(cseq(&requests[1]), "2 REGISTER");
    }

    #[tokio::test]
    async fn test_timeout_is_fatal() {
        let transport = MockTransport::new(LOCAL);
        let listener = RecordingListener::new();
        let manager = manager(transport, listener.clone());
        assert!(matches!(manager.register().await, Err(RegistrationError::Timeout(_))));
        assert_eq!(listener.failures(), 1);
    }

    #[tokio::test]
    async fn test_nat_detected_then_cleared() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(
            200,
            vec![
                ("Via", "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK1;received=203.0.113.9;rport=40000"),
                ("Expires", "600"),
            ],
        ));
        transport.push(ok("600"));
        let manager = manager(transport, RecordingListener::new());

        manager.register().await.unwrap();
        let nat = manager.nat_state();
        assert!(nat.behind_nat);
        assert_eq!(nat.public_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(nat.public_port, Some(40000));

        manager.register().await.unwrap();
        assert_eq!(manager.nat_state(), NatState::default());
    }

    #[tokio::test]
    async fn test_nat_detected_over_ipv6() {
        let transport = MockTransport::new("[2001:db8::2]:5060");
        transport.push(response(
            200,
            vec![
                ("Via", "SIP/2.0/UDP [2001:db8::2]:5060;branch=z9hG4bK1;received=2001:db8::77;rport=6000"),
                ("Contact", "<sip:[2001:db8::2]:5060>;expires=900"),
            ],
        ));
        let manager = manager(transport, RecordingListener::new());

        manager.register().await.unwrap();
        let nat = manager.nat_state();
        assert!(nat.behind_nat);
        assert_eq!(nat.public_address.as_deref(), Some("2001:db8::77"));
        assert_eq!(nat.public_port, Some(6000));
        assert_eq!(manager.expire_period(), 900);
    }

    #[tokio::test]
    async fn test_contact_expiry_preferred_over_header() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(
            200,
            vec![
                ("Contact", "<sip:10.0.0.9:5060>;expires=100, <sip:10.0.0.2:5060;transport=udp>;expires=1800"),
                ("Expires", "3600"),
            ],
        ));
        let manager = manager(transport, RecordingListener::new());
        manager.register().await.unwrap();
        assert_eq!(manager.expire_period(), 1800);
    }

    #[tokio::test]
    async fn test_registration_info_and_gruu() {
        let transport = MockTransport::new(LOCAL);
        let config = config();
        let contact = format!(
            "<sip:10.0.0.2:5060>;expires=600;+sip.instance=\"{}\";pub-gruu=\"sip:alice@example.com;gr=urn:uuid:1\"",
            config.instance_id
        );
        transport.push(response(
            200,
            vec![
                ("Contact", contact.as_str()),
                ("P-Associated-URI", "<sip:alice@example.com>, <tel:+331234>"),
                ("Service-Route", "<sip:orig@scscf.example.com;lr>"),
            ],
        ));
        let auth = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
        let manager = RegistrationManager::new(
            config,
            SipProtocol::Udp,
            transport.clone(),
            auth,
            RecordingListener::new(),
            Arc::new(AtomicBool::new(false)),
        );

        manager.register().await.unwrap();
        let info = manager.registration_info();
        assert_eq!(info.associated_uris.len(), 2);
        assert_eq!(info.service_route, vec!["<sip:orig@scscf.example.com;lr>".to_string()]);
        assert_eq!(info.public_gruu.as_deref(), Some("sip:alice@example.com;gr=urn:uuid:1"));
        assert_eq!(transport.registration_info(), Some(info));
    }

    #[tokio::test]
    async fn test_unregistration_is_idempotent() {
        let transport = MockTransport::new(LOCAL);
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());

        manager.unregistration().await;
        assert!(transport.requests().is_empty());
        assert_eq!(listener.terminations(), 0);

        transport.push(ok("600"));
        manager.register().await.unwrap();
        transport.push(ok("0"));
        manager.unregistration().await;
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(sip_message::expires(&requests[1].headers), Some(0));
        assert!(!manager.is_registered());
        assert_eq!(listener.terminations(), 1);
        assert_eq!(manager.reason_code(), ReasonCode::ConnectionLost);
        assert_eq!(listener.last_reason(), Some(ReasonCode::ConnectionLost));

        manager.unregistration().await;
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_unregistration_on_low_battery_reports_battery() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("600"));
        transport.push(ok("0"));
        let listener = RecordingListener::new();
        let config = config();
        let auth = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
        let battery_low = Arc::new(AtomicBool::new(false));
        let manager = RegistrationManager::new(
            config,
            SipProtocol::Udp,
            transport,
            auth,
            listener.clone(),
            battery_low.clone(),
        );
        manager.register().await.unwrap();

        battery_low.store(true, Ordering::SeqCst);
        manager.unregistration().await;
        assert_eq!(manager.reason_code(), ReasonCode::BatteryLow);
        assert_eq!(listener.last_reason(), Some(ReasonCode::BatteryLow));
    }

    #[tokio::test]
    async fn test_unregistration_swallows_transport_errors() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("600"));
        let manager = manager(transport.clone(), RecordingListener::new());
        manager.register().await.unwrap();

        // 队列为空：注销超时
        manager.unregistration().await;
        assert!(!manager.is_registered());
    }

    #[tokio::test]
    async fn test_deferred_unregister_during_registration() {
        let transport = MockTransport::new(LOCAL);
        transport.set_delay(Duration::from_millis(100));
        transport.push(ok("600"));
        transport.push(ok("0"));
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());

        let registering = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.register().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.unregistration().await;

        registering.await.unwrap().unwrap();
        assert!(!manager.is_registered());
        assert_eq!(listener.successes(), 1);
        assert_eq!(listener.terminations(), 1);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(sip_message::expires(&requests[1].headers), Some(0));
    }

    #[tokio::test]
    async fn test_stop_registration_is_local() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("600"));
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());
        manager.register().await.unwrap();

        manager.stop_registration().await;
        assert!(!manager.is_registered());
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(listener.terminations(), 1);

        // 新的对话从 cseq 1 开始
        transport.push(ok("600"));
        manager.register().await.unwrap();
        assert_eq!(cseq(&transport.requests()[1]), "1 REGISTER");
    }

    #[tokio::test]
    async fn test_failure_with_low_battery_reason() {
        let transport = MockTransport::new(LOCAL);
        let config = config();
        let auth = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
        let battery_low = Arc::new(AtomicBool::new(true));
        let manager = RegistrationManager::new(
            config,
            SipProtocol::Udp,
            transport,
            auth,
            RecordingListener::new(),
            battery_low,
        );
        assert!(manager.register().await.is_err());
        assert_eq!(manager.reason_code(), ReasonCode::BatteryLow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_fires_before_expiry() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("3600"));
        transport.push(ok("3600"));
        let manager = manager(transport.clone(), RecordingListener::new());
        manager.register().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2999)).await;
        assert_eq!(transport.requests().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(cseq(&transport.requests()[1]), "2 REGISTER");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_in_progress_stays_registered() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("3600"));
        transport.push(ok("3600"));
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());
        manager.register().await.unwrap();

        transport.set_delay(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(3001)).await;
        assert_eq!(transport.register_count(), 2);
        assert_eq!(manager.state(), RegistrationState::Registered);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(manager.is_registered());
        assert_eq!(listener.successes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_unregisters() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("3600"));
        transport.push(response(403, vec![]));
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());
        manager.register().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3001)).await;
        assert_eq!(manager.state(), RegistrationState::Unregistered);
        assert_eq!(manager.reason_code(), ReasonCode::ConnectionLost);
        assert_eq!(listener.failures(), 1);
    }

    #[test]
    fn test_refresh_delay() {
        assert_eq!(refresh_delay(3600), Duration::from_secs(3000));
        for _ in 0..100 {
            let delay = refresh_delay(1000);
            assert!(delay >= Duration::from_secs(500) && delay <= Duration::from_secs(1000));
        }
        let delay = refresh_delay(1200);
        assert!(delay >= Duration::from_secs(600) && delay <= Duration::from_secs(1200));
    }
    #[tokio::test]
    async fn test_own_contact_without_expires_keeps_requested() {
        let transport = MockTransport::new(LOCAL);
        transport.push(response(
            200,
            vec![("Contact", "<sip:10.0.0.2:5060;transport=udp>"), ("Expires", "3600")],
        ));
        let manager = manager(transport, RecordingListener::new());

        manager.register().await.unwrap();
        assert_eq!(manager.expire_period(), 600);
    }

    #[tokio::test]
    async fn test_restart_registers_again_in_background() {
        let transport = MockTransport::new(LOCAL);
        transport.push(ok("600"));
        transport.push(ok("600"));
        let listener = RecordingListener::new();
        let manager = manager(transport.clone(), listener.clone());
        manager.register().await.unwrap();

        manager.restart().await.unwrap().unwrap();
        assert!(manager.is_registered());
        assert_eq!(transport.register_count(), 2);
        assert_eq!(listener.terminations(), 1);
        assert_eq!(listener.successes(), 2);
        // 重新建立对话
        assert_eq!(cseq(&transport.requests()[1]), "1 REGISTER");
    }
}
