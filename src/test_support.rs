/// 测试辅助：脚本化的传输层、静态 DNS、模拟网络监视器和记录型监听器
use crate::config::{NetworkType, SipProtocol};
use crate::connection_manager::ImsCoreListener;
use crate::error::{RegistrationError, RegistrationResult};
use crate::network_monitor::{ActiveNetwork, NetworkMonitor};
use crate::proxy_resolver::{DnsLookup, NaptrRecord, SrvRecord};
use crate::registration::{ReasonCode, RegistrationListener};
use crate::sip_message::{self, RegisterParams};
use crate::sip_transport::{RegistrationInfo, SipTransport, StackConfig};
use async_trait::async_trait;
use rsip::{Header, Headers, Request, Response, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 构造带扩展头的响应
pub fn response(code: u16, headers: Vec<(&str, &str)>) -> Response {
    let mut list = Headers::default();
    for (name, value) in headers {
        list.push(Header::Other(name.to_string(), value.to_string()));
    }
    Response {
        status_code: StatusCode::from(code),
        version: rsip::Version::V2,
        headers: list,
        body: vec![],
    }
}

/// 一个固定的 REGISTER 请求
pub fn register_request() -> Request {
    sip_message::build_register(&RegisterParams {
        target: "sip:example.com",
        local_party: "sip:alice@example.com",
        remote_party: "sip:alice@example.com",
        call_id: "test-call-id",
        cseq: 1,
        route: &[],
        local_addr: "10.0.0.2:5060".parse().unwrap(),
        protocol: SipProtocol::Udp,
        expires: 600,
        feature_tags: &[],
        instance_id: None,
        user_agent: "test",
    })
    .unwrap()
}

/// 按顺序返回预设响应的传输层，队列为空时按超时处理
pub struct MockTransport {
    local: SocketAddr,
    responses: Mutex<VecDeque<Response>>,
    default_response: Mutex<Option<Response>>,
    requests: Mutex<Vec<Request>>,
    stacks: Mutex<Vec<StackConfig>>,
    delay: Mutex<Duration>,
    initialized: AtomicBool,
    closed: AtomicUsize,
    info: Mutex<Option<RegistrationInfo>>,
}

impl MockTransport {
    /// 已初始化的传输层（直接用于 RegistrationManager 测试）
    pub fn new(local: &str) -> Arc<Self> {
        let transport = Self::uninitialized(local);
        transport.initialized.store(true, Ordering::SeqCst);
        transport
    }

    /// 需要先 init_stack 的传输层
    pub fn uninitialized(local: &str) -> Arc<Self> {
        Arc::new(Self {
            local: local.parse().unwrap(),
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            stacks: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            initialized: AtomicBool::new(false),
            closed: AtomicUsize::new(0),
            info: Mutex::new(None),
        })
    }

    pub fn push(&self, response: Response) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// 队列为空时返回的响应
    pub fn set_default(&self, response: Response) {
        *self.default_response.lock().unwrap() = Some(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn register_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == rsip::Method::Register)
            .count()
    }

    pub fn stacks(&self) -> Vec<StackConfig> {
        self.stacks.lock().unwrap().clone()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn registration_info(&self) -> Option<RegistrationInfo> {
        self.info.lock().unwrap().clone()
    }
}

#[async_trait]
impl SipTransport for MockTransport {
    async fn init_stack(&self, config: StackConfig) -> RegistrationResult<()> {
        self.stacks.lock().unwrap().push(config);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_and_wait(&self, request: Request, _timeout: Duration) -> RegistrationResult<Option<Response>> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(RegistrationError::NotConnected);
        }
        self.requests.lock().unwrap().push(request);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.or_else(|| self.default_response.lock().unwrap().clone()))
    }

    async fn close_stack(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn default_route(&self) -> Vec<String> {
        vec!["<sip:pcscf.example.com;lr>".to_string()]
    }

    fn set_registration_info(&self, info: &RegistrationInfo) {
        *self.info.lock().unwrap() = Some(info.clone());
    }
}

/// 静态 DNS 表，记录所有查询
#[derive(Default)]
pub struct StaticDnsLookup {
    naptr: HashMap<String, Vec<NaptrRecord>>,
    srv: HashMap<String, Vec<SrvRecord>>,
    a: HashMap<String, IpAddr>,
    queries: Mutex<Vec<String>>,
}

impl StaticDnsLookup {
    pub fn with_naptr(mut self, name: &str, records: Vec<NaptrRecord>) -> Self {
        self.naptr.insert(name.to_string(), records);
        self
    }

    pub fn with_srv(mut self, name: &str, records: Vec<SrvRecord>) -> Self {
        self.srv.insert(name.to_string(), records);
        self
    }

    pub fn with_a(mut self, host: &str, ip: IpAddr) -> Self {
        self.a.insert(host.to_string(), ip);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn record(&self, kind: &str, name: &str) {
        self.queries.lock().unwrap().push(format!("{} {}", kind, name));
    }
}

#[async_trait]
impl DnsLookup for StaticDnsLookup {
    async fn naptr(&self, name: &str) -> Vec<NaptrRecord> {
        self.record("NAPTR", name);
        self.naptr.get(name).cloned().unwrap_or_default()
    }

    async fn srv(&self, name: &str) -> Vec<SrvRecord> {
        self.record("SRV", name);
        self.srv.get(name).cloned().unwrap_or_default()
    }

    async fn a(&self, host: &str) -> Option<IpAddr> {
        self.record("A", host);
        self.a.get(host).copied()
    }
}

/// 可修改的网络状态
pub struct MockNetworkMonitor {
    active: Mutex<Option<ActiveNetwork>>,
    ips: Mutex<HashMap<NetworkType, IpAddr>>,
    operator: Mutex<String>,
    last_account: Mutex<Option<String>>,
    current_account: Mutex<Option<String>>,
}

impl MockNetworkMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(None),
            ips: Mutex::new(HashMap::new()),
            operator: Mutex::new(String::new()),
            last_account: Mutex::new(None),
            current_account: Mutex::new(None),
        })
    }

    pub fn connect(&self, network_type: NetworkType, ip: &str) {
        *self.active.lock().unwrap() = Some(ActiveNetwork {
            network_type,
            connected: true,
            roaming: false,
            apn: None,
        });
        self.ips.lock().unwrap().insert(network_type, ip.parse().unwrap());
    }

    pub fn set_roaming(&self, roaming: bool) {
        if let Some(active) = self.active.lock().unwrap().as_mut() {
            active.roaming = roaming;
        }
    }

    pub fn set_apn(&self, apn: &str) {
        if let Some(active) = self.active.lock().unwrap().as_mut() {
            active.apn = Some(apn.to_string());
        }
    }

    pub fn disconnect(&self) {
        *self.active.lock().unwrap() = None;
    }

    pub fn set_operator(&self, operator: &str) {
        *self.operator.lock().unwrap() = operator.to_string();
    }

    pub fn set_accounts(&self, last: Option<&str>, current: Option<&str>) {
        *self.last_account.lock().unwrap() = last.map(str::to_string);
        *self.current_account.lock().unwrap() = current.map(str::to_string);
    }
}

impl NetworkMonitor for MockNetworkMonitor {
    fn active_network(&self) -> Option<ActiveNetwork> {
        self.active.lock().unwrap().clone()
    }

    fn local_ip_address(&self, network_type: NetworkType) -> Option<IpAddr> {
        self.ips.lock().unwrap().get(&network_type).copied()
    }

    fn sim_operator_name(&self) -> String {
        self.operator.lock().unwrap().clone()
    }

    fn last_user_account(&self) -> Option<String> {
        self.last_account.lock().unwrap().clone()
    }

    fn current_user_account(&self) -> Option<String> {
        self.current_account.lock().unwrap().clone()
    }
}

/// 记录所有回调的监听器
#[derive(Default)]
pub struct RecordingListener {
    successes: AtomicUsize,
    failures: AtomicUsize,
    terminations: AtomicUsize,
    services_started: AtomicUsize,
    services_stopped: AtomicUsize,
    services_checked: AtomicUsize,
    sim_changes: AtomicUsize,
    last_reason: Mutex<Option<ReasonCode>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn services_started(&self) -> usize {
        self.services_started.load(Ordering::SeqCst)
    }

    pub fn services_stopped(&self) -> usize {
        self.services_stopped.load(Ordering::SeqCst)
    }

    pub fn services_checked(&self) -> usize {
        self.services_checked.load(Ordering::SeqCst)
    }

    pub fn sim_changes(&self) -> usize {
        self.sim_changes.load(Ordering::SeqCst)
    }

    pub fn last_reason(&self) -> Option<ReasonCode> {
        *self.last_reason.lock().unwrap()
    }
}

impl RegistrationListener for RecordingListener {
    fn on_registration_successful(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_registration_failed(&self, _error: &RegistrationError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_registration_terminated(&self, reason: ReasonCode) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        *self.last_reason.lock().unwrap() = Some(reason);
    }
}

impl ImsCoreListener for RecordingListener {
    fn is_initialization_finished(&self) -> bool {
        true
    }

    fn start_services(&self) {
        self.services_started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_services(&self) {
        self.services_stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn check_services(&self) {
        self.services_checked.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sim_changed(&self) {
        self.sim_changes.fetch_add(1, Ordering::SeqCst);
    }
}
