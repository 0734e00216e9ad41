/// SIP 传输层
///
/// `SipTransport` 抽象"发送请求并等待最终响应"这一能力，注册流程只依赖该 trait；
/// `RsipstackTransport` 是基于 rsipstack Endpoint 的实现。
use crate::config::{NetworkType, SipProtocol};
use crate::error::{RegistrationError, RegistrationResult};
use async_trait::async_trait;
use rsip::{Request, Response, SipMessage};
use rsipstack::{
    transaction::{
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
        Endpoint,
    },
    transport::{udp::UdpConnection, SipAddr, TransportLayer},
    EndpointBuilder,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 初始化协议栈所需的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub protocol: SipProtocol,
    pub network: NetworkType,
}

impl StackConfig {
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_port)
    }
}

/// 注册成功后需要告知协议栈的信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationInfo {
    /// P-Associated-URI 列表
    pub associated_uris: Vec<String>,
    /// Service-Route 列表（后续请求的预置路由）
    pub service_route: Vec<String>,
    pub public_gruu: Option<String>,
    pub temp_gruu: Option<String>,
}

/// SIP 协议栈抽象
#[async_trait]
pub trait SipTransport: Send + Sync {
    /// 创建协议栈并绑定到本地地址，重复调用时先关闭旧的协议栈
    async fn init_stack(&self, config: StackConfig) -> RegistrationResult<()>;

    /// 发送请求并等待最终响应，超时返回 `Ok(None)`
    async fn send_and_wait(&self, request: Request, timeout: Duration) -> RegistrationResult<Option<Response>>;

    /// 关闭协议栈，未初始化时无操作
    async fn close_stack(&self);

    /// 实际绑定的本地地址
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 初始 REGISTER 使用的预置路由
    fn default_route(&self) -> Vec<String>;

    /// 注册成功后更新 Service-Route 和 GRUU
    fn set_registration_info(&self, _info: &RegistrationInfo) {}
}

struct ActiveStack {
    endpoint: Endpoint,
    cancel_token: CancellationToken,
    local_addr: SocketAddr,
    remote: SocketAddr,
}

/// 基于 rsipstack 的传输实现（目前只支持 UDP）
pub struct RsipstackTransport {
    user_agent: String,
    stack: Mutex<Option<ActiveStack>>,
    local_addr: std::sync::RwLock<Option<SocketAddr>>,
    route: std::sync::RwLock<Vec<String>>,
    info: std::sync::RwLock<RegistrationInfo>,
}

impl RsipstackTransport {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            stack: Mutex::new(None),
            local_addr: std::sync::RwLock::new(None),
            route: std::sync::RwLock::new(Vec::new()),
            info: std::sync::RwLock::new(RegistrationInfo::default()),
        }
    }

    /// 最近一次注册得到的信息
    pub fn registration_info(&self) -> RegistrationInfo {
        self.info.read().map(|i| i.clone()).unwrap_or_default()
    }

    async fn build_stack(&self, config: &StackConfig) -> RegistrationResult<ActiveStack> {
        if config.protocol != SipProtocol::Udp {
            return Err(RegistrationError::transport(format!(
                "不支持的传输协议: {}",
                config.protocol
            )));
        }

        let cancel_token = CancellationToken::new();
        let mut transport_layer = TransportLayer::new(cancel_token.clone());

        // 所有请求都发往解析出的代理地址
        let remote = config.remote_addr();
        transport_layer.outbound = Some(SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: rsip::HostWithPort::from(remote),
        });

        let bind_addr = SocketAddr::new(config.local_ip, 0);
        let connection =
            UdpConnection::create_connection(bind_addr, None, Some(cancel_token.child_token())).await?;
        transport_layer.add_transport(connection.into());

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent(&self.user_agent);
        let endpoint = endpoint_builder.build();

        let endpoint_for_serve = endpoint.inner.clone();
        tokio::spawn(async move {
            endpoint_for_serve.serve().await.ok();
        });

        let local_addr = endpoint
            .get_addrs()
            .first()
            .ok_or_else(|| RegistrationError::transport("协议栈没有可用的本地地址"))?
            .addr
            .to_string()
            .parse::<SocketAddr>()
            .map_err(|e| RegistrationError::transport(format!("本地地址无效: {}", e)))?;

        Ok(ActiveStack {
            endpoint,
            cancel_token,
            local_addr,
            remote,
        })
    }
}

#[async_trait]
impl SipTransport for RsipstackTransport {
    async fn init_stack(&self, config: StackConfig) -> RegistrationResult<()> {
        let mut stack = self.stack.lock().await;
        if let Some(old) = stack.take() {
            old.cancel_token.cancel();
        }

        let active = self.build_stack(&config).await?;
        info!(
            "{} 协议栈已启动: 本地 {} -> 代理 {} ({})",
            config.network, active.local_addr, active.remote, config.protocol
        );

        if let Ok(mut local) = self.local_addr.write() {
            *local = Some(active.local_addr);
        }
        if let Ok(mut route) = self.route.write() {
            *route = vec![format!("<sip:{};lr>", active.remote)];
        }
        *stack = Some(active);
        Ok(())
    }

    async fn send_and_wait(&self, request: Request, timeout: Duration) -> RegistrationResult<Option<Response>> {
        let endpoint = {
            let stack = self.stack.lock().await;
            match stack.as_ref() {
                Some(active) => active.endpoint.inner.clone(),
                None => return Err(RegistrationError::NotConnected),
            }
        };

        let method = request.method;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, endpoint, None);
        tx.send().await?;

        let wait_final = async {
            while let Some(msg) = tx.receive().await {
                match msg {
                    SipMessage::Response(resp) if resp.status_code.code() < 200 => {
                        debug!("{} 临时响应: {}", method, resp.status_code);
                        continue;
                    }
                    SipMessage::Response(resp) => return Some(resp),
                    SipMessage::Request(_) => continue,
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait_final).await {
            Ok(Some(resp)) => Ok(Some(resp)),
            Ok(None) => {
                warn!("{} 事务结束但没有最终响应", method);
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    async fn close_stack(&self) {
        let mut stack = self.stack.lock().await;
        if let Some(active) = stack.take() {
            active.cancel_token.cancel();
            info!("协议栈已关闭: {}", active.local_addr);
        }
        if let Ok(mut local) = self.local_addr.write() {
            *local = None;
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.read().ok().and_then(|a| *a)
    }

    fn default_route(&self) -> Vec<String> {
        self.route.read().map(|r| r.clone()).unwrap_or_default()
    }

    fn set_registration_info(&self, info: &RegistrationInfo) {
        debug!(
            "更新注册信息: service-route={:?} pub-gruu={:?}",
            info.service_route, info.public_gruu
        );
        if let Ok(mut current) = self.info.write() {
            *current = info.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_stack_is_not_connected() {
        let transport = RsipstackTransport::new("test");
        let request = crate::sip_message::build_options(
            "sip:127.0.0.1:5060",
            "sip:alice@example.com",
            "127.0.0.1:5060".parse().unwrap(),
            SipProtocol::Udp,
            "test",
        )
        .unwrap();
        let result = transport.send_and_wait(request, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(RegistrationError::NotConnected)));
        assert!(transport.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_tcp_is_rejected() {
        let transport = RsipstackTransport::new("test");
        let config = StackConfig {
            local_ip: "127.0.0.1".parse().unwrap(),
            remote_ip: "127.0.0.1".parse().unwrap(),
            remote_port: 5060,
            protocol: SipProtocol::Tcp,
            network: NetworkType::Wifi,
        };
        assert!(matches!(
            transport.init_stack(config).await,
            Err(RegistrationError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_udp_stack_binds_local_address() {
        let transport = RsipstackTransport::new("test");
        let config = StackConfig {
            local_ip: "127.0.0.1".parse().unwrap(),
            remote_ip: "127.0.0.1".parse().unwrap(),
            remote_port: 5999,
            protocol: SipProtocol::Udp,
            network: NetworkType::Wifi,
        };
        transport.init_stack(config).await.unwrap();
        let local = transport.local_addr().unwrap();
        assert_eq!(local.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(transport.default_route(), vec!["<sip:127.0.0.1:5999;lr>".to_string()]);

        transport.close_stack().await;
        assert!(transport.local_addr().is_none());
    }
}
