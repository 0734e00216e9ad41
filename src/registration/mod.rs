/// Registration 模块
///
/// IMS 注册的核心：认证策略 + REGISTER 状态机
///
/// ## 设计模式
///
/// 使用 **策略模式 (Strategy Pattern)** 和 **工厂模式 (Factory Pattern)**：
///
/// - `AuthProcedure` trait: 定义认证行为接口
/// - `GibaAuthProcedure`: 基于 SIM 的 GIBA 认证
/// - `DigestAuthProcedure`: HTTP Digest MD5 认证
/// - `AuthProcedureFactory`: 按接口配置的认证方式创建策略
/// - `RegistrationManager`: REGISTER 状态机，持有一个认证策略
///
/// ## 使用示例
///
/// ```rust,no_run
/// use ims_connect::config::{AuthenticationMode, ImsConfig, SipProtocol};
/// use ims_connect::registration::*;
/// use ims_connect::sip_transport::RsipstackTransport;
/// use std::sync::atomic::AtomicBool;
/// use std::sync::Arc;
///
/// # struct Listener;
/// # impl RegistrationListener for Listener {
/// #     fn on_registration_successful(&self) {}
/// #     fn on_registration_failed(&self, _: &ims_connect::RegistrationError) {}
/// #     fn on_registration_terminated(&self, _: ReasonCode) {}
/// # }
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(ImsConfig::new("ims.example.com", "alice", "example.com", "secret")?);
/// let auth = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
/// let transport = Arc::new(RsipstackTransport::new(config.user_agent.clone()));
/// let manager = RegistrationManager::new(
///     config,
///     SipProtocol::Udp,
///     transport,
///     auth,
///     Arc::new(Listener),
///     Arc::new(AtomicBool::new(false)),
/// );
/// manager.register().await?;
/// # Ok(())
/// # }
/// ```

mod digest;
mod factory;
mod feature_tags;
mod giba;
mod manager;
mod traits;

// 导出公共接口
pub use digest::DigestAuthProcedure;
pub use factory::AuthProcedureFactory;
pub use feature_tags::FeatureTagSet;
pub use giba::GibaAuthProcedure;
pub use manager::{refresh_delay, NatState, RegistrationManager, MAX_REGISTRATION_FAILURES};
pub use traits::{AuthProcedure, ReasonCode, RegistrationListener, RegistrationState};
