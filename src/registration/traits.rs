/// Registration traits 定义
///
/// 认证策略与注册事件监听器的抽象
use crate::error::{RegistrationError, RegistrationResult};
use rsip::{Request, Response};
use std::fmt;

/// 认证策略 trait
///
/// 提供注册所用的身份（home domain、public URI），并对 REGISTER 请求/响应的安全头签名、校验。
/// 实现内部使用可变状态（nonce、认证后的用户名等），因此方法都取 `&self`。
pub trait AuthProcedure: Send + Sync {
    /// 重置内部状态，每次新建注册对话时调用
    fn init(&self);

    /// 注册的 home domain
    fn home_domain(&self) -> String;

    /// 注册使用的公有 URI（From/To）
    fn public_uri(&self) -> String;

    /// 为请求写入安全头
    fn write_security_header(&self, request: &mut Request) -> RegistrationResult<()>;

    /// 从响应中读取安全头并更新内部状态
    fn read_security_header(&self, response: &Response) -> RegistrationResult<()>;

    /// 策略名称，用于日志
    fn name(&self) -> &'static str;
}

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
}

/// 最近一次注销/终止的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasonCode {
    #[default]
    Unspecified,
    ConnectionLost,
    BatteryLow,
}

impl ReasonCode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ReasonCode::Unspecified => 0,
            ReasonCode::ConnectionLost => 1,
            ReasonCode::BatteryLow => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ReasonCode::ConnectionLost,
            2 => ReasonCode::BatteryLow,
            _ => ReasonCode::Unspecified,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::Unspecified => write!(f, "unspecified"),
            ReasonCode::ConnectionLost => write!(f, "connection lost"),
            ReasonCode::BatteryLow => write!(f, "battery low"),
        }
    }
}

/// 注册事件监听器
///
/// 上层只能观察到"已注册 / 未注册（原因）"
pub trait RegistrationListener: Send + Sync {
    fn on_registration_successful(&self);

    fn on_registration_failed(&self, error: &RegistrationError);

    fn on_registration_terminated(&self, reason: ReasonCode);
}
