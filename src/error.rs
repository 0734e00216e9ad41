use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 注册流程的Result类型别名
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// 重试预算的失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 连续的 401 Unauthorized
    Unauthorized,
    /// 4xx/5xx/6xx 错误响应（共用一个计数器）
    ErrorResponse,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Unauthorized => write!(f, "401"),
            FailureKind::ErrorResponse => write!(f, "4xx/5xx/6xx"),
        }
    }
}

/// 注册相关错误类型
///
/// 这些都是"预期内"的失败：由 RegistrationManager 转换成状态迁移和监听器通知，
/// 再交给上层轮询循环做退避重试，不会让进程退出。
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// DNS 解析失败（NAPTR/SRV/A 全部无结果）
    #[error("DNS解析失败: {host} ({reason})")]
    DnsResolution { host: String, reason: String },

    /// 认证头或身份头格式错误
    #[error("认证挑战无效: {0}")]
    AuthChallenge(String),

    /// 传输层发送失败
    #[error("传输错误: {0}")]
    Transport(String),

    /// 未收到响应
    #[error("等待响应超时: {0:?}")]
    Timeout(Duration),

    /// 响应内容不合法
    #[error("SIP协议错误: {0}")]
    Protocol(String),

    /// 未处理的状态码
    #[error("注册被拒绝: {code} {reason}")]
    UnexpectedStatus { code: u16, reason: String },

    /// 重试次数达到上限
    #[error("重试次数过多: {count} 次 {kind} 响应")]
    RetryExhausted { kind: FailureKind, count: u32 },

    /// 服务器要求稍后重试
    #[error("服务器返回 {code}，要求 {delay:?} 后重试")]
    RetryAfter { code: u16, delay: Duration },

    /// 网络接入尚未连接（没有本地IP）
    #[error("网络未连接")]
    NotConnected,

    /// 网络接口未配置代理
    #[error("网络接口未配置")]
    NotConfigured,

    /// URI解析错误
    #[error("URI解析错误: {0}")]
    Uri(#[from] rsip::Error),
}

impl RegistrationError {
    /// 获取标准错误代码，用于日志分析和监控
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistrationError::DnsResolution { .. } => "DNS_RESOLUTION_ERROR",
            RegistrationError::AuthChallenge(_) => "AUTH_CHALLENGE_ERROR",
            RegistrationError::Transport(_) => "TRANSPORT_ERROR",
            RegistrationError::Timeout(_) => "TRANSPORT_TIMEOUT",
            RegistrationError::Protocol(_) => "PROTOCOL_ERROR",
            RegistrationError::UnexpectedStatus { .. } => "UNEXPECTED_STATUS",
            RegistrationError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            RegistrationError::RetryAfter { .. } => "RETRY_AFTER",
            RegistrationError::NotConnected => "NOT_CONNECTED",
            RegistrationError::NotConfigured => "NOT_CONFIGURED",
            RegistrationError::Uri(_) => "URI_PARSE_ERROR",
        }
    }

    /// 获取SIP状态码（如果有）
    pub fn sip_status_code(&self) -> Option<u16> {
        match self {
            RegistrationError::UnexpectedStatus { code, .. } => Some(*code),
            RegistrationError::RetryAfter { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 创建DNS解析错误
    pub fn dns(host: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistrationError::DnsResolution {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// 创建认证错误
    pub fn auth(reason: impl Into<String>) -> Self {
        RegistrationError::AuthChallenge(reason.into())
    }

    /// 创建传输错误
    pub fn transport(reason: impl Into<String>) -> Self {
        RegistrationError::Transport(reason.into())
    }

    /// 创建协议错误
    pub fn protocol(reason: impl Into<String>) -> Self {
        RegistrationError::Protocol(reason.into())
    }
}

impl From<rsipstack::Error> for RegistrationError {
    fn from(err: rsipstack::Error) -> Self {
        RegistrationError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for RegistrationError {
    fn from(err: std::io::Error) -> Self {
        RegistrationError::Transport(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
