/// 工具函数模块
///
/// 日志初始化、SIP 标识生成以及退避/抖动计算

use rand::Rng;
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

/// 初始化 tracing 日志
///
/// `level` 取值 trace/debug/info/warn/error，无法解析时使用 info
pub fn initialize_logging(level: &str) {
    let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// 生成基于 UUID 的 Call-ID
///
/// # 示例
/// ```rust
/// let call_id = ims_connect::utils::make_call_id(Some("10.0.0.2"));
/// assert!(call_id.ends_with("@10.0.0.2"));
/// ```
pub fn make_call_id(domain: Option<&str>) -> String {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d),
        None => uuid.to_string(),
    }
}

/// 生成 From tag
pub fn make_tag() -> String {
    let mut rng = rand::rng();
    format!("{:08x}", rng.random::<u32>())
}

/// 生成 Via branch（带 RFC 3261 magic cookie）
pub fn make_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// 50%~100% 之间的随机系数
pub fn jitter_coefficient() -> f64 {
    let mut rng = rand::rng();
    rng.random_range(50..=100) as f64 / 100.0
}

/// 按系数缩放时长
pub fn scale(duration: Duration, coefficient: f64) -> Duration {
    duration.mul_f64(coefficient.clamp(0.0, 1.0))
}

/// 注册失败后的退避时长：`min(max, base * 2^failures)`，再乘以抖动系数
pub fn registration_backoff(base: Duration, max: Duration, failures: u32, coefficient: f64) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    let window = base.checked_mul(factor).unwrap_or(max).min(max);
    scale(window, coefficient)
}

/// 把 IP 格式化成 SIP URI 中的主机部分（IPv6 需要方括号）
pub fn format_host(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}
