/// 认证策略工厂
///
/// 根据接口配置的认证方式创建对应的 AuthProcedure 实现
use super::{digest::DigestAuthProcedure, giba::GibaAuthProcedure, traits::AuthProcedure};
use crate::config::{AuthenticationMode, ImsConfig, SimIdentity};
use std::sync::Arc;
use tracing::{info, warn};

/// 认证策略工厂
pub struct AuthProcedureFactory;

impl AuthProcedureFactory {
    /// 创建认证策略
    ///
    /// # 参数
    /// - `mode`: 接口配置的认证方式
    /// - `config`: 总配置（提供用户资料或 SIM 身份）
    ///
    /// # 返回
    /// - 实现了 AuthProcedure trait 的认证策略实例
    pub fn create(mode: AuthenticationMode, config: &ImsConfig) -> Arc<dyn AuthProcedure> {
        match mode {
            AuthenticationMode::Giba => {
                let sim = config.sim.clone().unwrap_or_else(|| {
                    // validate() 已拒绝缺少 SIM 的 GIBA 配置，这里只在手工构造配置时出现
                    warn!("GIBA 未配置 SIM 身份，使用空 IMSI");
                    SimIdentity {
                        imsi: String::new(),
                        mcc: 0,
                        mnc: 0,
                    }
                });
                info!("使用 GIBA 认证，IMSI: {}", sim.imsi);
                Arc::new(GibaAuthProcedure::new(sim))
            }
            AuthenticationMode::Digest => {
                info!("使用 Digest 认证，用户: {}", config.user.username);
                Arc::new(DigestAuthProcedure::new(config.user.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_by_mode() {
        let config = ImsConfig::new("ims.example.com", "alice", "example.com", "secret")
            .unwrap()
            .with_sim(SimIdentity {
                imsi: "208011234567890".into(),
                mcc: 208,
                mnc: 1,
            });

        let digest = AuthProcedureFactory::create(AuthenticationMode::Digest, &config);
        assert_eq!(digest.name(), "Digest");
        assert_eq!(digest.public_uri(), "sip:alice@example.com");

        let giba = AuthProcedureFactory::create(AuthenticationMode::Giba, &config);
        assert_eq!(giba.name(), "GIBA");
        assert_eq!(giba.home_domain(), "ims.mnc001.mcc208.3gppnetwork.org");
    }
}
