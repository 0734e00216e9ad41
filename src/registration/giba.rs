/// GIBA 认证策略
///
/// 身份由 SIM（IMSI、MCC/MNC）推导，不交换显式凭证：
/// - home domain: `ims.mncXXX.mccXXX.3gppnetwork.org`
/// - 请求不带安全头
/// - 首次 200 OK 的 P-Associated-URI 决定认证后的用户名和域
use super::traits::AuthProcedure;
use crate::config::SimIdentity;
use crate::error::{RegistrationError, RegistrationResult};
use crate::sip_message::{self, HEADER_P_ASSOCIATED_URI};
use rsip::{Request, Response, Scheme};
use std::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct GibaIdentity {
    username: Option<String>,
    domain: Option<String>,
}

pub struct GibaAuthProcedure {
    sim: SimIdentity,
    identity: RwLock<GibaIdentity>,
}

impl GibaAuthProcedure {
    pub fn new(sim: SimIdentity) -> Self {
        Self {
            sim,
            identity: RwLock::new(GibaIdentity::default()),
        }
    }

    fn sim_domain(&self) -> String {
        format!("ims.mnc{:03}.mcc{:03}.3gppnetwork.org", self.sim.mnc, self.sim.mcc)
    }

    /// 认证后的用户名（尚未收到 P-Associated-URI 时为 None）
    pub fn authenticated_username(&self) -> Option<String> {
        self.identity.read().ok().and_then(|i| i.username.clone())
    }
}

impl AuthProcedure for GibaAuthProcedure {
    fn init(&self) {
        if let Ok(mut identity) = self.identity.write() {
            *identity = GibaIdentity::default();
        }
    }

    fn home_domain(&self) -> String {
        self.identity
            .read()
            .ok()
            .and_then(|i| i.domain.clone())
            .unwrap_or_else(|| self.sim_domain())
    }

    fn public_uri(&self) -> String {
        let identity = self.identity.read().ok();
        let username = identity
            .as_ref()
            .and_then(|i| i.username.clone())
            .unwrap_or_else(|| self.sim.imsi.clone());
        format!("sip:{}@{}", username, self.home_domain())
    }

    fn write_security_header(&self, _request: &mut Request) -> RegistrationResult<()> {
        Ok(())
    }

    fn read_security_header(&self, response: &Response) -> RegistrationResult<()> {
        if response.status_code.code() != 200 {
            return Ok(());
        }
        let Some(value) = sip_message::first_header(&response.headers, HEADER_P_ASSOCIATED_URI) else {
            debug!("200 OK 未携带 P-Associated-URI");
            return Ok(());
        };

        let first = sip_message::split_list(&value)
            .into_iter()
            .next()
            .map(|v| sip_message::strip_name_addr(&v))
            .unwrap_or_default();
        let uri = sip_message::parse_uri(&first)
            .filter(|uri| matches!(uri.scheme, Some(Scheme::Sip) | Some(Scheme::Sips)))
            .ok_or_else(|| RegistrationError::auth(format!("P-Associated-URI 不是 SIP URI: {}", value)))?;
        let Some(user) = uri.user().map(str::to_string) else {
            return Err(RegistrationError::auth(format!("P-Associated-URI 缺少用户部分: {}", first)));
        };
        let domain = uri.host().to_string();

        let mut identity = self
            .identity
            .write()
            .map_err(|_| RegistrationError::auth("GIBA 身份状态不可用"))?;
        if identity.username.is_none() {
            info!("GIBA 认证身份: {}@{}", user, domain);
            identity.username = Some(user);
            identity.domain = Some(domain);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GIBA"
    }
}
