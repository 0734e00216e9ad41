/// HTTP Digest (MD5) 认证策略
///
/// 首个 REGISTER 不带 Authorization，收到 401 挑战后才开始签名；
/// 200 OK 的 Authentication-Info 中的 nextnonce 会替换当前 nonce。
use super::traits::AuthProcedure;
use crate::config::UserProfileConfig;
use crate::error::{RegistrationError, RegistrationResult};
use crate::sip_message::{self, HEADER_AUTHENTICATION_INFO, HEADER_WWW_AUTHENTICATE};
use rand::Rng;
use regex::Regex;
use rsip::{Request, Response};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info};

#[derive(Debug, Default, Clone)]
struct DigestState {
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    qop: Option<String>,
    cnonce: String,
    nonce_count: u32,
}

pub struct DigestAuthProcedure {
    user: UserProfileConfig,
    state: Mutex<DigestState>,
}

fn param_regex() -> &'static Regex {
    static PARAM: OnceLock<Regex> = OnceLock::new();
    PARAM.get_or_init(|| {
        Regex::new(r#"([A-Za-z][A-Za-z0-9_-]*)\s*=\s*(?:"([^"]*)"|([^\s,]+))"#).expect("digest param regex")
    })
}

/// 解析挑战头中的参数（键名转小写）
fn parse_challenge(value: &str) -> HashMap<String, String> {
    let value = value.trim();
    let value = value
        .strip_prefix("Digest")
        .or_else(|| value.strip_prefix("digest"))
        .unwrap_or(value);
    param_regex()
        .captures_iter(value)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let val = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
            Some((key, val))
        })
        .collect()
}

/// 从 qop 列表中选择，优先 auth
fn select_qop(qop: &str) -> Option<String> {
    let options: Vec<&str> = qop.split(',').map(str::trim).filter(|q| !q.is_empty()).collect();
    if options.iter().any(|q| q.eq_ignore_ascii_case("auth")) {
        Some("auth".to_string())
    } else {
        options.first().map(|q| q.to_ascii_lowercase())
    }
}

fn md5_hash(input: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

fn make_cnonce() -> String {
    let mut rng = rand::rng();
    format!("{:016x}", rng.random::<u64>())
}

impl DigestAuthProcedure {
    pub fn new(user: UserProfileConfig) -> Self {
        Self {
            user,
            state: Mutex::new(DigestState::default()),
        }
    }

    /// 认证用户名（IMPI），未配置时使用公有身份
    fn auth_username(&self) -> String {
        if !self.user.private_id.is_empty() {
            self.user.private_id.clone()
        } else {
            format!("{}@{}", self.user.username, self.user.home_domain)
        }
    }

    fn lock_state(&self) -> RegistrationResult<std::sync::MutexGuard<'_, DigestState>> {
        self.state.lock().map_err(|_| RegistrationError::auth("Digest 状态不可用"))
    }

    /// 计算 response 摘要
    #[allow(clippy::too_many_arguments)]
    fn compute_response(
        &self,
        realm: &str,
        nonce: &str,
        method: &str,
        uri: &str,
        body: &[u8],
        qop: Option<&str>,
        nc: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hash(format!("{}:{}:{}", self.auth_username(), realm, self.user.password).as_bytes());
        let ha2 = match qop {
            Some("auth-int") => md5_hash(format!("{}:{}:{}", method, uri, md5_hash(body)).as_bytes()),
            _ => md5_hash(format!("{}:{}", method, uri).as_bytes()),
        };
        match qop {
            Some(qop) => md5_hash(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2).as_bytes()),
            None => md5_hash(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
        }
    }
}

impl AuthProcedure for DigestAuthProcedure {
    fn init(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = DigestState::default();
        }
    }

    fn home_domain(&self) -> String {
        self.user.home_domain.clone()
    }

    fn public_uri(&self) -> String {
        format!("sip:{}@{}", self.user.username, self.user.home_domain)
    }

    fn write_security_header(&self, request: &mut Request) -> RegistrationResult<()> {
        let mut state = self.lock_state()?;
        let Some(nonce) = state.nonce.clone() else {
            return Ok(());
        };

        let realm = if !self.user.realm.is_empty() {
            self.user.realm.clone()
        } else {
            state.realm.clone().unwrap_or_else(|| self.user.home_domain.clone())
        };
        let uri = request.uri.to_string();
        let method = request.method.to_string();

        state.nonce_count += 1;
        let nc = format!("{:08x}", state.nonce_count);
        let qop = state.qop.clone();
        let response = self.compute_response(
            &realm,
            &nonce,
            &method,
            &uri,
            &request.body,
            qop.as_deref(),
            &nc,
            &state.cnonce,
        );

        let mut value = format!(
            "Digest username=\"{}\",uri=\"{}\",algorithm=MD5,realm=\"{}\",nonce=\"{}\",response=\"{}\"",
            self.auth_username(),
            uri,
            realm,
            nonce,
            response
        );
        if let Some(opaque) = &state.opaque {
            value.push_str(&format!(",opaque=\"{}\"", opaque));
        }
        if let Some(qop) = &qop {
            value.push_str(&format!(",nc={},qop={},cnonce=\"{}\"", nc, qop, state.cnonce));
        }

        debug!("Authorization: {}", value);
        sip_message::set_authorization(request, value);
        Ok(())
    }

    fn read_security_header(&self, response: &Response) -> RegistrationResult<()> {
        match response.status_code.code() {
            401 => {
                let header = sip_message::first_header(&response.headers, HEADER_WWW_AUTHENTICATE)
                    .ok_or_else(|| RegistrationError::auth("401 缺少 WWW-Authenticate"))?;
                let params = parse_challenge(&header);
                let nonce = params
                    .get("nonce")
                    .cloned()
                    .ok_or_else(|| RegistrationError::auth(format!("挑战缺少 nonce: {}", header)))?;
                if let Some(algorithm) = params.get("algorithm") {
                    if !algorithm.eq_ignore_ascii_case("MD5") {
                        return Err(RegistrationError::auth(format!("不支持的算法: {}", algorithm)));
                    }
                }

                let mut state = self.lock_state()?;
                info!("收到 Digest 挑战: realm={:?}", params.get("realm"));
                state.realm = params.get("realm").cloned();
                state.nonce = Some(nonce);
                state.opaque = params.get("opaque").cloned();
                state.qop = params.get("qop").and_then(|q| select_qop(q));
                state.cnonce = make_cnonce();
                state.nonce_count = 0;
                Ok(())
            }
            200 => {
                let Some(header) = sip_message::first_header(&response.headers, HEADER_AUTHENTICATION_INFO) else {
                    return Ok(());
                };
                let params = parse_challenge(&header);
                if let Some(next) = params.get("nextnonce") {
                    let mut state = self.lock_state()?;
                    debug!("nextnonce 更新");
                    state.nonce = Some(next.clone());
                    state.nonce_count = 0;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "Digest"
    }
}
