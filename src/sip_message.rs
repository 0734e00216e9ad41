/// SIP 消息辅助模块
///
/// 基于 rsip 的 Request/Response 构造 REGISTER、OPTIONS 请求，并读取注册流程关心的头部
use crate::config::SipProtocol;
use crate::error::RegistrationError;
use crate::utils::{format_host, make_branch, make_tag};
use rsip::headers::ToTypedHeader;
use rsip::{Header, Headers, Host, Param, Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub const HEADER_P_ASSOCIATED_URI: &str = "P-Associated-URI";
pub const HEADER_SERVICE_ROUTE: &str = "Service-Route";
pub const HEADER_AUTHENTICATION_INFO: &str = "Authentication-Info";
pub const HEADER_WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub const SIP_INSTANCE_PARAM: &str = "+sip.instance";
pub const PUBLIC_GRUU_PARAM: &str = "pub-gruu";
pub const TEMP_GRUU_PARAM: &str = "temp-gruu";

const ALLOW_METHODS: &str = "INVITE, ACK, CANCEL, BYE, MESSAGE, NOTIFY, OPTIONS, REFER, UPDATE";
const MAX_FORWARDS: &str = "70";

/// 头部名称的紧凑形式
fn compact_form(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "via" => Some("v"),
        "contact" => Some("m"),
        "call-id" => Some("i"),
        "from" => Some("f"),
        "to" => Some("t"),
        "supported" => Some("k"),
        "content-length" => Some("l"),
        _ => None,
    }
}

fn name_matches(candidate: &str, name: &str) -> bool {
    candidate.eq_ignore_ascii_case(name)
        || compact_form(name).is_some_and(|c| candidate.eq_ignore_ascii_case(c))
}

/// 拆出单个头部的名称和值
fn split_header(header: &Header) -> (String, String) {
    if let Header::Other(name, value) = header {
        return (name.clone(), value.trim().to_string());
    }
    let text = header.to_string();
    match text.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (String::new(), text.trim().to_string()),
    }
}

/// 读取指定名称的所有头部值（按出现顺序）
pub fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .map(split_header)
        .filter(|(n, _)| name_matches(n, name))
        .map(|(_, v)| v)
        .collect()
}

/// 读取第一个指定名称的头部值
pub fn first_header(headers: &Headers, name: &str) -> Option<String> {
    header_values(headers, name).into_iter().next()
}

/// 按顶层逗号拆分头部值，忽略引号和尖括号内的逗号
pub fn split_list(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(ch);
            }
            ',' if !in_quotes && !in_angle => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// 按顶层分号拆分参数
fn split_params(value: &str) -> Vec<(String, Option<String>)> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut flush = |current: &mut String| {
        let item = current.trim();
        if !item.is_empty() {
            match item.split_once('=') {
                Some((k, v)) => params.push((k.trim().to_string(), Some(v.trim().trim_matches('"').to_string()))),
                None => params.push((item.to_string(), None)),
            }
        }
        current.clear();
    };

    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ';' if !in_quotes => flush(&mut current),
            _ => current.push(ch),
        }
    }
    flush(&mut current);
    params
}

/// rsip 0.4 的 host 分词不识别方括号 IPv6，先换成占位主机再回填
const IPV6_PLACEHOLDER: &str = "ipv6.invalid";

/// 用 rsip 解析 URI（可带尖括号）
pub fn parse_uri(value: &str) -> Option<rsip::Uri> {
    let value = value.trim().trim_start_matches('<').trim_end_matches('>').trim();
    let (Some(start), Some(end)) = (value.find('['), value.find(']')) else {
        return rsip::Uri::try_from(value).ok();
    };
    if end < start {
        return None;
    }
    let ip: IpAddr = value[start + 1..end].parse().ok()?;
    let masked = format!("{}{}{}", &value[..start], IPV6_PLACEHOLDER, &value[end + 1..]);
    let mut uri = rsip::Uri::try_from(masked.as_str()).ok()?;
    uri.host_with_port.host = Host::IpAddr(ip);
    Some(uri)
}

/// 去掉 name-addr 的显示名和尖括号
pub fn strip_name_addr(value: &str) -> String {
    let value = value.trim();
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if end > start => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// 把 rsip 的参数还原成名称和值
fn param_pair(param: &Param) -> (String, Option<String>) {
    let text = param.to_string();
    let text = text.trim_start_matches(';');
    match text.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (text.to_string(), None),
    }
}

/// 解析后的 Via 头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaInfo {
    pub host: Host,
    pub port: Option<u16>,
    pub received: Option<IpAddr>,
    pub rport: Option<u16>,
}

impl From<rsip::typed::Via> for ViaInfo {
    fn from(via: rsip::typed::Via) -> Self {
        let rport = via.params.iter().find_map(|param| match param {
            Param::Other(name, Some(value)) if name.value().eq_ignore_ascii_case("rport") => value.value().parse().ok(),
            _ => None,
        });
        Self {
            received: via.received().ok().flatten(),
            port: via.uri.port().map(|p| *p.value()),
            host: via.uri.host_with_port.host,
            rport,
        }
    }
}

impl ViaInfo {
    /// 只看第一个 via-parm
    pub fn parse(value: &str) -> Option<Self> {
        let first = split_list(value).into_iter().next()?;
        // rsip 0.4 遇到 IPv6 的 received 会截断参数而不报错
        match rsip::headers::Via::from(first.as_str()).typed() {
            Ok(via) if via.received().is_ok() => Some(via.into()),
            _ => Self::parse_ipv6(&first),
        }
    }

    /// rsip 0.4 无法切分的 IPv6 sent-by 或 received
    fn parse_ipv6(value: &str) -> Option<Self> {
        let (sent_protocol, rest) = value.trim().split_once(char::is_whitespace)?;
        if !sent_protocol.to_ascii_uppercase().starts_with("SIP/") {
            return None;
        }
        let mut segments = rest.trim().splitn(2, ';');
        let sent_by = segments.next()?.trim();
        let params = segments.next().map(split_params).unwrap_or_default();

        let (host, port) = match sent_by.strip_prefix('[') {
            Some(v6) => {
                let end = v6.find(']')?;
                let port = v6[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
                (Host::from(&v6[..end]), port)
            }
            None => match sent_by.rsplit_once(':') {
                Some((h, p)) if !h.contains(':') => (Host::from(h), p.parse().ok()),
                _ => (Host::from(sent_by), None),
            },
        };

        let param = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.clone())
        };

        Some(Self {
            host,
            port,
            received: param("received").and_then(|r| r.parse().ok()),
            rport: param("rport").and_then(|p| p.parse().ok()),
        })
    }
}

/// Contact 头中的一个条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEntry {
    pub uri: rsip::Uri,
    pub params: Vec<(String, Option<String>)>,
}

impl ContactEntry {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value == "*" {
            return None;
        }
        if let Ok(contact) = rsip::headers::Contact::from(value).typed() {
            return Some(Self {
                params: contact.params.iter().map(param_pair).collect(),
                uri: contact.uri,
            });
        }

        // rsip 0.4 的参数分词不接受带引号的值（+sip.instance、pub-gruu）
        let (uri, rest) = match (value.find('<'), value.find('>')) {
            (Some(start), Some(end)) if end > start => (&value[start + 1..end], &value[end + 1..]),
            _ => value.split_once(';').unwrap_or((value, "")),
        };
        Some(Self {
            uri: parse_uri(uri)?,
            params: split_params(rest),
        })
    }

    pub fn host(&self) -> &Host {
        self.uri.host()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn expires(&self) -> Option<u32> {
        self.param("expires").and_then(|v| v.parse().ok())
    }
}

/// 读取所有 Contact 条目
pub fn contacts(headers: &Headers) -> Vec<ContactEntry> {
    header_values(headers, "Contact")
        .iter()
        .flat_map(|v| split_list(v))
        .filter_map(|v| ContactEntry::parse(&v))
        .collect()
}

/// 最顶层的 Via
pub fn top_via(headers: &Headers) -> Option<ViaInfo> {
    first_header(headers, "Via").and_then(|v| ViaInfo::parse(&v))
}

fn leading_number(value: &str) -> Option<u64> {
    let digits: String = value.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Expires 头（秒）
pub fn expires(headers: &Headers) -> Option<u32> {
    first_header(headers, "Expires").and_then(|v| leading_number(&v)).map(saturate)
}

/// Min-Expires 头（秒）
pub fn min_expires(headers: &Headers) -> Option<u32> {
    first_header(headers, "Min-Expires").and_then(|v| leading_number(&v)).map(saturate)
}

/// Retry-After 头，形如 `120 (comment);duration=60`
pub fn retry_after(headers: &Headers) -> Option<Duration> {
    first_header(headers, "Retry-After")
        .and_then(|v| leading_number(&v))
        .map(Duration::from_secs)
}

/// P-Associated-URI 列表（去掉尖括号）
pub fn associated_uris(headers: &Headers) -> Vec<String> {
    header_values(headers, HEADER_P_ASSOCIATED_URI)
        .iter()
        .flat_map(|v| split_list(v))
        .map(|v| strip_name_addr(&v))
        .filter(|v| !v.is_empty())
        .collect()
}

/// Service-Route 列表（保留 name-addr 形式，可直接作为 Route 使用）
pub fn service_routes(headers: &Headers) -> Vec<String> {
    header_values(headers, HEADER_SERVICE_ROUTE)
        .iter()
        .flat_map(|v| split_list(v))
        .collect()
}

/// 响应状态码
pub fn status_code(response: &Response) -> u16 {
    response.status_code.code()
}

/// 构造 REGISTER 所需的参数
#[derive(Debug, Clone)]
pub struct RegisterParams<'a> {
    pub target: &'a str,
    pub local_party: &'a str,
    pub remote_party: &'a str,
    pub call_id: &'a str,
    pub cseq: u32,
    pub route: &'a [String],
    pub local_addr: SocketAddr,
    pub protocol: SipProtocol,
    pub expires: u32,
    pub feature_tags: &'a [String],
    pub instance_id: Option<&'a str>,
    pub user_agent: &'a str,
}

fn via_value(local_addr: &SocketAddr, protocol: SipProtocol, keep: bool) -> String {
    format!(
        "SIP/2.0/{} {}:{};branch={};rport{}",
        protocol.as_str(),
        format_host(&local_addr.ip()),
        local_addr.port(),
        make_branch(),
        if keep { ";keep" } else { "" }
    )
}

/// 本地 Contact 值
pub fn contact_value(
    local_addr: &SocketAddr,
    protocol: SipProtocol,
    instance_id: Option<&str>,
    feature_tags: &[String],
) -> String {
    let mut contact = format!(
        "<sip:{}:{};transport={}>",
        format_host(&local_addr.ip()),
        local_addr.port(),
        protocol.as_str().to_ascii_lowercase()
    );
    if let Some(instance) = instance_id {
        contact.push_str(&format!(";{}=\"{}\"", SIP_INSTANCE_PARAM, instance));
    }
    for tag in feature_tags {
        contact.push(';');
        contact.push_str(tag);
    }
    contact
}

/// 构造 REGISTER 请求
pub fn build_register(params: &RegisterParams<'_>) -> Result<Request, RegistrationError> {
    let uri = rsip::Uri::try_from(params.target)?;

    let mut headers = Headers::default();
    headers.push(Header::Via(via_value(&params.local_addr, params.protocol, true).into()));
    headers.push(Header::MaxForwards(MAX_FORWARDS.into()));
    headers.push(Header::From(format!("<{}>;tag={}", params.local_party, make_tag()).into()));
    headers.push(Header::To(format!("<{}>", params.remote_party).into()));
    headers.push(Header::CallId(params.call_id.to_string().into()));
    headers.push(Header::CSeq(format!("{} REGISTER", params.cseq).into()));
    headers.push(Header::Contact(
        contact_value(&params.local_addr, params.protocol, params.instance_id, params.feature_tags).into(),
    ));
    let supported = if params.instance_id.is_some() { "path, gruu" } else { "path" };
    headers.push(Header::Supported(supported.into()));
    headers.push(Header::Allow(ALLOW_METHODS.into()));
    headers.push(Header::Expires(params.expires.to_string().into()));
    headers.push(Header::UserAgent(params.user_agent.to_string().into()));
    for route in params.route {
        headers.push(Header::Route(route.clone().into()));
    }
    headers.push(Header::ContentLength("0".into()));

    Ok(Request {
        method: rsip::Method::Register,
        uri,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    })
}

/// 构造保活用的 OPTIONS 请求
pub fn build_options(
    target: &str,
    local_party: &str,
    local_addr: SocketAddr,
    protocol: SipProtocol,
    user_agent: &str,
) -> Result<Request, RegistrationError> {
    let uri = rsip::Uri::try_from(target)?;

    let mut headers = Headers::default();
    headers.push(Header::Via(via_value(&local_addr, protocol, false).into()));
    headers.push(Header::MaxForwards(MAX_FORWARDS.into()));
    headers.push(Header::From(format!("<{}>;tag={}", local_party, make_tag()).into()));
    headers.push(Header::To(format!("<{}>", target).into()));
    headers.push(Header::CallId(crate::utils::make_call_id(None).into()));
    headers.push(Header::CSeq("1 OPTIONS".into()));
    headers.push(Header::UserAgent(user_agent.to_string().into()));
    headers.push(Header::ContentLength("0".into()));

    Ok(Request {
        method: rsip::Method::Options,
        uri,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    })
}

/// 替换 Authorization 头
pub fn set_authorization(request: &mut Request, value: String) {
    request.headers.retain(|h| !matches!(h, Header::Authorization(_)));
    request.headers.push(Header::Authorization(value.into()));
}
