/// 代理地址解析
///
/// 按 NAPTR -> SRV -> A 的顺序把配置的代理主机名解析成 IP 和端口。
/// DNS 查询通过 `DnsLookup` trait 完成，默认实现基于 hickory-resolver。
use crate::config::SipProtocol;
use crate::error::{RegistrationError, RegistrationResult};
use async_trait::async_trait;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    proto::rr::RecordType,
    TokioAsyncResolver,
};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 否定应答的缓存时间
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaptrRecord {
    pub order: u16,
    pub preference: u16,
    pub service: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// 解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsResolvedFields {
    pub ip: IpAddr,
    pub port: u16,
}

/// DNS 查询接口，查询失败或无记录时返回空
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn naptr(&self, name: &str) -> Vec<NaptrRecord>;
    async fn srv(&self, name: &str) -> Vec<SrvRecord>;
    async fn a(&self, host: &str) -> Option<IpAddr>;
}

/// 基于 hickory-resolver 的 DNS 查询
pub struct HickoryDnsLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsLookup {
    /// 读取系统 DNS 配置，失败时使用默认配置
    pub fn new() -> Self {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf().unwrap_or_else(|e| {
            warn!("读取系统DNS配置失败，使用默认配置: {}", e);
            (ResolverConfig::default(), ResolverOpts::default())
        });
        opts.negative_max_ttl = Some(NEGATIVE_CACHE_TTL);
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl Default for HickoryDnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_root(name: String) -> String {
    name.trim_end_matches('.').to_string()
}

#[async_trait]
impl DnsLookup for HickoryDnsLookup {
    async fn naptr(&self, name: &str) -> Vec<NaptrRecord> {
        let lookup = match self.resolver.lookup(format!("{}.", name), RecordType::NAPTR).await {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!("NAPTR 查询无结果 {}: {}", name, e);
                return Vec::new();
            }
        };

        let mut records: Vec<NaptrRecord> = lookup
            .iter()
            .filter_map(|rec| rec.as_naptr())
            .map(|naptr| NaptrRecord {
                order: naptr.order(),
                preference: naptr.preference(),
                service: String::from_utf8_lossy(naptr.services()).to_string(),
                replacement: trim_root(naptr.replacement().to_utf8()),
            })
            .collect();
        records.sort_by_key(|r| (r.order, r.preference));
        records
    }

    async fn srv(&self, name: &str) -> Vec<SrvRecord> {
        match self.resolver.srv_lookup(format!("{}.", name)).await {
            Ok(lookup) => lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: trim_root(srv.target().to_utf8()),
                })
                .collect(),
            Err(e) => {
                debug!("SRV 查询无结果 {}: {}", name, e);
                Vec::new()
            }
        }
    }

    async fn a(&self, host: &str) -> Option<IpAddr> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let ips: Vec<IpAddr> = lookup.iter().collect();
                ips.iter().find(|ip| ip.is_ipv4()).or_else(|| ips.first()).copied()
            }
            Err(e) => {
                debug!("A 查询无结果 {}: {}", host, e);
                None
            }
        }
    }
}

/// 选择最优 SRV 记录：优先级最小，同优先级取权重最大
pub fn best_srv(records: &[SrvRecord]) -> Option<&SrvRecord> {
    records.iter().min_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)))
}

/// SRV 服务名
fn srv_name(host: &str, protocol: SipProtocol) -> String {
    if host.starts_with("_sip._") || host.starts_with("_sips._") {
        return host.to_string();
    }
    match protocol {
        SipProtocol::Udp => format!("_sip._udp.{}", host),
        SipProtocol::Tcp => format!("_sip._tcp.{}", host),
        SipProtocol::Tls => format!("_sips._tcp.{}", host),
    }
}

/// 代理解析器
pub struct ProxyResolver {
    dns: std::sync::Arc<dyn DnsLookup>,
}

impl ProxyResolver {
    pub fn new(dns: std::sync::Arc<dyn DnsLookup>) -> Self {
        Self { dns }
    }

    /// 解析代理地址
    ///
    /// 1. 字面量 IP 直接使用
    /// 2. NAPTR 命中协议对应的服务时，对其 replacement 做 SRV，无 SRV 则 A(host)
    /// 3. 否则尝试 SRV(_sip._proto.host)
    /// 4. 最后 A(host) + 配置端口
    pub async fn resolve(&self, host: &str, port: u16, protocol: SipProtocol) -> RegistrationResult<DnsResolvedFields> {
        let host = host.trim();
        if host.is_empty() {
            return Err(RegistrationError::NotConfigured);
        }

        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            debug!("代理为IP地址，跳过DNS: {}", ip);
            return Ok(DnsResolvedFields { ip, port });
        }

        let service = protocol.naptr_service();
        let naptr = self.dns.naptr(host).await;
        if let Some(record) = naptr.iter().find(|r| r.service.eq_ignore_ascii_case(service)) {
            debug!("NAPTR {} -> {} ({})", host, record.replacement, record.service);
            let srv = self.dns.srv(&record.replacement).await;
            return match best_srv(&srv) {
                Some(best) => self.resolve_srv_target(host, port, best).await,
                None => self.resolve_a(host, port).await,
            };
        }

        let srv = self.dns.srv(&srv_name(host, protocol)).await;
        if let Some(best) = best_srv(&srv) {
            return self.resolve_srv_target(host, port, best).await;
        }

        self.resolve_a(host, port).await
    }

    async fn resolve_srv_target(&self, host: &str, port: u16, srv: &SrvRecord) -> RegistrationResult<DnsResolvedFields> {
        match self.dns.a(&srv.target).await {
            Some(ip) => {
                info!("代理 {} 解析为 {}:{} (SRV {})", host, ip, srv.port, srv.target);
                Ok(DnsResolvedFields { ip, port: srv.port })
            }
            None => {
                warn!("SRV 目标 {} 无 A 记录，回退到 {}", srv.target, host);
                self.resolve_a(host, port).await
            }
        }
    }

    async fn resolve_a(&self, host: &str, port: u16) -> RegistrationResult<DnsResolvedFields> {
        match self.dns.a(host).await {
            Some(ip) => {
                info!("代理 {} 解析为 {}:{}", host, ip, port);
                Ok(DnsResolvedFields { ip, port })
            }
            None => Err(RegistrationError::dns(host, "NAPTR/SRV/A 均无结果")),
        }
    }
}
