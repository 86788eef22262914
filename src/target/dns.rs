use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;
use tokio::sync::OnceCell;
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::proto::rr::RecordType;
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::ClassifyError;

const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Messages the system resolver uses for a name that does not exist.
const NOT_FOUND_TOKENS: &[&str] = &[
    "no such host",
    "not known",
    "no address associated",
    "nodename nor servname",
    "non-recoverable failure in name resolution",
];

/// Outcome of a forward lookup failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    NotFound,
    Failed(String),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound => write!(f, "no such host"),
            LookupError::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

/// Reply of one name server to an SOA query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoaReply {
    /// The server answered with a NOERROR response code.
    pub success: bool,
    /// Owner names of the SOA records in the answer section.
    pub soa_owners: Vec<String>,
}

/// The DNS operations target classification depends on.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Forward lookup through the standard system resolver.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, LookupError>;

    /// Name servers to ask for SOA records, in configured order.
    async fn name_servers(&self) -> Result<Vec<SocketAddr>, ClassifyError>;

    /// Sends a single SOA query for the fully qualified `name` to `server`.
    async fn query_soa(&self, server: SocketAddr, name: &str) -> Result<SoaReply, ClassifyError>;
}

fn is_not_found(err: &io::Error) -> bool {
    let message = err.to_string().to_lowercase();
    NOT_FOUND_TOKENS.iter().any(|token| message.contains(token))
}

/// System backed implementation: getaddrinfo for forward lookups and the
/// servers listed in the resolver configuration file for SOA queries.
pub struct SystemDns {
    resolv_conf: String,
    servers: OnceCell<Vec<NameServerConfig>>,
}

impl SystemDns {
    pub fn new() -> Self {
        Self::with_resolv_conf(RESOLV_CONF_PATH)
    }

    pub fn with_resolv_conf(path: impl Into<String>) -> Self {
        Self {
            resolv_conf: path.into(),
            servers: OnceCell::new(),
        }
    }

    async fn configured_servers(&self) -> Result<&Vec<NameServerConfig>, ClassifyError> {
        self.servers
            .get_or_try_init(|| async {
                let contents = tokio::fs::read(&self.resolv_conf)
                    .await
                    .map_err(|e| ClassifyError::ResolverConfig(format!("{}: {}", self.resolv_conf, e)))?;
                let (config, _) = trust_dns_resolver::system_conf::parse_resolv_conf(&contents)
                    .map_err(|e| ClassifyError::ResolverConfig(e.to_string()))?;
                let mut servers: Vec<NameServerConfig> = Vec::new();
                for ns in config.name_servers() {
                    if ns.protocol == Protocol::Udp && !servers.iter().any(|s| s.socket_addr == ns.socket_addr) {
                        servers.push(ns.clone());
                    }
                }
                log::debug!("[target::dns] resolver_config_loaded: path={} servers={}",
                    self.resolv_conf, servers.len());
                Ok(servers)
            })
            .await
    }
}

impl Default for SystemDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsLookup for SystemDns {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        log::debug!("[target::dns] lookup_ip: host={}", host);
        match lookup_host((host, 0)).await {
            Ok(addrs) => Ok(addrs.map(|addr| addr.ip()).collect()),
            Err(e) if is_not_found(&e) => {
                log::debug!("[target::dns] host_not_found: host={} error={}", host, e);
                Err(LookupError::NotFound)
            }
            Err(e) => {
                log::warn!("[target::dns] lookup_failed: host={} error={}", host, e);
                Err(LookupError::Failed(e.to_string()))
            }
        }
    }

    async fn name_servers(&self) -> Result<Vec<SocketAddr>, ClassifyError> {
        Ok(self.configured_servers().await?.iter().map(|ns| ns.socket_addr).collect())
    }

    async fn query_soa(&self, server: SocketAddr, name: &str) -> Result<SoaReply, ClassifyError> {
        let servers = self.configured_servers().await?;
        let ns = servers
            .iter()
            .find(|ns| ns.socket_addr == server)
            .cloned()
            .ok_or_else(|| ClassifyError::ResolverConfig(format!("unknown name server {}", server)))?;

        let mut opts = ResolverOpts::default();
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.ndots = 0;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], vec![ns]), opts);

        log::debug!("[target::dns] query_soa: server={} name={}", server, name);
        match resolver.lookup(name, RecordType::SOA).await {
            Ok(lookup) => Ok(SoaReply {
                success: true,
                soa_owners: lookup
                    .records()
                    .iter()
                    .filter(|record| record.record_type() == RecordType::SOA)
                    .map(|record| record.name().to_string())
                    .collect(),
            }),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                    log::debug!("[target::dns] soa_no_records: server={} name={} rcode={}",
                        server, name, response_code);
                    Ok(SoaReply {
                        success: *response_code == ResponseCode::NoError,
                        soa_owners: Vec::new(),
                    })
                }
                _ => Err(ClassifyError::Lookup {
                    host: name.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}
