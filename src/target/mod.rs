pub mod dns;
pub mod redirect;
pub mod reserved;

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use url::{Host, Url};

use crate::error::ClassifyError;
pub use dns::{DnsLookup, LookupError, SoaReply, SystemDns};

const ARN_PREFIX: &str = "arn:";
const ARN_SECTIONS: usize = 6;

/// Kind of asset a target string represents, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    IpAddress,
    Cidr,
    Url,
    AwsAccount,
    DockerImage,
    Hostname,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::IpAddress => "ip",
            TargetKind::Cidr => "cidr",
            TargetKind::Url => "url",
            TargetKind::AwsAccount => "aws-account",
            TargetKind::DockerImage => "docker-image",
            TargetKind::Hostname => "hostname",
        }
    }
}

/// A target received by a check.
///
/// `is_hostname` and `is_domain_name` need network lookups, their answers are
/// cached on the instance. A `Target` has a single owner and is never shared
/// between concurrent classifications.
#[derive(Debug, Clone)]
pub struct Target {
    pub value: String,
    hostname: Option<bool>,
    domain_name: Option<bool>,
}

impl Target {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            hostname: None,
            domain_name: None,
        }
    }

    pub fn is_ip(&self) -> bool {
        is_ip(&self.value)
    }

    pub fn is_cidr(&self) -> bool {
        is_cidr(&self.value)
    }

    pub fn is_url(&self) -> bool {
        is_url(&self.value)
    }

    pub fn is_docker_image(&self) -> bool {
        is_docker_image(&self.value)
    }

    pub fn is_aws_account(&self) -> bool {
        is_aws_account(&self.value)
    }

    /// Classification that needs no network access.
    pub fn kind(&self) -> TargetKind {
        if self.is_ip() {
            TargetKind::IpAddress
        } else if self.is_cidr() {
            TargetKind::Cidr
        } else if self.is_url() {
            TargetKind::Url
        } else if self.is_aws_account() {
            TargetKind::AwsAccount
        } else if self.is_docker_image() {
            TargetKind::DockerImage
        } else {
            TargetKind::Hostname
        }
    }
}

/// True iff the value is a literal IPv4 or IPv6 address.
pub fn is_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

/// True iff the value is an address/prefix pair.
pub fn is_cidr(value: &str) -> bool {
    // ipnetwork accepts a bare address as a host network
    value.contains('/') && value.parse::<IpNetwork>().is_ok()
}

/// True iff the value is an absolute URI with an authority,
/// `scheme://host[...]`. Opaque forms such as `host:port` or `mailto:` are not.
pub fn is_url(value: &str) -> bool {
    parse_request_url(value).is_some()
}

fn parse_request_url(value: &str) -> Option<Url> {
    if !value.contains("://") {
        return None;
    }
    Url::parse(value).ok().filter(|url| !url.cannot_be_a_base() && url.has_host())
}

/// A registry domain (contains a dot) followed by exactly one `image:tag`.
pub fn is_docker_image(value: &str) -> bool {
    match value.split_once('/') {
        Some((registry, rest)) => registry.contains('.') && rest.split(':').count() == 2,
        None => false,
    }
}

/// True iff the value is an ARN, `arn:partition:service:region:account:resource`.
pub fn is_aws_account(value: &str) -> bool {
    value.starts_with(ARN_PREFIX) && value.splitn(ARN_SECTIONS, ':').count() == ARN_SECTIONS
}

fn normalize_fqdn(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Decides what a target is and whether it may be scanned.
#[derive(Clone)]
pub struct TargetClassifier {
    dns: Arc<dyn DnsLookup>,
}

impl TargetClassifier {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        Self { dns }
    }

    /// Classifier backed by the system resolver.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemDns::new()))
    }

    /// True if the target is not an IP but resolves to at least one address.
    pub async fn is_hostname(&self, target: &mut Target) -> Result<bool, ClassifyError> {
        if let Some(cached) = target.hostname {
            return Ok(cached);
        }
        if target.is_ip() {
            target.hostname = Some(false);
            return Ok(false);
        }

        let is = match self.dns.lookup_ip(&target.value).await {
            Ok(addrs) => !addrs.is_empty(),
            Err(LookupError::NotFound) => false,
            Err(LookupError::Failed(reason)) => {
                return Err(ClassifyError::Lookup {
                    host: target.value.clone(),
                    reason,
                });
            }
        };
        log::debug!("[target] is_hostname: target={} result={}", target.value, is);
        target.hostname = Some(is);
        Ok(is)
    }

    /// True if a name server returns an SOA record owned by the target name.
    pub async fn is_domain_name(&self, target: &mut Target) -> Result<bool, ClassifyError> {
        if let Some(cached) = target.domain_name {
            return Ok(cached);
        }
        if target.is_ip() {
            return Ok(false);
        }

        let is = self.has_soa_record(&target.value).await?;
        log::debug!("[target] is_domain_name: target={} result={}", target.value, is);
        target.domain_name = Some(is);
        Ok(is)
    }

    async fn has_soa_record(&self, name: &str) -> Result<bool, ClassifyError> {
        let fqdn = format!("{}.", normalize_fqdn(name));
        let mut reply = None;
        for server in self.dns.name_servers().await? {
            let answer = self.dns.query_soa(server, &fqdn).await?;
            if answer.success {
                reply = Some(answer);
                break;
            }
            log::debug!("[target] soa_unsuccessful: server={} name={}", server, fqdn);
        }

        let reply = reply.ok_or(ClassifyError::NoValidAnswer)?;
        Ok(reply
            .soa_owners
            .iter()
            .any(|owner| normalize_fqdn(owner).eq_ignore_ascii_case(normalize_fqdn(&fqdn))))
    }

    /// Whether the target is safe to scan. IPs and CIDRs are tested directly,
    /// URLs by their host, anything else by every address it resolves to.
    /// Fails closed: any lookup problem makes the target not scannable.
    pub async fn is_scannable(&self, value: &str) -> bool {
        if let Ok(ip) = value.parse::<IpAddr>() {
            let ok = !reserved::is_reserved_ip(ip);
            log::debug!("[target] is_scannable: target={} kind=ip result={}", value, ok);
            return ok;
        }
        if is_cidr(value) {
            let ok = match value.parse::<IpNetwork>() {
                Ok(network) => !reserved::is_reserved_network(network),
                Err(_) => false,
            };
            log::debug!("[target] is_scannable: target={} kind=cidr result={}", value, ok);
            return ok;
        }

        let mut host = value.to_string();
        if let Some(url) = parse_request_url(value) {
            match url.host() {
                Some(Host::Ipv4(v4)) => return !reserved::is_reserved_v4(v4),
                Some(Host::Ipv6(v6)) => return !reserved::is_reserved_v6(v6),
                Some(Host::Domain(domain)) => host = domain.to_string(),
                None => {}
            }
        }

        let addrs = match self.dns.lookup_ip(&host).await {
            Ok(addrs) => addrs,
            Err(e) => {
                log::warn!("[target] is_scannable: target={} host={} lookup_error={}", value, host, e);
                return false;
            }
        };
        if addrs.is_empty() {
            log::warn!("[target] is_scannable: target={} host={} no_addresses", value, host);
            return false;
        }

        let ok = addrs.iter().all(|addr| !reserved::is_reserved_ip(*addr));
        log::debug!("[target] is_scannable: target={} host={} addrs={:?} result={}", value, host, addrs, ok);
        ok
    }
}
