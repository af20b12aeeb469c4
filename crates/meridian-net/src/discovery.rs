//! Bootstrap discovery: turns DNS records and a fixed seed into dial candidates.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};

use futures::future::BoxFuture;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use meridian_core::config::DiscoveryConfig;

/// Name resolution used by dialing and discovery. Tests substitute static
/// answers through this seam.
pub trait Resolver: Send + Sync {
    /// Every IP the host resolves to. IP literals resolve to themselves.
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;

    /// SRV targets as `(host, port)`.
    fn lookup_srv<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<(String, u16)>>>;
}

/// Operating-system resolver for hosts, hickory for SRV records.
pub struct SystemResolver {
    dns: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let dns = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "no system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { dns }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for SystemResolver {
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(vec![ip]);
            }
            let mut ips = Vec::new();
            for addr in tokio::net::lookup_host((host, 0)).await? {
                if !ips.contains(&addr.ip()) {
                    ips.push(addr.ip());
                }
            }
            Ok(ips)
        })
    }

    fn lookup_srv<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<(String, u16)>>> {
        Box::pin(async move {
            let records = self.dns.srv_lookup(name).await.map_err(io::Error::other)?;
            Ok(records
                .iter()
                .map(|srv| {
                    let target = srv.target().to_utf8();
                    (target.trim_end_matches('.').to_string(), srv.port())
                })
                .collect())
        })
    }
}

/// Split `host:port`, accepting bracketed IPv6 (`[::1]:30303`).
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Produces the initial set of peers to dial.
#[derive(Debug, Clone)]
pub struct Discovery {
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Candidate `host:port` addresses, in order: bootstrap host records,
    /// SRV targets, then the fallback seed. DNS failures only shrink the list;
    /// the fallback is always present.
    pub async fn candidates(&self, resolver: &dyn Resolver) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |candidate: String| {
            if seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        };

        match resolver.lookup_ip(&self.config.bootstrap_host).await {
            Ok(ips) => {
                tracing::debug!(host = %self.config.bootstrap_host, count = ips.len(), "bootstrap host resolved");
                for ip in ips {
                    push(SocketAddr::new(ip, self.config.default_port).to_string());
                }
            }
            Err(e) => {
                tracing::debug!(host = %self.config.bootstrap_host, error = %e, "bootstrap lookup failed")
            }
        }

        match resolver.lookup_srv(&self.config.srv_name).await {
            Ok(targets) => {
                for (target, port) in targets {
                    match resolver.lookup_ip(&target).await {
                        Ok(ips) => {
                            for ip in ips {
                                push(SocketAddr::new(ip, port).to_string());
                            }
                        }
                        Err(e) => tracing::debug!(host = %target, error = %e, "srv target lookup failed"),
                    }
                }
            }
            Err(e) => tracing::debug!(name = %self.config.srv_name, error = %e, "srv lookup failed"),
        }

        push(self.config.fallback_seed.clone());
        out
    }
}
