//! Outbound dialing and DNS lookup collaborators.
//!
//! Every outbound socket the inbound opens (client admission callbacks, mesh
//! connections) goes through a [`Dialer`] rather than the default network
//! stack, so per-inbound and per-peer bind addresses and timeouts apply.

use crate::config::{DialerConfig, DomainStrategy};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Options for a DNS query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Address family preference.
    pub strategy: DomainStrategy,
}

/// DNS lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The resolver failed.
    #[error("lookup {domain}: {source}")]
    Resolve {
        /// The queried name.
        domain: String,
        /// Underlying resolver error.
        source: io::Error,
    },
    /// The name resolved, but no address survived the domain strategy.
    #[error("lookup {domain}: no addresses")]
    NoAddresses {
        /// The queried name.
        domain: String,
    },
}

/// Resolves hostnames to addresses.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Look up `domain`, returning its addresses in preference order.
    async fn lookup(&self, domain: &str, options: &QueryOptions)
        -> Result<Vec<IpAddr>, LookupError>;
}

/// The operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsLookup for SystemResolver {
    async fn lookup(
        &self,
        domain: &str,
        options: &QueryOptions,
    ) -> Result<Vec<IpAddr>, LookupError> {
        let resolved = tokio::net::lookup_host((domain, 0))
            .await
            .map_err(|e| LookupError::Resolve {
                domain: domain.to_string(),
                source: e,
            })?;

        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            let ip = addr.ip().to_canonical();
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }

        let addrs = apply_strategy(addrs, options.strategy);
        if addrs.is_empty() {
            return Err(LookupError::NoAddresses {
                domain: domain.to_string(),
            });
        }
        Ok(addrs)
    }
}

/// Filter and order addresses according to a domain strategy.
pub fn apply_strategy(mut addrs: Vec<IpAddr>, strategy: DomainStrategy) -> Vec<IpAddr> {
    match strategy {
        DomainStrategy::AsIs => {}
        DomainStrategy::PreferIpv4 => addrs.sort_by_key(|ip| !ip.is_ipv4()),
        DomainStrategy::PreferIpv6 => addrs.sort_by_key(|ip| !ip.is_ipv6()),
        DomainStrategy::Ipv4Only => addrs.retain(IpAddr::is_ipv4),
        DomainStrategy::Ipv6Only => addrs.retain(IpAddr::is_ipv6),
    }
    addrs
}

/// Opens outbound TCP connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `host:port`; `host` may be a hostname or an IP literal.
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream>;

    /// Query options this dialer resolves hostnames with.
    fn query_options(&self) -> QueryOptions;
}

/// Dials directly from this host, honoring a [`DialerConfig`].
#[derive(Clone)]
pub struct DirectDialer {
    config: DialerConfig,
    resolver: Arc<dyn DnsLookup>,
}

impl std::fmt::Debug for DirectDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectDialer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DirectDialer {
    /// Create a dialer from configuration.
    pub fn new(config: &DialerConfig, resolver: Arc<dyn DnsLookup>) -> Self {
        Self {
            config: config.clone(),
            resolver,
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs.max(1))
    }

    async fn connect_one(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(bind) = self.config.bind_address {
            if bind.is_ipv4() == addr.is_ipv4() {
                socket.bind(SocketAddr::new(bind, 0))?;
            }
        }
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        let addrs = match literal.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self
                .resolver
                .lookup(host, &self.query_options())
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?,
        };

        let mut last_err = None;
        for ip in addrs {
            let addr = SocketAddr::new(ip, port);
            match tokio::time::timeout(self.connect_timeout(), self.connect_one(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::debug!("Dial {} failed: {}", addr, e);
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::debug!("Dial {} timed out", addr);
                    last_err = Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    ));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
        }))
    }

    fn query_options(&self) -> QueryOptions {
        QueryOptions {
            strategy: self.config.domain_strategy,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Resolver answering from a fixed table.
    #[derive(Default)]
    pub(crate) struct StaticResolver(pub HashMap<String, Vec<IpAddr>>);

    impl StaticResolver {
        pub(crate) fn with(domain: &str, addrs: &[&str]) -> Self {
            let mut table = HashMap::new();
            table.insert(
                domain.to_string(),
                addrs.iter().map(|a| a.parse().unwrap()).collect(),
            );
            Self(table)
        }
    }

    #[async_trait]
    impl DnsLookup for StaticResolver {
        async fn lookup(
            &self,
            domain: &str,
            options: &QueryOptions,
        ) -> Result<Vec<IpAddr>, LookupError> {
            match self.0.get(domain) {
                Some(addrs) => Ok(apply_strategy(addrs.clone(), options.strategy)),
                None => Err(LookupError::NoAddresses {
                    domain: domain.to_string(),
                }),
            }
        }
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn strategies_order_and_filter() {
        let mixed = ips(&["2001:db8::1", "192.0.2.1", "2001:db8::2", "192.0.2.2"]);

        assert_eq!(apply_strategy(mixed.clone(), DomainStrategy::AsIs), mixed);
        assert_eq!(
            apply_strategy(mixed.clone(), DomainStrategy::PreferIpv4),
            ips(&["192.0.2.1", "192.0.2.2", "2001:db8::1", "2001:db8::2"])
        );
        assert_eq!(
            apply_strategy(mixed.clone(), DomainStrategy::PreferIpv6),
            ips(&["2001:db8::1", "2001:db8::2", "192.0.2.1", "192.0.2.2"])
        );
        assert_eq!(
            apply_strategy(mixed.clone(), DomainStrategy::Ipv4Only),
            ips(&["192.0.2.1", "192.0.2.2"])
        );
        assert_eq!(
            apply_strategy(mixed, DomainStrategy::Ipv6Only),
            ips(&["2001:db8::1", "2001:db8::2"])
        );
    }

    #[tokio::test]
    async fn dials_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dialer = DirectDialer::new(&DialerConfig::default(), Arc::new(StaticResolver::default()));

        let stream = dialer.dial("127.0.0.1", port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn dials_hostname_through_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let resolver = StaticResolver::with("relay.test", &["127.0.0.1"]);
        let dialer = DirectDialer::new(&DialerConfig::default(), Arc::new(resolver));

        let stream = dialer.dial("relay.test", port).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn unresolvable_host_fails() {
        let dialer = DirectDialer::new(&DialerConfig::default(), Arc::new(StaticResolver::default()));
        let err = dialer.dial("missing.test", 443).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn system_resolver_filters_by_strategy() {
        let options = QueryOptions {
            strategy: DomainStrategy::Ipv4Only,
        };
        match SystemResolver.lookup("localhost", &options).await {
            Ok(addrs) => assert!(addrs.iter().all(IpAddr::is_ipv4)),
            Err(LookupError::NoAddresses { .. } | LookupError::Resolve { .. }) => {}
        }
    }

    #[test]
    fn dialer_reports_query_options() {
        let config = DialerConfig {
            domain_strategy: DomainStrategy::PreferIpv4,
            ..DialerConfig::default()
        };
        let dialer = DirectDialer::new(&config, Arc::new(SystemResolver));
        assert_eq!(dialer.query_options().strategy, DomainStrategy::PreferIpv4);
    }
}
