//! The `dns` resolver: `dns:///host[:port]`.
//!
//! Built on [`polling::PollingResolver`], using `trust-dns-resolver` the way
//! `ginepro`'s `DnsResolver` does (a `TokioAsyncResolver` built once from
//! system configuration, queried with `lookup_ip`), but driven through the
//! generic resolver/polling contract instead of reporting straight into a
//! `tower::discover::Change` channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tonic::async_trait;
use tracing::{debug, warn};
use trust_dns_resolver::{system_conf, TokioAsyncResolver};
use url::Url;

use crate::backoff::BackoffBuilder;
use crate::cancel::CancelToken;
use crate::status::Status;

use super::polling::{Poll, PollingResolver};
use super::{
    Address, Resolver, ResolverBuilder, ResolverListener, ResolverOptions, ResolverResult,
    TCP_ADDRESS_TYPE,
};

pub static DNS_SCHEME: &str = "dns";

/// The minimum interval enforced between two resolution attempts, per the
/// framework's DNS rate-limit rule.
const MIN_RESOLUTION_RATE: Duration = Duration::from_secs(15);

pub struct DnsResolverBuilder {
    refresh_interval: Option<Duration>,
}

impl DnsResolverBuilder {
    pub fn new() -> Self {
        Self {
            refresh_interval: None,
        }
    }

    /// If set, a timer fires `refresh()` at this cadence in addition to
    /// explicit callers.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }
}

impl Default for DnsResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverBuilder for DnsResolverBuilder {
    fn build(&self, target: Url, options: ResolverOptions) -> Arc<dyn Resolver> {
        let target_parse = parse_dns_target(&target, options.default_port);
        let dns_client = dns_client();

        let poller = DnsPoll {
            target: target_parse,
            dns_client,
            last_attempt_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        };

        let polling = PollingResolver::new(poller, BackoffBuilder::new(), "grpc::client::name_resolution::dns");
        Arc::new(DnsResolver {
            polling,
            refresh_interval: self.refresh_interval,
            timer_task: std::sync::Mutex::new(None),
        })
    }

    fn scheme(&self) -> &'static str {
        DNS_SCHEME
    }
}

fn dns_client() -> Result<TokioAsyncResolver, Status> {
    let (config, mut opts) = system_conf::read_system_conf().map_err(|e| {
        Status::with_cause(
            crate::status::Code::Unavailable,
            "failed to read system DNS configuration",
            e,
        )
    })?;
    opts.cache_size = 0;
    Ok(TokioAsyncResolver::tokio(config, opts))
}

/// Parses `dns:///host[:port]`. The authority must be empty; the path is
/// the hostname, optionally suffixed with `:port`.
fn parse_dns_target(target: &Url, default_port: u16) -> Result<(String, u16), Status> {
    let authority_present = target.host_str().map(|h| !h.is_empty()).unwrap_or(false);
    if authority_present {
        return Err(Status::unavailable(format!(
            "dns resolver target must have an empty authority, got {target}"
        )));
    }
    let path = target.path();
    let host_port = path.strip_prefix('/').unwrap_or(path);
    if host_port.is_empty() {
        return Err(Status::unavailable("dns resolver target is missing a path"));
    }
    match host_port.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() && port_str.chars().all(|c| c.is_ascii_digit()) && !port_str.is_empty() => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| Status::unavailable(format!("invalid port in dns target: {host_port}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((host_port.to_string(), default_port)),
    }
}

struct DnsPoll {
    target: Result<(String, u16), Status>,
    dns_client: Result<TokioAsyncResolver, Status>,
    last_attempt_ms: AtomicU64,
    epoch: Instant,
}

#[async_trait]
impl Poll for DnsPoll {
    async fn poll(&self, listener: &ResolverListener, cancel: &CancelToken) -> Result<bool, Status> {
        let (host, port) = self.target.clone()?;
        let client = match &self.dns_client {
            Ok(c) => c,
            Err(status) => return Err(status.clone()),
        };

        // Enforce the minimum re-resolution rate, honoring cancellation.
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last_ms = self.last_attempt_ms.load(Ordering::SeqCst);
        let elapsed = Duration::from_millis(now_ms.saturating_sub(last_ms));
        if last_ms != 0 && elapsed < MIN_RESOLUTION_RATE {
            let remaining = MIN_RESOLUTION_RATE - elapsed;
            debug!(target: "grpc::client::name_resolution::dns", ?remaining, "delaying resolution to honor minimum re-resolution rate");
            if !cancel.sleep(remaining).await {
                return Ok(false);
            }
        }
        self.last_attempt_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);

        let lookup = tokio::select! {
            res = client.lookup_ip(host.as_str()) => res,
            _ = cancel.cancelled() => return Ok(false),
        };

        match lookup {
            Ok(response) => {
                let addresses: Vec<Address> = response
                    .iter()
                    .map(|ip| Address::new(TCP_ADDRESS_TYPE, format!("{ip}:{port}")))
                    .collect();
                debug!(target: "grpc::client::name_resolution::dns", count = addresses.len(), "resolved addresses");
                listener(ResolverResult::success(addresses));
                Ok(true)
            }
            Err(e) => {
                warn!(target: "grpc::client::name_resolution::dns", error = %e, "dns lookup failed");
                Err(Status::with_cause(
                    crate::status::Code::Unavailable,
                    format!("dns lookup failed for {host}"),
                    e,
                ))
            }
        }
    }
}

struct DnsResolver {
    polling: PollingResolver<DnsPoll>,
    refresh_interval: Option<Duration>,
    timer_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Resolver for DnsResolver {
    fn start(&self, listener: ResolverListener) {
        self.polling.start(listener);
        if let Some(interval) = self.refresh_interval {
            let polling = self.polling.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    polling.refresh();
                }
            });
            *self.timer_task.lock().unwrap() = Some(handle);
        }
    }

    fn refresh(&self) {
        self.polling.refresh();
    }

    fn dispose(&self) {
        self.polling.dispose();
        if let Some(handle) = self.timer_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_explicit_port() {
        let url = Url::parse("dns:///my.host:50051").unwrap();
        let (host, port) = parse_dns_target(&url, 443).unwrap();
        assert_eq!(host, "my.host");
        assert_eq!(port, 50051);
    }

    #[test]
    fn falls_back_to_default_port() {
        let url = Url::parse("dns:///my.host").unwrap();
        let (host, port) = parse_dns_target(&url, 443).unwrap();
        assert_eq!(host, "my.host");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_nonempty_authority() {
        let url = Url::parse("dns://authority/my.host").unwrap();
        assert!(parse_dns_target(&url, 443).is_err());
    }

    #[test]
    fn rejects_missing_path() {
        let url = Url::parse("dns:///").unwrap();
        assert!(parse_dns_target(&url, 443).is_err());
    }
}
