use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PulseError, PulseResult};
use crate::models::GeoLocation;
use crate::race::best_effort_all;
use crate::rpc::HTTP_CLIENT;

/// Most addresses the remote service accepts per request.
pub const BATCH_LIMIT: usize = 100;

pub trait GeoLookup: Send + Sync {
    /// Locations for the addresses the service could place. Addresses it
    /// could not place are simply absent from the map.
    fn lookup_batch<'a>(&'a self, ips: &'a [String]) -> BoxFuture<'a, PulseResult<HashMap<String, GeoLocation>>>;
}

/// ip-api style batch endpoint: POST a JSON array of addresses, receive an
/// array of per-address results.
#[derive(Debug, Clone)]
pub struct HttpGeoBatch {
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchEntry {
    status: String,
    query: String,
    lat: Option<f64>,
    lon: Option<f64>,
    country: Option<String>,
    country_code: Option<String>,
    city: Option<String>,
}

impl GeoLookup for HttpGeoBatch {
    fn lookup_batch<'a>(&'a self, ips: &'a [String]) -> BoxFuture<'a, PulseResult<HashMap<String, GeoLocation>>> {
        async move {
            let response = HTTP_CLIENT.post(self.url.as_str()).json(ips).send().await?;
            if !response.status().is_success() {
                return Err(PulseError::Status(response.status().as_u16()));
            }
            let entries: Vec<BatchEntry> = response.json().await?;
            Ok(entries
                .into_iter()
                .filter(|entry| entry.status == "success")
                .filter_map(|entry| {
                    let location = GeoLocation {
                        lat: entry.lat?,
                        lon: entry.lon?,
                        country: entry.country.unwrap_or_default(),
                        country_code: entry.country_code.unwrap_or_default(),
                        city: entry.city.unwrap_or_default(),
                    };
                    Some((entry.query, location))
                })
                .collect())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OfflineRow {
    start_ip: Ipv4Addr,
    end_ip: Ipv4Addr,
    lat: f64,
    lon: f64,
    country: String,
    country_code: String,
    city: String,
}

#[derive(Debug, Clone)]
pub struct GeoRange {
    pub start: u32,
    pub end: u32,
    pub location: GeoLocation,
}

/// IPv4 range table, sorted by range start.
#[derive(Debug, Clone, Default)]
pub struct OfflineGeoDb {
    ranges: Vec<GeoRange>,
}

impl OfflineGeoDb {
    /// Reads a headed CSV with columns
    /// `start_ip,end_ip,lat,lon,country,country_code,city`.
    pub fn load(path: impl AsRef<Path>) -> PulseResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut ranges = Vec::new();
        for row in reader.deserialize::<OfflineRow>() {
            let row = row?;
            ranges.push(GeoRange {
                start: u32::from(row.start_ip),
                end: u32::from(row.end_ip),
                location: GeoLocation {
                    lat: row.lat,
                    lon: row.lon,
                    country: row.country,
                    country_code: row.country_code,
                    city: row.city,
                },
            });
        }
        Ok(Self::from_ranges(ranges))
    }

    pub fn from_ranges(mut ranges: Vec<GeoRange>) -> Self {
        ranges.retain(|range| range.start <= range.end);
        ranges.sort_by_key(|range| range.start);
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn lookup(&self, ip: &str) -> Option<GeoLocation> {
        let addr = match ip.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => u32::from(v4),
            IpAddr::V6(v6) => u32::from(v6.to_ipv4_mapped()?),
        };
        // last range starting at or before addr
        let idx = self.ranges.partition_point(|range| range.start <= addr);
        let candidate = self.ranges.get(idx.checked_sub(1)?)?;
        (addr <= candidate.end).then(|| candidate.location.clone())
    }
}

/// Whether `host` could carry a public geolocation at all.
pub fn is_public_ip(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            let shared = octets[0] == 100 && (octets[1] & 0xc0) == 64;
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || shared)
        }
        Ok(IpAddr::V6(v6)) => {
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || unique_local || link_local)
        }
        Err(_) => false,
    }
}

pub struct GeoResolver {
    remote: Option<Arc<dyn GeoLookup>>,
    offline: Option<OfflineGeoDb>,
    cache: RwLock<HashMap<String, GeoLocation>>,
    timeout: Duration,
}

impl GeoResolver {
    pub fn new(remote: Option<Arc<dyn GeoLookup>>, offline: Option<OfflineGeoDb>, timeout: Duration) -> Self {
        Self {
            remote,
            offline,
            cache: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Resolves every distinct host. The result has an entry for each input.
    ///
    /// Definitive answers are cached for the life of the process. When the
    /// remote service cannot be reached and the offline table has no match,
    /// the sentinel is returned but not cached, so the host is retried on
    /// the next cycle.
    pub async fn resolve_many<'h>(&self, hosts: impl IntoIterator<Item = &'h str>) -> HashMap<String, GeoLocation> {
        let mut resolved = HashMap::new();
        let mut pending = Vec::new();
        let mut seen = HashSet::new();

        {
            let mut cache = self.cache.write();
            for host in hosts {
                if !seen.insert(host) {
                    continue;
                }
                if let Some(location) = cache.get(host) {
                    resolved.insert(host.to_string(), location.clone());
                } else if !is_public_ip(host) {
                    let sentinel = GeoLocation::sentinel();
                    cache.insert(host.to_string(), sentinel.clone());
                    resolved.insert(host.to_string(), sentinel);
                } else {
                    pending.push(host.to_string());
                }
            }
        }

        if pending.is_empty() {
            return resolved;
        }

        let chunks: Vec<&[String]> = pending.chunks(BATCH_LIMIT).collect();
        let outcomes: Vec<Option<HashMap<String, GeoLocation>>> = match &self.remote {
            Some(remote) => best_effort_all(chunks.iter().map(|chunk| remote.lookup_batch(chunk)), self.timeout)
                .await
                .into_iter()
                .map(|outcome| match outcome {
                    Ok(found) => Some(found),
                    Err(err) => {
                        warn!(%err, "remote geolocation unavailable, using offline database");
                        None
                    }
                })
                .collect(),
            // no remote configured: the offline table is authoritative
            None => chunks.iter().map(|_| Some(HashMap::new())).collect(),
        };

        let mut cache = self.cache.write();
        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            let answered = outcome.is_some();
            let mut found = outcome.unwrap_or_default();
            for ip in chunk.iter() {
                let location = found
                    .remove(ip)
                    .or_else(|| self.offline.as_ref().and_then(|db| db.lookup(ip)));
                match location {
                    Some(location) => {
                        cache.insert(ip.clone(), location.clone());
                        resolved.insert(ip.clone(), location);
                    }
                    None => {
                        let sentinel = GeoLocation::sentinel();
                        if answered {
                            cache.insert(ip.clone(), sentinel.clone());
                        }
                        resolved.insert(ip.clone(), sentinel);
                    }
                }
            }
        }
        debug!(requested = pending.len(), cached = cache.len(), "geolocation resolved");
        resolved
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote lookup backed by a fixed table; optionally always failing.
    pub(crate) struct TableLookup {
        pub table: HashMap<String, GeoLocation>,
        pub fail: bool,
        pub batches: AtomicUsize,
        pub largest_batch: AtomicUsize,
    }

    impl TableLookup {
        pub(crate) fn new(entries: &[(&str, GeoLocation)], fail: bool) -> Arc<Self> {
            Arc::new(Self {
                table: entries.iter().map(|(ip, loc)| (ip.to_string(), loc.clone())).collect(),
                fail,
                batches: AtomicUsize::new(0),
                largest_batch: AtomicUsize::new(0),
            })
        }
    }

    impl GeoLookup for TableLookup {
        fn lookup_batch<'a>(&'a self, ips: &'a [String]) -> BoxFuture<'a, PulseResult<HashMap<String, GeoLocation>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.largest_batch.fetch_max(ips.len(), Ordering::SeqCst);
            async move {
                if self.fail {
                    return Err(PulseError::Status(429));
                }
                Ok(ips
                    .iter()
                    .filter_map(|ip| self.table.get(ip).map(|loc| (ip.clone(), loc.clone())))
                    .collect())
            }
            .boxed()
        }
    }

    pub(crate) fn city(name: &str, country: &str, lat: f64, lon: f64) -> GeoLocation {
        GeoLocation {
            lat,
            lon,
            country: country.to_string(),
            country_code: country[..2].to_uppercase(),
            city: name.to_string(),
        }
    }

    fn offline_db() -> OfflineGeoDb {
        OfflineGeoDb::from_ranges(vec![GeoRange {
            start: u32::from(Ipv4Addr::new(5, 0, 0, 0)),
            end: u32::from(Ipv4Addr::new(5, 0, 0, 255)),
            location: city("Berlin", "Germany", 52.5, 13.4),
        }])
    }

    #[test]
    fn private_addresses_are_not_public() {
        assert!(!is_public_ip("10.1.2.3"));
        assert!(!is_public_ip("192.168.0.9"));
        assert!(!is_public_ip("127.0.0.1"));
        assert!(!is_public_ip("100.64.0.1"));
        assert!(!is_public_ip("fd00::1"));
        assert!(!is_public_ip("not-an-ip"));
        assert!(is_public_ip("8.8.8.8"));
        assert!(is_public_ip("2001:4860::8888"));
    }

    #[test]
    fn offline_range_lookup() {
        let db = offline_db();
        assert_eq!(db.lookup("5.0.0.7").unwrap().city, "Berlin");
        assert!(db.lookup("5.0.1.0").is_none());
        assert!(db.lookup("4.255.255.255").is_none());
    }

    #[test]
    fn offline_db_loads_csv() {
        let path = std::env::temp_dir().join(format!("pulse-geo-{}.csv", std::process::id()));
        std::fs::write(
            &path,
            "start_ip,end_ip,lat,lon,country,country_code,city\n1.0.0.0,1.0.0.255,35.6,139.7,Japan,JP,Tokyo\n",
        )
        .unwrap();
        let db = OfflineGeoDb::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(db.len(), 1);
        assert_eq!(db.lookup("1.0.0.42").unwrap().country_code, "JP");
    }

    #[tokio::test]
    async fn remote_then_offline_then_sentinel() {
        let remote = TableLookup::new(&[("8.8.8.8", city("Mountain View", "United States", 37.4, -122.1))], false);
        let resolver = GeoResolver::new(Some(remote.clone()), Some(offline_db()), Duration::from_secs(1));

        let out = resolver.resolve_many(["8.8.8.8", "5.0.0.1", "9.9.9.9", "10.0.0.1"]).await;
        assert_eq!(out["8.8.8.8"].city, "Mountain View");
        assert_eq!(out["5.0.0.1"].city, "Berlin");
        assert!(out["9.9.9.9"].is_sentinel());
        assert_eq!(out["10.0.0.1"].country, "Private Network");
        assert_eq!(resolver.cache_len(), 4);

        resolver.resolve_many(["8.8.8.8", "9.9.9.9"]).await;
        assert_eq!(remote.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_remote_misses_are_retried() {
        let remote = TableLookup::new(&[], true);
        let resolver = GeoResolver::new(Some(remote.clone()), Some(offline_db()), Duration::from_secs(1));

        let out = resolver.resolve_many(["5.0.0.1", "9.9.9.9"]).await;
        assert_eq!(out["5.0.0.1"].city, "Berlin");
        assert!(out["9.9.9.9"].is_sentinel());
        assert!(resolver.cache.read().contains_key("5.0.0.1"));
        assert!(!resolver.cache.read().contains_key("9.9.9.9"));

        resolver.resolve_many(["9.9.9.9"]).await;
        assert_eq!(remote.batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batches_are_capped() {
        let remote = TableLookup::new(&[], false);
        let resolver = GeoResolver::new(Some(remote.clone()), None, Duration::from_secs(1));
        let hosts: Vec<String> = (0..250).map(|i| format!("8.8.{}.{}", i / 200, i % 200)).collect();
        let out = resolver.resolve_many(hosts.iter().map(String::as_str)).await;
        assert_eq!(out.len(), 250);
        assert_eq!(remote.batches.load(Ordering::SeqCst), 3);
        assert_eq!(remote.largest_batch.load(Ordering::SeqCst), BATCH_LIMIT);
    }
}
