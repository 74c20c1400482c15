use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PulseResult;
use crate::models::{EndpointStatus, RawNodeRecord};
use crate::race::{best_effort_all, first_success, with_timeout};
use crate::rpc::NodeSource;

/// Index of the hero inside the endpoint table.
const HERO: usize = 0;

/// Discovery rounds a side-cache entry survives without being seen again.
const DISCOVERY_RETENTION_ROUNDS: u64 = 3;

type Pods = Arc<Vec<RawNodeRecord>>;
type SharedFetch = Shared<BoxFuture<'static, Pods>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub hero: String,
    pub backups: Vec<String>,
    pub call_timeout: Duration,
    pub freshness: Duration,
    /// Backups raced concurrently after the active endpoint fails. Zero
    /// skips the race and goes straight to the sequential walk.
    pub race_width: usize,
    /// Backups polled per passive discovery round.
    pub discovery_sample: usize,
}

#[derive(Debug)]
struct EndpointState {
    url: String,
    failures: u32,
}

#[derive(Debug)]
struct CachedPods {
    fetched_at: Instant,
    pods: Pods,
}

#[derive(Debug)]
struct ChannelState {
    endpoints: Vec<EndpointState>,
    active: usize,
    cache: Option<CachedPods>,
}

#[derive(Debug, Default)]
struct DiscoveryCache {
    round: u64,
    // pubkey -> (round last seen, record)
    entries: HashMap<String, (u64, RawNodeRecord)>,
}

pub struct RpcChannel {
    config: ChannelConfig,
    source: Arc<dyn NodeSource>,
    state: Mutex<ChannelState>,
    inflight: Mutex<Option<SharedFetch>>,
    discovered: Mutex<DiscoveryCache>,
    hero_probe_running: AtomicBool,
}

impl RpcChannel {
    pub fn new(config: ChannelConfig, source: Arc<dyn NodeSource>) -> Arc<Self> {
        let endpoints = std::iter::once(config.hero.clone())
            .chain(config.backups.iter().cloned())
            .map(|url| EndpointState { url, failures: 0 })
            .collect();

        Arc::new(Self {
            config,
            source,
            state: Mutex::new(ChannelState {
                endpoints,
                active: HERO,
                cache: None,
            }),
            inflight: Mutex::new(None),
            discovered: Mutex::new(DiscoveryCache::default()),
            hero_probe_running: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current node list for this channel. Never fails: when every endpoint
    /// is down the last good result is returned, or an empty list if there
    /// never was one.
    pub async fn fetch_nodes(self: &Arc<Self>) -> Vec<RawNodeRecord> {
        let pods = match self.fresh_cache() {
            Some(pods) => pods,
            None => self.join_or_start().await,
        };
        self.with_discovered(&pods)
    }

    pub fn statuses(&self) -> Vec<EndpointStatus> {
        let state = self.state.lock();
        state
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, ep)| EndpointStatus {
                url: ep.url.clone(),
                is_hero: idx == HERO,
                failures: ep.failures,
                active: idx == state.active,
            })
            .collect()
    }

    pub fn active_endpoint(&self) -> String {
        let state = self.state.lock();
        state.endpoints[state.active].url.clone()
    }

    fn fresh_cache(&self) -> Option<Pods> {
        let state = self.state.lock();
        state
            .cache
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.config.freshness)
            .map(|cached| Arc::clone(&cached.pods))
    }

    /// At most one upstream fetch per channel is outstanding; concurrent
    /// callers share its result.
    fn join_or_start(self: &Arc<Self>) -> SharedFetch {
        let mut inflight = self.inflight.lock();
        if let Some(pending) = inflight.as_ref() {
            return pending.clone();
        }
        // a fetch may have finished between the freshness check and here
        if let Some(pods) = self.fresh_cache() {
            return futures::future::ready(pods).boxed().shared();
        }

        let this = Arc::clone(self);
        let pending = async move {
            let pods = Arc::clone(&this).fetch_uncached().await;
            this.inflight.lock().take();
            pods
        }
        .boxed()
        .shared();
        *inflight = Some(pending.clone());
        pending
    }

    async fn fetch_uncached(self: Arc<Self>) -> Pods {
        let active = self.state.lock().active;
        match self.call(active).await {
            Ok(pods) => return self.settle(active, pods),
            Err(err) => warn!(
                channel = %self.config.name,
                endpoint = %self.url_of(active),
                %err,
                "active endpoint failed, entering failover"
            ),
        }

        if self.config.race_width > 0 {
            let racers = self.pick_backups(self.config.race_width, &[active]);
            if !racers.is_empty() {
                let branches = racers.iter().map(|&idx| {
                    let this = &self;
                    async move { this.call(idx).await.map(|pods| (idx, pods)) }
                });
                match first_success(branches, self.config.call_timeout).await {
                    Ok((winner, pods)) => return self.settle(winner, pods),
                    Err(errors) => debug!(
                        channel = %self.config.name,
                        racers = racers.len(),
                        failures = errors.len(),
                        "backup race failed outright"
                    ),
                }
            }
        }

        for idx in self.failover_order(active) {
            if let Ok(pods) = self.call(idx).await {
                return self.settle(idx, pods);
            }
        }

        let stale = self.state.lock().cache.as_ref().map(|cached| Arc::clone(&cached.pods));
        warn!(
            channel = %self.config.name,
            stale = stale.as_ref().map_or(0, |pods| pods.len()),
            "all endpoints exhausted"
        );
        stale.unwrap_or_default()
    }

    /// One timed call against one endpoint, updating its failure counter.
    async fn call(&self, idx: usize) -> PulseResult<Vec<RawNodeRecord>> {
        let url = self.url_of(idx);
        let outcome = with_timeout(self.config.call_timeout, self.source.fetch_pods(&url)).await;

        let mut state = self.state.lock();
        let endpoint = &mut state.endpoints[idx];
        match &outcome {
            Ok(pods) => {
                endpoint.failures = 0;
                debug!(channel = %self.config.name, endpoint = %url, pods = pods.len(), "endpoint answered");
            }
            Err(err) => {
                endpoint.failures = endpoint.failures.saturating_add(1);
                debug!(
                    channel = %self.config.name,
                    endpoint = %url,
                    failures = endpoint.failures,
                    %err,
                    "endpoint call failed"
                );
            }
        }
        outcome
    }

    fn settle(self: &Arc<Self>, idx: usize, pods: Vec<RawNodeRecord>) -> Pods {
        let pods = Arc::new(pods);
        {
            let mut state = self.state.lock();
            if state.active != idx {
                info!(
                    channel = %self.config.name,
                    from = %state.endpoints[state.active].url,
                    to = %state.endpoints[idx].url,
                    "switched active endpoint"
                );
            }
            state.active = idx;
            state.cache = Some(CachedPods {
                fetched_at: Instant::now(),
                pods: Arc::clone(&pods),
            });
        }
        if idx != HERO {
            self.spawn_hero_probe();
        }
        pods
    }

    fn spawn_hero_probe(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.probe_hero().await;
        });
    }

    /// Tries the hero once and makes it active again if it answers.
    /// Returns whether the hero is now active. Overlapping probes collapse
    /// into one.
    pub async fn probe_hero(&self) -> bool {
        if self.hero_probe_running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let recovered = match self.call(HERO).await {
            Ok(pods) => {
                let mut state = self.state.lock();
                if state.active != HERO {
                    info!(channel = %self.config.name, hero = %state.endpoints[HERO].url, "hero endpoint recovered");
                }
                state.active = HERO;
                state.cache = Some(CachedPods {
                    fetched_at: Instant::now(),
                    pods: Arc::new(pods),
                });
                true
            }
            Err(_) => false,
        };
        self.hero_probe_running.store(false, Ordering::Release);
        recovered
    }

    /// Every endpoint except `failed`, fewest failures first. Ties keep
    /// table order, so the hero leads among equally healthy endpoints.
    fn failover_order(&self, failed: usize) -> Vec<usize> {
        let state = self.state.lock();
        let mut order: Vec<usize> = (0..state.endpoints.len()).filter(|&idx| idx != failed).collect();
        order.sort_by_key(|&idx| state.endpoints[idx].failures);
        order
    }

    fn pick_backups(&self, count: usize, exclude: &[usize]) -> Vec<usize> {
        let total = self.state.lock().endpoints.len();
        let candidates: Vec<usize> = (HERO + 1..total).filter(|idx| !exclude.contains(idx)).collect();
        candidates
            .choose_multiple(&mut rand::thread_rng(), count)
            .copied()
            .collect()
    }

    fn url_of(&self, idx: usize) -> String {
        self.state.lock().endpoints[idx].url.clone()
    }

    /// Primary result plus discovered nodes the primary does not know.
    fn with_discovered(&self, pods: &[RawNodeRecord]) -> Vec<RawNodeRecord> {
        let mut merged = pods.to_vec();
        let known: HashSet<&str> = pods.iter().map(|pod| pod.pubkey.as_str()).collect();
        let discovered = self.discovered.lock();
        let mut extra: Vec<&RawNodeRecord> = discovered
            .entries
            .values()
            .map(|(_, pod)| pod)
            .filter(|pod| !known.contains(pod.pubkey.as_str()))
            .collect();
        extra.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        merged.extend(extra.into_iter().cloned());
        merged
    }

    /// Polls a random sample of backups and records nodes missing from the
    /// primary result. Entries the primary now reports, or that went unseen
    /// for `DISCOVERY_RETENTION_ROUNDS` rounds, are dropped. Returns how many
    /// new keys were added.
    pub async fn discover_once(&self) -> usize {
        let picks = self.pick_backups(self.config.discovery_sample, &[]);
        if picks.is_empty() {
            return 0;
        }
        let outcomes = best_effort_all(picks.iter().map(|&idx| self.call(idx)), self.config.call_timeout).await;
        let answers: Vec<Vec<RawNodeRecord>> = outcomes.into_iter().filter_map(Result::ok).collect();
        // a round where no backup answered says nothing about departures
        if answers.is_empty() {
            return 0;
        }

        let primary: HashSet<String> = self
            .state
            .lock()
            .cache
            .as_ref()
            .map(|cached| cached.pods.iter().map(|pod| pod.pubkey.clone()).collect())
            .unwrap_or_default();

        let mut discovered = self.discovered.lock();
        discovered.round += 1;
        let round = discovered.round;
        let mut added = 0;
        for pod in answers.into_iter().flatten() {
            if primary.contains(&pod.pubkey) {
                continue;
            }
            if discovered.entries.insert(pod.pubkey.clone(), (round, pod)).is_none() {
                added += 1;
            }
        }

        let before = discovered.entries.len();
        discovered
            .entries
            .retain(|key, (seen, _)| !primary.contains(key) && round - *seen < DISCOVERY_RETENTION_ROUNDS);
        let dropped = before - discovered.entries.len();
        if dropped > 0 {
            debug!(channel = %self.config.name, dropped, "expired discovered nodes");
        }
        added
    }

    /// Background passive discovery loop. No-op for channels without
    /// backups.
    pub fn spawn_discovery(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        if self.config.backups.is_empty() || self.config.discovery_sample == 0 {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let added = this.discover_once().await;
                if added > 0 {
                    info!(channel = %this.config.name, added, "discovered nodes outside the primary view");
                }
            }
        }))
    }
}
