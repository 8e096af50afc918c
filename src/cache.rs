//! # Store-and-Forward Message Cache
//!
//! When a recipient is offline or unreachable, nearby nodes act as
//! guardians: they retain the message and periodically retry delivery
//! until it arrives or its TTL runs out.
//!
//! ## Strategies
//!
//! | Variant | Admission rule |
//! |---------|----------------|
//! | [`DistanceCache`] | cache when the recipient is in our buckets, or when the truncated XOR distance to it is within a threshold |
//! | [`ProbabilisticCache`] | the distance rule, plus a uniform draw against `cache_probability` for recipients outside our buckets |
//!
//! Both variants share the [`CacheStrategy`] capability set. The
//! probabilistic variant legitimately rejects `bulk_load` (its content
//! is not reproducible), returning [`Error::Unsupported`].
//!
//! ## Bounds and Ordering
//!
//! The cache keeps an explicit insertion/retry order next to the entry
//! map: the head of `order` is the first eviction victim when the cache
//! is full, and an entry whose re-delivery attempt fails moves to the
//! tail. The invariant `entries.keys() == set(order)` holds across every
//! operation.
//!
//! ## Delivery Seam
//!
//! `try_deliver` walks the cache with a [`DeliveryCourier`], the async
//! seam the node actor implements: locate and ping the recipient, then
//! hand the frame to its stream.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::Error;
use crate::id::{truncated_distance, NodeId};
use crate::messages::Envelope;

/// Default cache capacity in entries.
pub const DEFAULT_CACHE_SIZE: usize = 2000;

/// Default admission threshold on the 48-bit truncated XOR distance,
/// tuned for networks of roughly fifty peers.
pub const DEFAULT_DISTANCE_THRESHOLD: u64 = 1 << 45;

/// Default admission probability for the probabilistic variant.
pub const DEFAULT_CACHE_PROBABILITY: f64 = 0.7;

/// Default lifetime of a cached message.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// A message retained on behalf of an offline recipient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub sender: NodeId,
    pub recipient: NodeId,
    pub payload: Envelope,
    #[serde(rename = "insertedAt")]
    pub inserted_at: u64,
}

/// Result of an admission attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Newly cached under this id.
    Cached(Uuid),
    /// The id is already cached; no-op.
    Duplicate,
    /// The payload carries no id and cannot be tracked; no-op.
    MissingId,
    /// The recipient is too far for this node to be a useful guardian.
    TooFar,
    /// The probabilistic draw declined the entry.
    Unlucky,
}

/// Result of one replay pass over the cache.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub delivered: Vec<Uuid>,
    pub expired: Vec<Uuid>,
    /// The pass removed entries and left the cache empty.
    pub emptied: bool,
}

/// Async seam used by `try_deliver` to reach recipients.
#[async_trait]
pub trait DeliveryCourier: Send {
    /// Locate the recipient and confirm it is alive. Returns the node
    /// to hand the frame to.
    async fn find_and_ping(&mut self, recipient: &NodeId) -> Option<NodeId>;

    /// Hand the cached frame to `target`. Returns `true` on acceptance.
    async fn deliver(
        &mut self,
        target: &NodeId,
        sender: &NodeId,
        recipient: &NodeId,
        payload: &Envelope,
    ) -> bool;
}

/// Capability set shared by the cache variants.
#[async_trait]
pub trait CacheStrategy: Send {
    fn cache_message(
        &mut self,
        sender: NodeId,
        recipient: NodeId,
        payload: &Envelope,
        self_id: &NodeId,
        recipient_in_buckets: bool,
    ) -> CacheOutcome;

    async fn try_deliver(
        &mut self,
        courier: &mut (dyn DeliveryCourier + Send),
        max_ttl: Duration,
    ) -> ReplayReport;

    /// Entries in order, oldest first.
    fn snapshot(&self) -> Vec<(Uuid, CachedEntry)>;

    fn bulk_load(&mut self, entries: Vec<(Uuid, CachedEntry)>) -> Result<(), Error>;

    fn clear(&mut self);

    fn count(&self) -> usize;
}

/// Which strategy a node runs, from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategyKind {
    #[default]
    Distance,
    DistanceProbabilistic,
}

/// Build the configured strategy.
pub fn build_strategy(
    kind: CacheStrategyKind,
    max_size: usize,
    distance_threshold: u64,
    cache_probability: f64,
) -> Box<dyn CacheStrategy> {
    match kind {
        CacheStrategyKind::Distance => Box::new(DistanceCache::new(max_size, distance_threshold)),
        CacheStrategyKind::DistanceProbabilistic => Box::new(ProbabilisticCache::new(
            max_size,
            distance_threshold,
            cache_probability,
        )),
    }
}

/// Deterministic distance-bounded cache.
pub struct DistanceCache {
    entries: HashMap<Uuid, CachedEntry>,
    order: VecDeque<Uuid>,
    max_size: usize,
    distance_threshold: u64,
}

impl DistanceCache {
    pub fn new(max_size: usize, distance_threshold: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size,
            distance_threshold,
        }
    }

    /// Admission shared by both variants. `probability_gate` is the
    /// extra draw the probabilistic variant applies to recipients
    /// outside our buckets.
    fn admit(
        &mut self,
        sender: NodeId,
        recipient: NodeId,
        payload: &Envelope,
        self_id: &NodeId,
        recipient_in_buckets: bool,
        probability_gate: Option<f64>,
    ) -> CacheOutcome {
        let Some(id) = payload.id else {
            return CacheOutcome::MissingId;
        };
        if self.entries.contains_key(&id) {
            return CacheOutcome::Duplicate;
        }

        if !recipient_in_buckets {
            let distance = truncated_distance(&self_id.xor_distance(&recipient));
            if distance > self.distance_threshold {
                trace!(
                    recipient = hex::encode(&recipient.as_bytes()[..8]),
                    distance,
                    threshold = self.distance_threshold,
                    "not caching, recipient too far"
                );
                return CacheOutcome::TooFar;
            }
            if let Some(probability) = probability_gate
                && rand::thread_rng().r#gen::<f64>() > probability
            {
                return CacheOutcome::Unlucky;
            }
        }

        if self.entries.len() >= self.max_size
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
            debug!(evicted = %oldest, "cache full, evicted oldest entry");
        }

        self.entries.insert(
            id,
            CachedEntry {
                sender,
                recipient,
                payload: payload.clone(),
                inserted_at: crate::messages::now_millis(),
            },
        );
        self.order.push_back(id);
        CacheOutcome::Cached(id)
    }

    fn move_to_tail(&mut self, id: &Uuid) {
        if let Some(pos) = self.order.iter().position(|entry| entry == id) {
            self.order.remove(pos);
            self.order.push_back(*id);
        }
    }

    fn remove(&mut self, id: &Uuid) {
        self.entries.remove(id);
        if let Some(pos) = self.order.iter().position(|entry| entry == id) {
            self.order.remove(pos);
        }
    }

    async fn replay(
        &mut self,
        courier: &mut (dyn DeliveryCourier + Send),
        max_ttl: Duration,
    ) -> ReplayReport {
        let now = crate::messages::now_millis();
        let max_ttl_ms = max_ttl.as_millis() as u64;

        let mut report = ReplayReport::default();
        let pass: Vec<Uuid> = self.order.iter().copied().collect();

        for id in pass {
            let Some(entry) = self.entries.get(&id).cloned() else {
                continue;
            };

            // An entry aged exactly to the TTL is kept for one more
            // round; only strictly older entries expire.
            let timestamp = entry.payload.timestamp.unwrap_or(entry.inserted_at);
            if now.saturating_sub(timestamp) > max_ttl_ms {
                report.expired.push(id);
                continue;
            }

            match courier.find_and_ping(&entry.recipient).await {
                Some(target) => {
                    if courier
                        .deliver(&target, &entry.sender, &entry.recipient, &entry.payload)
                        .await
                    {
                        report.delivered.push(id);
                    } else {
                        self.move_to_tail(&id);
                    }
                }
                None => self.move_to_tail(&id),
            }
        }

        for id in report.delivered.iter().chain(report.expired.iter()) {
            self.remove(id);
        }
        report.emptied = (!report.delivered.is_empty() || !report.expired.is_empty())
            && self.entries.is_empty();
        report
    }

    fn snapshot_ordered(&self) -> Vec<(Uuid, CachedEntry)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| (*id, entry.clone())))
            .collect()
    }
}

#[async_trait]
impl CacheStrategy for DistanceCache {
    fn cache_message(
        &mut self,
        sender: NodeId,
        recipient: NodeId,
        payload: &Envelope,
        self_id: &NodeId,
        recipient_in_buckets: bool,
    ) -> CacheOutcome {
        self.admit(sender, recipient, payload, self_id, recipient_in_buckets, None)
    }

    async fn try_deliver(
        &mut self,
        courier: &mut (dyn DeliveryCourier + Send),
        max_ttl: Duration,
    ) -> ReplayReport {
        self.replay(courier, max_ttl).await
    }

    fn snapshot(&self) -> Vec<(Uuid, CachedEntry)> {
        self.snapshot_ordered()
    }

    fn bulk_load(&mut self, entries: Vec<(Uuid, CachedEntry)>) -> Result<(), Error> {
        for (id, entry) in entries {
            if self.entries.contains_key(&id) {
                continue;
            }
            if self.entries.len() >= self.max_size
                && let Some(oldest) = self.order.pop_front()
            {
                self.entries.remove(&oldest);
            }
            self.entries.insert(id, entry);
            self.order.push_back(id);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Distance-bounded cache that additionally coin-flips on admission for
/// recipients outside our buckets, spreading guardian duty across the
/// neighborhood.
pub struct ProbabilisticCache {
    inner: DistanceCache,
    cache_probability: f64,
}

impl ProbabilisticCache {
    pub fn new(max_size: usize, distance_threshold: u64, cache_probability: f64) -> Self {
        Self {
            inner: DistanceCache::new(max_size, distance_threshold),
            cache_probability: cache_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl CacheStrategy for ProbabilisticCache {
    fn cache_message(
        &mut self,
        sender: NodeId,
        recipient: NodeId,
        payload: &Envelope,
        self_id: &NodeId,
        recipient_in_buckets: bool,
    ) -> CacheOutcome {
        self.inner.admit(
            sender,
            recipient,
            payload,
            self_id,
            recipient_in_buckets,
            Some(self.cache_probability),
        )
    }

    async fn try_deliver(
        &mut self,
        courier: &mut (dyn DeliveryCourier + Send),
        max_ttl: Duration,
    ) -> ReplayReport {
        self.inner.replay(courier, max_ttl).await
    }

    fn snapshot(&self) -> Vec<(Uuid, CachedEntry)> {
        self.inner.snapshot_ordered()
    }

    fn bulk_load(&mut self, _entries: Vec<(Uuid, CachedEntry)>) -> Result<(), Error> {
        Err(Error::Unsupported("bulk_load"))
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    fn count(&self) -> usize {
        self.inner.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(index: u8) -> NodeId {
        let mut bytes = [0u8; crate::id::ID_LEN];
        bytes[crate::id::ID_LEN - 1] = index;
        NodeId::from_bytes(bytes)
    }

    /// A node id whose truncated distance to `node(0)` is 2^46, past
    /// the default threshold of 2^45.
    fn far_node() -> NodeId {
        let mut bytes = [0u8; crate::id::ID_LEN];
        bytes[0] = 0x40;
        NodeId::from_bytes(bytes)
    }

    fn payload(tag: u8) -> Envelope {
        let mut env = Envelope::chat(node(tag));
        env.extra
            .insert("body".into(), serde_json::Value::from(format!("m{tag}")));
        env
    }

    struct ScriptedCourier {
        live: HashMap<NodeId, NodeId>,
        accept: bool,
        delivered: Vec<Uuid>,
    }

    impl ScriptedCourier {
        fn new() -> Self {
            Self {
                live: HashMap::new(),
                accept: true,
                delivered: Vec::new(),
            }
        }

        fn online(mut self, recipient: NodeId) -> Self {
            self.live.insert(recipient, recipient);
            self
        }

        fn rejecting(mut self) -> Self {
            self.accept = false;
            self
        }
    }

    #[async_trait]
    impl DeliveryCourier for ScriptedCourier {
        async fn find_and_ping(&mut self, recipient: &NodeId) -> Option<NodeId> {
            self.live.get(recipient).copied()
        }

        async fn deliver(
            &mut self,
            _target: &NodeId,
            _sender: &NodeId,
            _recipient: &NodeId,
            payload: &Envelope,
        ) -> bool {
            if self.accept {
                self.delivered.push(payload.id.unwrap());
            }
            self.accept
        }
    }

    #[test]
    fn lru_eviction_drops_the_oldest() {
        let mut cache = DistanceCache::new(3, DEFAULT_DISTANCE_THRESHOLD);
        let envs: Vec<Envelope> = (1..=4).map(payload).collect();
        for env in &envs {
            assert!(matches!(
                cache.cache_message(node(9), node(5), env, &node(0), true),
                CacheOutcome::Cached(_)
            ));
        }

        assert_eq!(cache.count(), 3);
        let order: Vec<Uuid> = cache.snapshot().into_iter().map(|(id, _)| id).collect();
        let expected: Vec<Uuid> = envs[1..].iter().map(|e| e.id.unwrap()).collect();
        assert_eq!(order, expected, "m1 evicted, order is [m2, m3, m4]");
    }

    #[test]
    fn distance_bounds_admission_for_unknown_recipients() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        let env = payload(1);

        assert_eq!(
            cache.cache_message(node(9), far_node(), &env, &node(0), false),
            CacheOutcome::TooFar
        );
        assert_eq!(cache.count(), 0);

        // The same recipient is admitted when it sits in our buckets.
        assert!(matches!(
            cache.cache_message(node(9), far_node(), &env, &node(0), true),
            CacheOutcome::Cached(_)
        ));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn missing_and_duplicate_ids_are_no_ops() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);

        let mut anonymous = payload(1);
        anonymous.id = None;
        assert_eq!(
            cache.cache_message(node(9), node(5), &anonymous, &node(0), true),
            CacheOutcome::MissingId
        );

        let env = payload(2);
        assert!(matches!(
            cache.cache_message(node(9), node(5), &env, &node(0), true),
            CacheOutcome::Cached(_)
        ));
        assert_eq!(
            cache.cache_message(node(9), node(5), &env, &node(0), true),
            CacheOutcome::Duplicate
        );
        assert_eq!(cache.count(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_removed_and_emptied_is_reported() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        let ttl = Duration::from_secs(60);

        let mut stale = payload(1);
        stale.timestamp = Some(crate::messages::now_millis() - 120_000);
        cache.cache_message(node(9), node(5), &stale, &node(0), true);

        let mut courier = ScriptedCourier::new();
        let report = cache.try_deliver(&mut courier, ttl).await;

        assert_eq!(report.expired, vec![stale.id.unwrap()]);
        assert!(report.emptied);
        assert_eq!(cache.count(), 0);

        // A pass over the now-empty cache does not report emptied again.
        let report = cache.try_deliver(&mut courier, ttl).await;
        assert!(!report.emptied);
    }

    #[tokio::test]
    async fn entries_at_exactly_the_ttl_are_kept() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        // A generous margin below the TTL: ageing during the test run
        // must not tip the entry over the boundary.
        let ttl = Duration::from_secs(3600);
        let mut fresh = payload(1);
        fresh.timestamp = Some(crate::messages::now_millis() - 3_500_000);
        cache.cache_message(node(9), node(5), &fresh, &node(0), true);

        let mut courier = ScriptedCourier::new();
        let report = cache.try_deliver(&mut courier, ttl).await;

        assert!(report.expired.is_empty());
        assert_eq!(cache.count(), 1);
    }

    #[tokio::test]
    async fn successful_replay_removes_the_entry() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        let env = payload(1);
        cache.cache_message(node(9), node(5), &env, &node(0), true);

        let mut courier = ScriptedCourier::new().online(node(5));
        let report = cache.try_deliver(&mut courier, DEFAULT_MAX_TTL).await;

        assert_eq!(report.delivered, vec![env.id.unwrap()]);
        assert!(report.emptied);
        assert_eq!(courier.delivered, vec![env.id.unwrap()]);
        assert_eq!(cache.count(), 0);
    }

    #[tokio::test]
    async fn failed_replay_keeps_entries_for_retry() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        let first = payload(1);
        let second = payload(2);
        cache.cache_message(node(9), node(5), &first, &node(0), true);
        cache.cache_message(node(9), node(6), &second, &node(0), true);

        // Recipient of `first` is reachable but rejects the frame;
        // recipient of `second` stays unknown. Each failure moves its
        // entry to the tail in turn, so both survive in their relative
        // order, ready for the next pass.
        let mut courier = ScriptedCourier::new().online(node(5)).rejecting();
        let report = cache.try_deliver(&mut courier, DEFAULT_MAX_TTL).await;

        assert!(report.delivered.is_empty());
        assert!(!report.emptied);
        assert_eq!(cache.count(), 2);
        let order: Vec<Uuid> = cache.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![first.id.unwrap(), second.id.unwrap()]);
    }

    #[tokio::test]
    async fn partial_delivery_moves_failures_behind_survivors() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        let stuck = payload(1);
        let lucky = payload(2);
        cache.cache_message(node(9), node(5), &stuck, &node(0), true);
        cache.cache_message(node(9), node(6), &lucky, &node(0), true);

        // Only `lucky`'s recipient is online and accepting.
        let mut courier = ScriptedCourier::new().online(node(6));
        let report = cache.try_deliver(&mut courier, DEFAULT_MAX_TTL).await;

        assert_eq!(report.delivered, vec![lucky.id.unwrap()]);
        assert!(!report.emptied);
        assert_eq!(cache.count(), 1);
        let order: Vec<Uuid> = cache.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![stuck.id.unwrap()]);
    }

    #[test]
    fn snapshot_bulk_load_round_trips() {
        let mut cache = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        for tag in 1..=3 {
            cache.cache_message(node(9), node(5), &payload(tag), &node(0), true);
        }
        let snapshot = cache.snapshot();

        let mut restored = DistanceCache::new(10, DEFAULT_DISTANCE_THRESHOLD);
        restored.bulk_load(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn probabilistic_variant_rejects_bulk_load() {
        let mut cache = ProbabilisticCache::new(10, DEFAULT_DISTANCE_THRESHOLD, 0.7);
        assert!(matches!(
            cache.bulk_load(Vec::new()),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn probability_zero_declines_unknown_recipients_only() {
        let mut cache = ProbabilisticCache::new(10, DEFAULT_DISTANCE_THRESHOLD, 0.0);

        assert_eq!(
            cache.cache_message(node(9), node(5), &payload(1), &node(0), false),
            CacheOutcome::Unlucky
        );

        // Recipients in our buckets bypass the draw.
        assert!(matches!(
            cache.cache_message(node(9), node(5), &payload(2), &node(0), true),
            CacheOutcome::Cached(_)
        ));
    }

    #[test]
    fn probability_one_always_admits() {
        let mut cache = ProbabilisticCache::new(10, DEFAULT_DISTANCE_THRESHOLD, 1.0);
        assert!(matches!(
            cache.cache_message(node(9), node(5), &payload(1), &node(0), false),
            CacheOutcome::Cached(_)
        ));
    }
}
