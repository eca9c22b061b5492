//! Kademlia-style routing table for node discovery.
//!
//! Buckets are laid out by depth. Bucket `d` (for every bucket but the last)
//! holds entries whose distance to the local node has its first set bit at
//! position `d`; the last bucket holds every entry whose first `d` bits are all
//! clear, the range that contains the local node itself. When the last bucket
//! overflows it splits on its depth bit: entries with that bit set stay, the
//! others move to a new, deeper last bucket. Any other full bucket can only
//! make room by evicting an entry that fails the liveness probe.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_common::crypto::{Hash, NodeId};
use kestrel_common::tokio::sync::RwLock;
use log::{debug, trace};

use super::identity::{compare_distance, is_bit_set, xor_distance, DISTANCE_BITS};

/// Number of entries per bucket (Kademlia k parameter).
pub const BUCKET_SIZE: usize = 16;

/// Deepest bucket index; the bucket at this depth never splits.
pub const MAX_DEPTH: usize = DISTANCE_BITS - 1;

/// Decides whether an existing entry is still alive before it gets evicted.
///
/// Called without holding the table lock, so implementations may perform
/// network I/O.
#[async_trait]
pub trait LivenessProbe<T>: Send + Sync {
    async fn is_alive(&self, id: &NodeId, payload: &T) -> bool;
}

/// Probe that treats every entry as alive: full buckets never evict.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

#[async_trait]
impl<T: Sync> LivenessProbe<T> for AlwaysAlive {
    async fn is_alive(&self, _id: &NodeId, _payload: &T) -> bool {
        true
    }
}

/// Entry in a bucket.
#[derive(Debug, Clone)]
pub struct RoutingEntry<T> {
    id: NodeId,
    distance: Hash,
    payload: T,
}

impl<T> RoutingEntry<T> {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Distance to the local node.
    pub fn distance(&self) -> &Hash {
        &self.distance
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

type Buckets<T> = Vec<Vec<RoutingEntry<T>>>;

/// Outcome of an insertion attempt under the lock.
enum Placement<T> {
    Inserted,
    Duplicate,
    /// Bucket is full and cannot split: candidates for eviction, most
    /// recently added first.
    Full(Vec<RoutingEntry<T>>),
}

/// Kademlia-style routing table keyed by XOR distance.
pub struct RoutingTable<T> {
    local_id: NodeId,
    local_hash: Hash,
    buckets: RwLock<Buckets<T>>,
    probe: Arc<dyn LivenessProbe<T>>,
}

impl<T: Clone + Send + Sync + 'static> RoutingTable<T> {
    /// Create a table whose entries are never considered dead.
    pub fn new(local_id: NodeId) -> Self {
        Self::with_probe(local_id, Arc::new(AlwaysAlive))
    }

    pub fn with_probe(local_id: NodeId, probe: Arc<dyn LivenessProbe<T>>) -> Self {
        Self {
            local_id,
            local_hash: local_id.hash(),
            buckets: RwLock::new(vec![Vec::with_capacity(BUCKET_SIZE)]),
            probe,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    fn distance_to(&self, id: &NodeId) -> Hash {
        xor_distance(&self.local_hash, &id.hash())
    }

    /// Bucket an entry with this distance routes to.
    fn bucket_index(buckets: &Buckets<T>, distance: &Hash) -> usize {
        let last = buckets.len() - 1;
        (0..last)
            .find(|depth| is_bit_set(distance, *depth))
            .unwrap_or(last)
    }

    fn find(buckets: &Buckets<T>, id: &NodeId) -> Option<(usize, usize)> {
        buckets.iter().enumerate().find_map(|(b, bucket)| {
            bucket
                .iter()
                .position(|entry| entry.id == *id)
                .map(|position| (b, position))
        })
    }

    /// Insert, splitting the last bucket as long as that makes room.
    fn place(buckets: &mut Buckets<T>, entry: RoutingEntry<T>) -> Placement<T> {
        if Self::find(buckets, &entry.id).is_some() {
            return Placement::Duplicate;
        }

        loop {
            let index = Self::bucket_index(buckets, &entry.distance);
            let last = buckets.len() - 1;

            if buckets[index].len() < BUCKET_SIZE {
                buckets[index].push(entry);
                return Placement::Inserted;
            }

            if index == last && last < MAX_DEPTH {
                let (stay, moved): (Vec<_>, Vec<_>) = buckets[last]
                    .drain(..)
                    .partition(|e| is_bit_set(&e.distance, last));
                buckets[last] = stay;
                buckets.push(moved);

                if log::log_enabled!(log::Level::Trace) {
                    trace!(
                        "Split bucket {} ({} stay, {} moved)",
                        last,
                        buckets[last].len(),
                        buckets[last + 1].len()
                    );
                }
                // Same entry, re-routed against the new layout
                continue;
            }

            let candidates = buckets[index].iter().rev().cloned().collect();
            return Placement::Full(candidates);
        }
    }

    /// Add an identity with its payload.
    ///
    /// Returns `false` when the identity is the local one or already present,
    /// and when its bucket is full of entries the liveness probe reports
    /// alive. A full bucket is probed from the most recently added entry
    /// backward; the first dead entry is replaced.
    pub async fn add(&self, id: NodeId, payload: T) -> bool {
        if id == self.local_id {
            return false;
        }

        let entry = RoutingEntry {
            id,
            distance: self.distance_to(&id),
            payload,
        };

        let candidates = {
            let mut buckets = self.buckets.write().await;
            match Self::place(&mut buckets, entry.clone()) {
                Placement::Inserted => return true,
                Placement::Duplicate => return false,
                Placement::Full(candidates) => candidates,
            }
        };

        // Probe outside of the lock
        let mut dead = None;
        for candidate in &candidates {
            if !self.probe.is_alive(&candidate.id, &candidate.payload).await {
                dead = Some(candidate.id);
                break;
            }
        }

        let Some(dead) = dead else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Bucket full of live entries, rejecting {:?}", id);
            }
            return false;
        };

        let mut buckets = self.buckets.write().await;
        if let Some((b, position)) = Self::find(&buckets, &dead) {
            buckets[b].remove(position);
            if log::log_enabled!(log::Level::Debug) {
                debug!("Evicted dead entry {:?} for {:?}", dead, id);
            }
        }
        // The table may have changed while probing: no second probe round
        matches!(Self::place(&mut buckets, entry), Placement::Inserted)
    }

    /// Payload stored for an identity.
    pub async fn get(&self, id: &NodeId) -> Option<T> {
        let buckets = self.buckets.read().await;
        Self::find(&buckets, id).map(|(b, position)| buckets[b][position].payload.clone())
    }

    pub async fn exists(&self, id: &NodeId) -> bool {
        let buckets = self.buckets.read().await;
        Self::find(&buckets, id).is_some()
    }

    /// Remove an identity, returning its payload.
    pub async fn remove(&self, id: &NodeId) -> Option<T> {
        let mut buckets = self.buckets.write().await;
        let (b, position) = Self::find(&buckets, id)?;
        Some(buckets[b].remove(position).payload)
    }

    /// Up to `count` entries passing `filter`, sorted by ascending distance
    /// to `target` (a hashed identity; the local node by default).
    ///
    /// Equal distances keep table order.
    pub async fn closest<F>(&self, count: usize, filter: F, target: Option<&Hash>) -> Vec<RoutingEntry<T>>
    where
        F: Fn(&T) -> bool,
    {
        let target = target.copied().unwrap_or(self.local_hash);
        let mut candidates: Vec<(Hash, RoutingEntry<T>)> = {
            let buckets = self.buckets.read().await;
            buckets
                .iter()
                .flatten()
                .filter(|entry| filter(&entry.payload))
                .map(|entry| (entry.id.hash(), entry.clone()))
                .collect()
        };

        sort_by_distance(&mut candidates, &target);
        candidates
            .into_iter()
            .take(count)
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Total number of entries.
    pub async fn size(&self) -> usize {
        let buckets = self.buckets.read().await;
        buckets.iter().map(Vec::len).sum()
    }

    /// All entries, shallowest bucket first.
    pub async fn list(&self) -> Vec<RoutingEntry<T>> {
        let buckets = self.buckets.read().await;
        buckets.iter().flatten().cloned().collect()
    }

    /// `(depth, entries)` for every non-empty bucket.
    pub async fn bucket_stats(&self) -> Vec<(usize, usize)> {
        let buckets = self.buckets.read().await;
        buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(depth, bucket)| (depth, bucket.len()))
            .collect()
    }

    /// Number of buckets, including empty ones.
    pub async fn depth(&self) -> usize {
        self.buckets.read().await.len()
    }
}

/// Sort `(hash, item)` pairs by ascending distance of `hash` to `target`.
/// Items at equal distance keep their relative order.
fn sort_by_distance<E>(candidates: &mut [(Hash, E)], target: &Hash) {
    candidates.sort_by(|(a, _), (b, _)| compare_distance(target, a, b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use kestrel_common::crypto::HASH_SIZE;

    fn random_id() -> NodeId {
        let mut bytes = [0u8; 64];
        for chunk in bytes.chunks_mut(32) {
            chunk.copy_from_slice(&rand::random::<[u8; 32]>());
        }
        NodeId::new(bytes)
    }

    /// Random identity whose distance to `local` has bit 0 set or clear.
    fn id_with_first_bit(local: &NodeId, set: bool) -> NodeId {
        let local_hash = local.hash();
        loop {
            let id = random_id();
            if is_bit_set(&xor_distance(&local_hash, &id.hash()), 0) == set {
                return id;
            }
        }
    }

    /// Reports the listed identities as dead and records probe order.
    struct ScriptedProbe {
        dead: HashSet<NodeId>,
        probed: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl LivenessProbe<u32> for ScriptedProbe {
        async fn is_alive(&self, id: &NodeId, _payload: &u32) -> bool {
            self.probed.lock().unwrap().push(*id);
            !self.dead.contains(id)
        }
    }

    #[tokio::test]
    async fn test_new_routing_table() {
        let table: RoutingTable<u32> = RoutingTable::new(random_id());
        assert_eq!(table.size().await, 0);
        assert!(table.list().await.is_empty());
        assert_eq!(table.depth().await, 1);
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let table = RoutingTable::new(random_id());
        let id = random_id();

        assert!(table.add(id, 7u32).await);
        assert!(table.exists(&id).await);
        assert_eq!(table.get(&id).await, Some(7));
        assert_eq!(table.size().await, 1);

        assert_eq!(table.remove(&id).await, Some(7));
        assert!(!table.exists(&id).await);
        assert_eq!(table.remove(&id).await, None);
        assert_eq!(table.size().await, 0);
    }

    #[tokio::test]
    async fn test_add_self_and_duplicate_rejected() {
        let local = random_id();
        let table = RoutingTable::new(local);
        assert!(!table.add(local, 1u32).await);

        let id = random_id();
        assert!(table.add(id, 1u32).await);
        assert!(!table.add(id, 2u32).await);
        assert_eq!(table.get(&id).await, Some(1));
    }

    #[tokio::test]
    async fn test_full_shallow_bucket_rejects_when_all_alive() {
        let local = random_id();
        let table = RoutingTable::new(local);

        for i in 0..BUCKET_SIZE {
            assert!(table.add(id_with_first_bit(&local, true), i as u32).await);
        }
        assert_eq!(table.size().await, BUCKET_SIZE);

        // The full bucket is the deepest one: it splits instead of rejecting
        assert!(table.add(id_with_first_bit(&local, false), 100).await);
        assert_eq!(table.size().await, BUCKET_SIZE + 1);
        assert_eq!(table.depth().await, 2);

        // Bucket 0 is no longer the deepest and every entry is alive
        assert!(!table.add(id_with_first_bit(&local, true), 101).await);
        assert_eq!(table.size().await, BUCKET_SIZE + 1);
    }

    #[tokio::test]
    async fn test_split_keeps_every_entry() {
        let local = random_id();
        let table = RoutingTable::new(local);

        let mut ids = Vec::new();
        for i in 0..BUCKET_SIZE * 3 {
            let id = random_id();
            if table.add(id, i as u32).await {
                ids.push(id);
            }
        }

        assert_eq!(table.size().await, ids.len());
        for id in &ids {
            assert!(table.exists(id).await);
        }
        for (_, len) in table.bucket_stats().await {
            assert!(len <= BUCKET_SIZE);
        }
    }

    #[tokio::test]
    async fn test_eviction_probes_most_recent_first() {
        let local = random_id();
        let shallow: Vec<NodeId> = (0..BUCKET_SIZE)
            .map(|_| id_with_first_bit(&local, true))
            .collect();

        // Second most recent entry is dead
        let dead = shallow[BUCKET_SIZE - 2];
        let probe = Arc::new(ScriptedProbe {
            dead: HashSet::from([dead]),
            probed: Mutex::new(Vec::new()),
        });
        let table: RoutingTable<u32> = RoutingTable::with_probe(local, probe.clone());

        for (i, id) in shallow.iter().enumerate() {
            assert!(table.add(*id, i as u32).await);
        }
        // Force bucket 0 to stop being the deepest bucket
        assert!(table.add(id_with_first_bit(&local, false), 99).await);

        let newcomer = id_with_first_bit(&local, true);
        assert!(table.add(newcomer, 100).await);

        assert!(!table.exists(&dead).await);
        assert!(table.exists(&newcomer).await);
        assert_eq!(table.size().await, BUCKET_SIZE + 1);

        let probed = probe.probed.lock().unwrap().clone();
        assert_eq!(probed, vec![shallow[BUCKET_SIZE - 1], dead]);
    }

    #[tokio::test]
    async fn test_closest_sorted_by_distance() {
        let local = random_id();
        let table = RoutingTable::new(local);
        for i in 0..20u32 {
            table.add(random_id(), i).await;
        }

        let closest = table.closest(5, |_| true, None).await;
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(pair[0].distance() <= pair[1].distance());
        }

        let target = random_id().hash();
        let closest = table.closest(usize::MAX, |_| true, Some(&target)).await;
        assert_eq!(closest.len(), table.size().await);
        for pair in closest.windows(2) {
            assert!(
                xor_distance(&target, &pair[0].id().hash())
                    <= xor_distance(&target, &pair[1].id().hash())
            );
        }
    }

    #[test]
    fn test_equal_distances_keep_insertion_order() {
        let target = Hash::zero();
        let mut near = [0u8; HASH_SIZE];
        near[HASH_SIZE - 1] = 1;
        let mut far = [0u8; HASH_SIZE];
        far[0] = 1;
        let (near, far) = (Hash::new(near), Hash::new(far));

        let mut candidates = vec![
            (far, "far-1"),
            (near, "near-1"),
            (near, "near-2"),
            (far, "far-2"),
            (near, "near-3"),
            (target, "exact"),
            (near, "near-4"),
        ];
        sort_by_distance(&mut candidates, &target);

        let order: Vec<&str> = candidates.iter().map(|(_, name)| *name).collect();
        assert_eq!(
            order,
            vec!["exact", "near-1", "near-2", "near-3", "near-4", "far-1", "far-2"]
        );
    }

    #[tokio::test]
    async fn test_closest_applies_filter() {
        let table = RoutingTable::new(random_id());
        for i in 0..10u32 {
            table.add(random_id(), i).await;
        }

        let even = table.closest(16, |payload| payload % 2 == 0, None).await;
        assert_eq!(even.len(), 5);
        assert!(even.iter().all(|entry| entry.payload() % 2 == 0));
    }
}
