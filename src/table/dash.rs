//! Segmented extendible hash table.
//!
//! The table is a directory of fixed-capacity segments. A key hashes to a
//! directory entry via its top bits and to a bucket within the segment via
//! its low bits. Each lookup probes the home bucket, its neighbor, and the
//! segment's stash buckets. A full probe path triggers, in order: garbage
//! collection, a segment split, or an eviction, all driven by the policy
//! capabilities passed into the insert primitive.
//!
//! Positions (`Pos`) are invalidated by any insert or erase anywhere in the
//! table; in-place value mutation keeps them valid. Every bucket carries a
//! version drawn from a shared monotonic clock; splits, inserts and erases
//! advance the versions of the buckets they touch.

use super::key::PrimeKey;
use std::cell::Cell;
use std::hash::Hasher;
use std::rc::Rc;
use twox_hash::XxHash64;

/// Slots in one bucket.
pub const SLOTS_PER_BUCKET: usize = 12;
/// Buckets addressed directly by the key hash.
pub const REGULAR_BUCKETS: usize = 56;
/// Overflow buckets at the segment tail, filled last.
pub const STASH_BUCKETS: usize = 4;
/// All buckets of one segment.
pub const TOTAL_BUCKETS: usize = REGULAR_BUCKETS + STASH_BUCKETS;
/// Entry capacity of one segment.
pub const SEGMENT_CAPACITY: usize = TOTAL_BUCKETS * SLOTS_PER_BUCKET;

const MAX_DEPTH: u8 = 32;

/// Monotonic version source shared between a slice and its tables.
///
/// Single-threaded by design; the owning shard worker is the only accessor.
#[derive(Clone, Debug, Default)]
pub struct VersionClock(Rc<Cell<u64>>);

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock and return the new value.
    pub fn next(&self) -> u64 {
        let v = self.0.get() + 1;
        self.0.set(v);
        v
    }

    pub fn current(&self) -> u64 {
        self.0.get()
    }
}

/// Location of an entry: segment, bucket within segment, slot within bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pos {
    pub segment: u32,
    pub bucket: u8,
    pub slot: u8,
}

impl Pos {
    /// Position of the first slot of the same bucket.
    pub fn bucket_head(self) -> Pos {
        Pos { slot: 0, ..self }
    }

    pub fn is_stash(self) -> bool {
        self.bucket as usize >= REGULAR_BUCKETS
    }
}

/// Resumable traversal cursor over (segment, bucket) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor(Option<(u32, u8)>);

impl Cursor {
    pub fn start() -> Self {
        Cursor(Some((0, 0)))
    }

    pub fn is_done(self) -> bool {
        self.0.is_none()
    }
}

/// The probe path of one key, handed to policy hooks when it is full.
#[derive(Debug, Clone, Copy)]
pub struct Hotspot {
    pub key_hash: u64,
    pub segment: u32,
    /// Home bucket and its neighbor.
    pub regular: [u8; 2],
    /// All stash buckets of the segment, in index order.
    pub stash: [u8; STASH_BUCKETS],
}

/// Capability set a caller passes into the insert primitive.
///
/// The default implementations make a policy that always grows and never
/// reclaims, which is what the parallel expire/mcflag tables use.
pub trait InsertPolicy<V> {
    /// May the table allocate another segment?
    fn can_grow(&mut self, table: &DashTable<V>) -> bool {
        let _ = table;
        true
    }

    /// A segment was split on behalf of this insertion.
    fn record_split(&mut self) {}

    /// Reclaim expired entries around the hotspot. Returns entries removed.
    fn garbage_collect(&mut self, hotspot: &Hotspot, table: &mut DashTable<V>) -> u32 {
        let _ = (hotspot, table);
        0
    }

    /// Forcibly remove an entry around the hotspot. Returns entries removed.
    fn evict(&mut self, hotspot: &Hotspot, table: &mut DashTable<V>) -> u32 {
        let _ = (hotspot, table);
        0
    }
}

/// Policy for tables that always grow (expire, mcflag).
#[derive(Debug, Default)]
pub struct NoopInsertPolicy;

impl<V> InsertPolicy<V> for NoopInsertPolicy {}

/// Decides whether an entry may be displaced to a worse slot so a hotter one
/// can take its place.
pub trait BumpPolicy {
    fn can_bump_down(&self, key: &PrimeKey) -> bool;
}

/// Insertion failed and the policy could not make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    Full,
}

struct Bucket<V> {
    version: u64,
    slots: Box<[Option<(PrimeKey, V)>]>,
}

impl<V> Bucket<V> {
    fn new() -> Self {
        let slots = (0..SLOTS_PER_BUCKET).map(|_| None).collect();
        Self { version: 0, slots }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

struct Segment<V> {
    local_depth: u8,
    buckets: Vec<Bucket<V>>,
}

impl<V> Segment<V> {
    fn new(local_depth: u8) -> Self {
        Self {
            local_depth,
            buckets: (0..TOTAL_BUCKETS).map(|_| Bucket::new()).collect(),
        }
    }
}

/// The table itself. See the module docs for the structural overview.
pub struct DashTable<V> {
    clock: VersionClock,
    global_depth: u8,
    directory: Vec<u32>,
    segments: Vec<Segment<V>>,
    len: usize,
    stash_unloaded: u64,
}

/// The hash function shared by every table and fingerprint user.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

impl<V> DashTable<V> {
    /// Create a table with a private version clock.
    pub fn new() -> Self {
        Self::with_clock(VersionClock::new())
    }

    /// Create a table stamping bucket versions from the given clock.
    pub fn with_clock(clock: VersionClock) -> Self {
        Self {
            clock,
            global_depth: 0,
            directory: vec![0],
            segments: vec![Segment::new(0)],
            len: 0,
            stash_unloaded: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.segments.len() * SEGMENT_CAPACITY
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.segments.len() * TOTAL_BUCKETS
    }

    /// Entries moved from stash to regular buckets by bump-ups.
    pub fn stash_unloaded(&self) -> u64 {
        self.stash_unloaded
    }

    /// Approximate byte footprint of one segment.
    pub fn seg_bytes() -> usize {
        TOTAL_BUCKETS
            * (std::mem::size_of::<Bucket<V>>()
                + SLOTS_PER_BUCKET * std::mem::size_of::<Option<(PrimeKey, V)>>())
    }

    /// Approximate byte footprint of the table structure (not the values).
    pub fn mem_usage(&self) -> usize {
        self.segments.len() * Self::seg_bytes() + self.directory.len() * 4
    }

    fn dir_index(&self, hash: u64) -> usize {
        if self.global_depth == 0 {
            0
        } else {
            (hash >> (64 - self.global_depth)) as usize
        }
    }

    fn segment_id_for(&self, hash: u64) -> u32 {
        self.directory[self.dir_index(hash)]
    }

    fn home_buckets(hash: u64) -> (u8, u8) {
        let b1 = (hash % REGULAR_BUCKETS as u64) as u8;
        let b2 = (b1 + 1) % REGULAR_BUCKETS as u8;
        (b1, b2)
    }

    fn probe_order(hash: u64) -> [u8; 2 + STASH_BUCKETS] {
        let (b1, b2) = Self::home_buckets(hash);
        let s = (hash % STASH_BUCKETS as u64) as u8;
        let mut order = [0u8; 2 + STASH_BUCKETS];
        order[0] = b1;
        order[1] = b2;
        for i in 0..STASH_BUCKETS {
            order[2 + i] = REGULAR_BUCKETS as u8 + ((s as usize + i) % STASH_BUCKETS) as u8;
        }
        order
    }

    /// The probe path of a key, for policy hooks.
    pub fn hotspot(&self, key: &[u8]) -> Hotspot {
        let hash = hash_key(key);
        let (b1, b2) = Self::home_buckets(hash);
        let mut stash = [0u8; STASH_BUCKETS];
        for (i, s) in stash.iter_mut().enumerate() {
            *s = (REGULAR_BUCKETS + i) as u8;
        }
        Hotspot {
            key_hash: hash,
            segment: self.segment_id_for(hash),
            regular: [b1, b2],
            stash,
        }
    }

    /// Locate a key. Positions stay valid until the next insert or erase.
    pub fn find(&self, key: &[u8]) -> Option<Pos> {
        let hash = hash_key(key);
        let seg_id = self.segment_id_for(hash);
        let seg = &self.segments[seg_id as usize];
        for &bucket in Self::probe_order(hash).iter() {
            let b = &seg.buckets[bucket as usize];
            for (slot, entry) in b.slots.iter().enumerate() {
                if let Some((k, _)) = entry {
                    if k.as_bytes() == key {
                        return Some(Pos {
                            segment: seg_id,
                            bucket,
                            slot: slot as u8,
                        });
                    }
                }
            }
        }
        None
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Insert a key known to be absent, consulting the policy when the probe
    /// path is full.
    pub fn insert_new<P: InsertPolicy<V>>(
        &mut self,
        key: PrimeKey,
        value: V,
        policy: &mut P,
    ) -> Result<Pos, InsertError> {
        debug_assert!(self.find(key.as_bytes()).is_none());
        let hash = hash_key(key.as_bytes());

        // Bounded so a policy that reports progress it did not make cannot
        // spin us forever.
        for _ in 0..64 {
            if let Some(pos) = self.try_place(hash, &key) {
                let seg = &mut self.segments[pos.segment as usize];
                let bucket = &mut seg.buckets[pos.bucket as usize];
                bucket.slots[pos.slot as usize] = Some((key, value));
                bucket.version = self.clock.next();
                self.len += 1;
                return Ok(pos);
            }

            let hotspot = self.hotspot(key.as_bytes());
            if policy.garbage_collect(&hotspot, self) > 0 {
                continue;
            }
            if policy.can_grow(self) {
                if self.global_depth >= MAX_DEPTH {
                    return Err(InsertError::Full);
                }
                self.split(self.segment_id_for(hash));
                policy.record_split();
                continue;
            }
            if policy.evict(&hotspot, self) > 0 {
                continue;
            }
            return Err(InsertError::Full);
        }
        Err(InsertError::Full)
    }

    /// Insert with the always-grow policy (expire/mcflag tables).
    pub fn insert_simple(&mut self, key: PrimeKey, value: V) -> Pos {
        self.insert_new(key, value, &mut NoopInsertPolicy)
            .expect("grow-always insert cannot fail below max depth")
    }

    /// Insert or overwrite; returns true when a new entry was created.
    pub fn upsert(&mut self, key: PrimeKey, value: V) -> bool {
        match self.find(key.as_bytes()) {
            Some(pos) => {
                *self.value_mut_at(pos).expect("found position") = value;
                false
            }
            None => {
                self.insert_simple(key, value);
                true
            }
        }
    }

    fn try_place(&self, hash: u64, _key: &PrimeKey) -> Option<Pos> {
        let seg_id = self.segment_id_for(hash);
        let seg = &self.segments[seg_id as usize];
        for &bucket in Self::probe_order(hash).iter() {
            if let Some(slot) = seg.buckets[bucket as usize].free_slot() {
                return Some(Pos {
                    segment: seg_id,
                    bucket,
                    slot: slot as u8,
                });
            }
        }
        None
    }

    /// Split the segment, doubling the directory when its depth is already
    /// global. Entries keep their (bucket, slot) coordinates, only the
    /// segment changes, so probe paths stay intact.
    fn split(&mut self, seg_id: u32) {
        let old_depth = self.segments[seg_id as usize].local_depth;
        if old_depth == self.global_depth {
            let doubled: Vec<u32> = self
                .directory
                .iter()
                .flat_map(|&s| [s, s])
                .collect();
            self.directory = doubled;
            self.global_depth += 1;
        }
        let new_depth = old_depth + 1;
        let new_id = self.segments.len() as u32;
        self.segments.push(Segment::new(new_depth));
        self.segments[seg_id as usize].local_depth = new_depth;

        // Move entries whose split bit is set, preserving coordinates.
        for bucket in 0..TOTAL_BUCKETS {
            for slot in 0..SLOTS_PER_BUCKET {
                let moves = {
                    let b = &self.segments[seg_id as usize].buckets[bucket];
                    match &b.slots[slot] {
                        Some((k, _)) => {
                            let h = hash_key(k.as_bytes());
                            (h >> (64 - new_depth)) & 1 == 1
                        }
                        None => false,
                    }
                };
                if moves {
                    let entry = self.segments[seg_id as usize].buckets[bucket].slots[slot].take();
                    self.segments[new_id as usize].buckets[bucket].slots[slot] = entry;
                }
            }
        }

        // Point the second half of the old segment's directory span at the
        // new segment.
        let span_bit = (self.global_depth - new_depth) as u32;
        for idx in 0..self.directory.len() {
            if self.directory[idx] == seg_id && (idx >> span_bit) & 1 == 1 {
                self.directory[idx] = new_id;
            }
        }

        // A split rewrites both segments wholesale.
        for seg in [seg_id, new_id] {
            for bucket in self.segments[seg as usize].buckets.iter_mut() {
                bucket.version = self.clock.next();
            }
        }
    }

    /// Remove the entry at `pos`, returning it. Invalidates positions.
    pub fn erase(&mut self, pos: Pos) -> (PrimeKey, V) {
        let bucket = &mut self.segments[pos.segment as usize].buckets[pos.bucket as usize];
        let entry = bucket.slots[pos.slot as usize]
            .take()
            .expect("erase of an empty slot");
        bucket.version = self.clock.next();
        self.len -= 1;
        entry
    }

    /// Find and remove a key, returning its value.
    pub fn erase_key(&mut self, key: &[u8]) -> Option<V> {
        self.find(key).map(|pos| self.erase(pos).1)
    }

    pub fn pair_at(&self, pos: Pos) -> Option<(&PrimeKey, &V)> {
        self.segments
            .get(pos.segment as usize)?
            .buckets
            .get(pos.bucket as usize)?
            .slots
            .get(pos.slot as usize)?
            .as_ref()
            .map(|(k, v)| (k, v))
    }

    pub fn key_at(&self, pos: Pos) -> Option<&PrimeKey> {
        self.pair_at(pos).map(|(k, _)| k)
    }

    pub fn value_at(&self, pos: Pos) -> Option<&V> {
        self.pair_at(pos).map(|(_, v)| v)
    }

    /// In-place value access. Does not advance the bucket version; callers
    /// that mutate observable state stamp the bucket explicitly.
    pub fn value_mut_at(&mut self, pos: Pos) -> Option<&mut V> {
        self.segments
            .get_mut(pos.segment as usize)?
            .buckets
            .get_mut(pos.bucket as usize)?
            .slots
            .get_mut(pos.slot as usize)?
            .as_mut()
            .map(|(_, v)| v)
    }

    /// Mutable key access, for flag updates that do not move the entry.
    pub fn key_mut_at(&mut self, pos: Pos) -> Option<&mut PrimeKey> {
        self.segments
            .get_mut(pos.segment as usize)?
            .buckets
            .get_mut(pos.bucket as usize)?
            .slots
            .get_mut(pos.slot as usize)?
            .as_mut()
            .map(|(k, _)| k)
    }

    pub fn is_occupied(&self, pos: Pos) -> bool {
        self.pair_at(pos).is_some()
    }

    pub fn bucket_version(&self, pos: Pos) -> u64 {
        self.segments[pos.segment as usize].buckets[pos.bucket as usize].version
    }

    /// Advance the bucket's version past every observer registered so far.
    pub fn stamp_bucket(&mut self, pos: Pos) {
        let v = self.clock.next();
        self.segments[pos.segment as usize].buckets[pos.bucket as usize].version = v;
    }

    /// Raise the bucket's version to at least `version`. Lets an observer
    /// mark a bucket visited against its own bound without hiding it from
    /// observers registered later.
    pub fn raise_bucket_version(&mut self, pos: Pos, version: u64) {
        let b = &mut self.segments[pos.segment as usize].buckets[pos.bucket as usize];
        if b.version < version {
            b.version = version;
        }
    }

    /// Move a hot entry toward a better position: out of the stash into its
    /// home bucket, or to the front slot of its bucket. Sticky or protected
    /// entries are left in place by the policy. Returns the new position.
    pub fn bump_up<P: BumpPolicy>(&mut self, pos: Pos, policy: &P) -> Pos {
        let Some((key, _)) = self.pair_at(pos) else {
            return pos;
        };
        let hash = hash_key(key.as_bytes());
        let (home, _) = Self::home_buckets(hash);

        if pos.is_stash() {
            let seg = &mut self.segments[pos.segment as usize];
            // Try a free home slot first.
            if let Some(free) = seg.buckets[home as usize].free_slot() {
                let entry = seg.buckets[pos.bucket as usize].slots[pos.slot as usize].take();
                seg.buckets[home as usize].slots[free] = entry;
                seg.buckets[pos.bucket as usize].version = self.clock.next();
                seg.buckets[home as usize].version = self.clock.next();
                self.stash_unloaded += 1;
                return Pos {
                    segment: pos.segment,
                    bucket: home,
                    slot: free as u8,
                };
            }
            // Otherwise displace the last home slot if the policy allows.
            let victim_slot = SLOTS_PER_BUCKET - 1;
            let can = match &seg.buckets[home as usize].slots[victim_slot] {
                Some((victim, _)) => policy.can_bump_down(victim),
                None => false,
            };
            if can {
                let ours = seg.buckets[pos.bucket as usize].slots[pos.slot as usize].take();
                let theirs = seg.buckets[home as usize].slots[victim_slot].take();
                seg.buckets[home as usize].slots[victim_slot] = ours;
                seg.buckets[pos.bucket as usize].slots[pos.slot as usize] = theirs;
                seg.buckets[pos.bucket as usize].version = self.clock.next();
                seg.buckets[home as usize].version = self.clock.next();
                self.stash_unloaded += 1;
                return Pos {
                    segment: pos.segment,
                    bucket: home,
                    slot: victim_slot as u8,
                };
            }
            return pos;
        }

        if pos.slot == 0 {
            return pos;
        }
        let seg = &mut self.segments[pos.segment as usize];
        let can = match &seg.buckets[pos.bucket as usize].slots[0] {
            Some((victim, _)) => policy.can_bump_down(victim),
            None => true,
        };
        if can {
            seg.buckets[pos.bucket as usize]
                .slots
                .swap(0, pos.slot as usize);
            seg.buckets[pos.bucket as usize].version = self.clock.next();
            return Pos { slot: 0, ..pos };
        }
        pos
    }

    /// Report, before a bump of `pos` runs, every bucket the bump may touch
    /// whose version is below `upper_bound`. Observers use this to serialize
    /// stale buckets ahead of the move.
    pub fn cvc_upon_bump(&self, upper_bound: u64, pos: Pos, mut cb: impl FnMut(Pos)) {
        let mut report = |bucket: u8| {
            let head = Pos {
                segment: pos.segment,
                bucket,
                slot: 0,
            };
            if self.bucket_version(head) < upper_bound {
                cb(head);
            }
        };
        report(pos.bucket);
        if pos.is_stash() {
            if let Some((key, _)) = self.pair_at(pos) {
                let (home, _) = Self::home_buckets(hash_key(key.as_bytes()));
                if home != pos.bucket {
                    report(home);
                }
            }
        }
    }

    /// Rotate the bucket's slots right by one, freeing slot zero. Called
    /// after the last slot was evicted.
    pub fn shift_right(&mut self, segment: u32, bucket: u8) {
        let b = &mut self.segments[segment as usize].buckets[bucket as usize];
        b.slots.rotate_right(1);
        b.version = self.clock.next();
    }

    /// Occupied positions of one bucket. Erasing returned positions is
    /// safe; slots do not compact.
    pub fn bucket_positions(&self, segment: u32, bucket: u8) -> Vec<Pos> {
        self.segments[segment as usize].buckets[bucket as usize]
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(slot, _)| Pos {
                segment,
                bucket,
                slot: slot as u8,
            })
            .collect()
    }

    /// Collect the occupied positions of the cursor's bucket and step the
    /// cursor.
    pub fn scan_bucket(&self, cursor: Cursor) -> (Vec<Pos>, Cursor) {
        let Some((seg, bucket)) = cursor.0 else {
            return (Vec::new(), cursor);
        };
        if seg as usize >= self.segments.len() {
            return (Vec::new(), Cursor(None));
        }
        let positions = self.bucket_positions(seg, bucket);

        let next = if (bucket as usize) + 1 < TOTAL_BUCKETS {
            Cursor(Some((seg, bucket + 1)))
        } else if (seg as usize) + 1 < self.segments.len() {
            Cursor(Some((seg + 1, 0)))
        } else {
            Cursor(None)
        };
        (positions, next)
    }

    /// Iterate all entries. For stats and tests; mutation invalidates it.
    pub fn iter(&self) -> impl Iterator<Item = (Pos, &PrimeKey, &V)> {
        self.segments.iter().enumerate().flat_map(|(si, seg)| {
            seg.buckets.iter().enumerate().flat_map(move |(bi, b)| {
                b.slots.iter().enumerate().filter_map(move |(sl, entry)| {
                    entry.as_ref().map(|(k, v)| {
                        (
                            Pos {
                                segment: si as u32,
                                bucket: bi as u8,
                                slot: sl as u8,
                            },
                            k,
                            v,
                        )
                    })
                })
            })
        })
    }

    /// Whether a bucket holds no entries, for eviction scans.
    pub fn bucket_is_empty(&self, segment: u32, bucket: u8) -> bool {
        self.segments[segment as usize].buckets[bucket as usize].is_empty()
    }
}

impl<V> Default for DashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
