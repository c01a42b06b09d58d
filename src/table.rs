//! Cuckoo hash table with a stash.
//!
//! - Two bucket arrays ("table1", "table2") addressed by independent seeded
//!   hash functions
//! - Bounded eviction chains: a full bucket evicts its last occupant, which
//!   hops to its alternate bucket
//! - One overflow stash bucket as the last-resort landing spot
//! - Doubling resize that rehashes every entry, carrying both seeds over
//!   unchanged
//!
//! Single-threaded by design; callers needing shared access must wrap the
//! table in their own synchronization.

use std::collections::TryReserveError;
use std::error::Error;
use std::fmt;
use std::hash::BuildHasher;
use std::iter;

use ahash::RandomState;
use foldhash::fast::FixedState;

use crate::bucket::{Bucket, BUCKET_SLOTS};

/// Safety factor applied to the logarithmic eviction bound
const MAX_TRIES_FACTOR: usize = 16;

/// Allocation failure while creating or growing a table.
///
/// Construction unwinds fully; a failed resize leaves the table in its valid
/// pre-resize state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocError(TryReserveError);

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table allocation failed: {}", self.0)
    }
}

impl Error for AllocError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

impl From<TryReserveError> for AllocError {
    fn from(err: TryReserveError) -> Self {
        AllocError(err)
    }
}

/// Outcome of a bounded insertion attempt (no resize)
enum Attempt<V> {
    /// Entry landed in a bucket or the stash
    Placed,

    /// Key already present; the incoming value is handed back untouched
    Duplicate(V),

    /// Eviction budget exhausted and the stash is full; the pair that ended
    /// up displaced is handed back so the caller can grow and retry
    Stuck(u64, V),
}

/// Where a key lives
#[derive(Clone, Copy)]
enum Location {
    First { bucket: usize, slot: usize },
    Second { bucket: usize, slot: usize },
    Stash { slot: usize },
}

#[inline]
fn bucket_index<S: BuildHasher>(state: &S, key: u64, size: usize) -> usize {
    (state.hash_one(key) % size as u64) as usize
}

fn try_alloc_buckets<V>(size: usize) -> Result<Box<[Bucket<V>]>, AllocError> {
    let mut buckets = Vec::new();
    buckets.try_reserve_exact(size)?;
    buckets.resize_with(size, Bucket::new);
    Ok(buckets.into_boxed_slice())
}

/// Backing storage: both bucket arrays plus the stash.
///
/// Split out from the head structure so a resize can run the same insertion
/// machinery against a fresh set of arrays before installing them.
struct Tables<V> {
    table1: Box<[Bucket<V>]>,
    table2: Box<[Bucket<V>]>,
    stash: Bucket<V>,
    /// Buckets per table (total primary capacity is `2 * size * BUCKET_SLOTS`)
    size: usize,
}

impl<V> Tables<V> {
    fn try_with_size(size: usize) -> Result<Self, AllocError> {
        debug_assert!(size >= 1);
        Ok(Self {
            table1: try_alloc_buckets(size)?,
            table2: try_alloc_buckets(size)?,
            stash: Bucket::new(),
            size,
        })
    }

    /// Eviction attempts before an insert gives up and falls back to the
    /// stash. Proportional to the log of per-table capacity; past this bound
    /// the chain is overwhelmingly likely to be cycling.
    fn max_tries(&self) -> usize {
        let slots_per_table = self.size * BUCKET_SLOTS;
        MAX_TRIES_FACTOR * (slots_per_table.ilog2().max(1) as usize)
    }

    fn locate(&self, h1: &FixedState, h2: &RandomState, key: u64) -> Option<Location> {
        let i1 = bucket_index(h1, key, self.size);
        if let Some(slot) = self.table1[i1].find(key) {
            return Some(Location::First { bucket: i1, slot });
        }

        let i2 = bucket_index(h2, key, self.size);
        if let Some(slot) = self.table2[i2].find(key) {
            return Some(Location::Second { bucket: i2, slot });
        }

        self.stash.find(key).map(|slot| Location::Stash { slot })
    }

    fn bucket_at(&self, location: Location) -> (&Bucket<V>, usize) {
        match location {
            Location::First { bucket, slot } => (&self.table1[bucket], slot),
            Location::Second { bucket, slot } => (&self.table2[bucket], slot),
            Location::Stash { slot } => (&self.stash, slot),
        }
    }

    fn bucket_at_mut(&mut self, location: Location) -> (&mut Bucket<V>, usize) {
        match location {
            Location::First { bucket, slot } => (&mut self.table1[bucket], slot),
            Location::Second { bucket, slot } => (&mut self.table2[bucket], slot),
            Location::Stash { slot } => (&mut self.stash, slot),
        }
    }

    /// Place an entry without ever resizing.
    ///
    /// Keeps a displaced pair, initially the incoming one, and alternates
    /// between the tables: a duplicate stops the chain, an empty slot ends
    /// it, a full bucket swaps out its last occupant and the chain continues
    /// with the evictee. After `max_tries` attempts the displaced pair goes
    /// to the stash; a full stash fails the whole attempt.
    fn insert_no_resize(
        &mut self,
        h1: &FixedState,
        h2: &RandomState,
        key: u64,
        value: V,
    ) -> Attempt<V> {
        let mut displaced = (key, value);

        for attempt in 0..self.max_tries() {
            let (key, value) = displaced;
            let bucket = if attempt % 2 == 0 {
                &mut self.table1[bucket_index(h1, key, self.size)]
            } else {
                &mut self.table2[bucket_index(h2, key, self.size)]
            };

            if bucket.contains(key) {
                return Attempt::Duplicate(value);
            }
            match bucket.push(key, value) {
                Ok(_) => return Attempt::Placed,
                Err((key, value)) => displaced = bucket.swap_last(key, value),
            }
        }

        let (key, value) = displaced;
        if self.stash.contains(key) {
            return Attempt::Duplicate(value);
        }
        match self.stash.push(key, value) {
            Ok(_) => Attempt::Placed,
            Err((key, value)) => Attempt::Stuck(key, value),
        }
    }

    /// Move every entry out of these arrays into `dst`.
    ///
    /// Returns the number of entries placed; pairs the destination could not
    /// take are pushed onto `stuck` instead of being lost.
    fn drain_into(
        &mut self,
        dst: &mut Tables<V>,
        h1: &FixedState,
        h2: &RandomState,
        stuck: &mut Vec<(u64, V)>,
    ) -> usize {
        let mut migrated = 0;
        let buckets = self
            .table1
            .iter_mut()
            .chain(self.table2.iter_mut())
            .chain(iter::once(&mut self.stash));

        for bucket in buckets {
            while let Some((key, value)) = bucket.pop() {
                match dst.insert_no_resize(h1, h2, key, value) {
                    Attempt::Placed => migrated += 1,
                    // source buckets held unique keys, so this cannot fire
                    Attempt::Duplicate(_) => {}
                    Attempt::Stuck(k, v) => stuck.push((k, v)),
                }
            }
        }

        migrated
    }
}

/// A cuckoo hash table mapping `u64` keys to values of type `V`.
///
/// Every key occupies exactly one slot across table1, table2 and the stash.
/// Inserting an already-present key is a deliberate no-op: the stored value
/// is kept and the table is not touched.
pub struct CuckooTable<V> {
    tables: Tables<V>,

    /// Live key count across both tables and the stash
    entries: usize,

    /// Hash seeds, fixed for the life of the table (resize carries them over)
    seed1: u64,
    seed2: u64,

    h1: FixedState,
    h2: RandomState,
}

impl<V> CuckooTable<V> {
    /// Create a table able to hold roughly `requested` entries before the
    /// first growth, with seeds drawn from the thread-local generator.
    pub fn with_capacity(requested: usize) -> Result<Self, AllocError> {
        Self::with_capacity_and_seeds(requested, rand::random(), rand::random())
    }

    /// Create a table with explicit hash seeds.
    ///
    /// Same seeds and same operation sequence give identical placement, which
    /// is what tests want.
    pub fn with_capacity_and_seeds(
        requested: usize,
        seed1: u64,
        seed2: u64,
    ) -> Result<Self, AllocError> {
        let size = requested.div_ceil(2 * BUCKET_SLOTS).max(1);
        Ok(Self {
            tables: Tables::try_with_size(size)?,
            entries: 0,
            seed1,
            seed2,
            h1: FixedState::with_seed(seed1),
            h2: RandomState::with_seed(seed2 as usize),
        })
    }

    /// Number of live keys
    #[inline]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns `true` if the table contains no entries
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of buckets per table
    #[inline]
    pub fn size(&self) -> usize {
        self.tables.size
    }

    /// Total primary slot count (both tables, excluding the stash)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.tables.size * 2 * BUCKET_SLOTS
    }

    /// Fraction of primary capacity in use. Informational only; entries in
    /// the stash can push this above 1.0.
    #[inline]
    pub fn load_factor(&self) -> f64 {
        self.entries as f64 / self.capacity() as f64
    }

    /// The hash seeds the table was created with
    #[inline]
    pub fn seeds(&self) -> (u64, u64) {
        (self.seed1, self.seed2)
    }

    /// Insert a key-value pair.
    ///
    /// Returns `true` when the pair was placed or the key was already
    /// present (the stored value wins). Returns `false` only when the table
    /// could not be grown far enough to take the pair, i.e. on allocation
    /// failure; the table stays valid and keeps every prior entry.
    pub fn insert(&mut self, key: u64, value: V) -> bool {
        // The eviction walk only sees the buckets it visits, so a key parked
        // in the stash would not be noticed there. Check up front.
        if self.contains_key(key) {
            return true;
        }

        match self.tables.insert_no_resize(&self.h1, &self.h2, key, value) {
            Attempt::Placed => {
                self.entries += 1;
                true
            }
            Attempt::Duplicate(_) => true,
            Attempt::Stuck(key, value) => self.grow_and_insert(key, value),
        }
    }

    /// Return `true` if the table holds the key
    #[inline]
    pub fn contains_key(&self, key: u64) -> bool {
        self.tables.locate(&self.h1, &self.h2, key).is_some()
    }

    /// Returns a reference to the value associated with the key
    pub fn get(&self, key: u64) -> Option<&V> {
        let location = self.tables.locate(&self.h1, &self.h2, key)?;
        let (bucket, slot) = self.tables.bucket_at(location);
        // Safety: locate only reports occupied slots
        Some(unsafe { bucket.value(slot) })
    }

    /// Returns a mutable reference to the value associated with the key
    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        let location = self.tables.locate(&self.h1, &self.h2, key)?;
        let (bucket, slot) = self.tables.bucket_at_mut(location);
        // Safety: locate only reports occupied slots
        Some(unsafe { bucket.value_mut(slot) })
    }

    /// Remove a key, returning its value if it was present.
    ///
    /// The bucket compacts around the hole; no rebalancing from the stash or
    /// the other table is attempted.
    pub fn remove(&mut self, key: u64) -> Option<V> {
        let location = self.tables.locate(&self.h1, &self.h2, key)?;
        let (bucket, slot) = self.tables.bucket_at_mut(location);
        let (_, value) = bucket.remove_at(slot);
        self.entries -= 1;
        Some(value)
    }

    /// Iterate over all entries as `(key, &value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> {
        self.tables
            .table1
            .iter()
            .chain(self.tables.table2.iter())
            .chain(iter::once(&self.tables.stash))
            .flat_map(|bucket| bucket.iter())
    }

    /// Drop every entry, keeping the current arrays
    pub fn clear(&mut self) {
        for bucket in self
            .tables
            .table1
            .iter_mut()
            .chain(self.tables.table2.iter_mut())
        {
            bucket.clear();
        }
        self.tables.stash.clear();
        self.entries = 0;
    }

    /// Keep doubling until the stuck pair places. Only an allocation failure
    /// ends the loop.
    fn grow_and_insert(&mut self, mut key: u64, mut value: V) -> bool {
        loop {
            let new_size = self.tables.size * 2;
            if self.resize(new_size).is_err() {
                return false;
            }
            match self.tables.insert_no_resize(&self.h1, &self.h2, key, value) {
                Attempt::Placed => {
                    self.entries += 1;
                    return true;
                }
                Attempt::Duplicate(_) => return true,
                Attempt::Stuck(k, v) => {
                    key = k;
                    value = v;
                }
            }
        }
    }

    /// Rebuild both tables and the stash at `new_size` buckets per table,
    /// rehashing every live entry under the original seeds.
    ///
    /// The fresh arrays are fully allocated before any entry moves, so an
    /// allocation failure here leaves the table exactly as it was. If the
    /// target turns out undersized (re-insertion sticks), the walk doubles
    /// again and folds everything in rather than asserting.
    fn resize(&mut self, new_size: usize) -> Result<(), AllocError> {
        debug_assert!(
            new_size * 2 * BUCKET_SLOTS > self.entries,
            "resize target cannot hold current entries"
        );

        let (h1, h2) = (self.h1.clone(), self.h2.clone());
        let mut size = new_size;
        let mut carry: Vec<(u64, V)> = Vec::new();

        loop {
            let mut fresh = Tables::try_with_size(size)?;
            let mut stuck = Vec::new();

            let mut migrated = self.tables.drain_into(&mut fresh, &h1, &h2, &mut stuck);
            for (key, value) in carry.drain(..) {
                match fresh.insert_no_resize(&h1, &h2, key, value) {
                    Attempt::Placed => migrated += 1,
                    Attempt::Duplicate(_) => {}
                    Attempt::Stuck(k, v) => stuck.push((k, v)),
                }
            }

            self.tables = fresh;
            self.entries = migrated;

            if stuck.is_empty() {
                return Ok(());
            }
            carry = stuck;
            size *= 2;
        }
    }
}
