//! Keys, half-open key ranges, hash-sharded regions, and region maps.
//!
//! A region is a contiguous key range tagged with the hash-shard bounds it
//! belongs to. A `RegionMap<V>` assigns a value of type `V` to every key of a
//! region, stored as the sorted sequence of maximal constant-value runs.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque byte-ordered key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The smallest key (the empty byte string).
    pub fn min() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The smallest key strictly greater than `self`.
    pub fn successor(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(0);
        Self(bytes)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", String::from_utf8_lossy(&self.0).escape_debug())
    }
}

/// Right bound of a half-open key range. `Unbounded` sorts above every key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum RightBound {
    Key(Key),
    Unbounded,
}

impl RightBound {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, RightBound::Unbounded)
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            RightBound::Key(k) => Some(k),
            RightBound::Unbounded => None,
        }
    }

    /// Whether `key` lies strictly below this bound.
    pub fn exceeds(&self, key: &Key) -> bool {
        match self {
            RightBound::Key(k) => key < k,
            RightBound::Unbounded => true,
        }
    }

    fn cmp_key(&self, key: &Key) -> Ordering {
        match self {
            RightBound::Key(k) => k.cmp(key),
            RightBound::Unbounded => Ordering::Greater,
        }
    }
}

/// Half-open key interval `[left, right)`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: Key,
    pub right: RightBound,
}

impl KeyRange {
    pub fn new(left: Key, right: RightBound) -> Self {
        Self { left, right }
    }

    /// The canonical empty range at the smallest key.
    pub fn empty() -> Self {
        Self::empty_at(Key::min())
    }

    /// An empty range anchored at `key`, i.e. `[key, key)`.
    pub fn empty_at(key: Key) -> Self {
        Self {
            right: RightBound::Key(key.clone()),
            left: key,
        }
    }

    pub fn unbounded_from(left: Key) -> Self {
        Self {
            left,
            right: RightBound::Unbounded,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.right.cmp_key(&self.left) != Ordering::Greater
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        *key >= self.left && self.right.exceeds(key)
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (other.left >= self.left && other.right <= self.right)
    }

    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        let left = self.left.clone().max(other.left.clone());
        let right = self.right.clone().min(other.right.clone());
        let range = KeyRange { left, right };
        if range.is_empty() {
            KeyRange::empty_at(range.left)
        } else {
            range
        }
    }

    /// Everything of `self` strictly below `bound`.
    pub fn clip_right(&self, bound: &RightBound) -> KeyRange {
        let right = self.right.clone().min(bound.clone());
        let range = KeyRange {
            left: self.left.clone(),
            right,
        };
        if range.is_empty() {
            KeyRange::empty_at(range.left)
        } else {
            range
        }
    }

    /// Everything of `self` at or above `key`.
    pub fn clip_left(&self, key: &Key) -> KeyRange {
        let left = self.left.clone().max(key.clone());
        let range = KeyRange {
            left,
            right: self.right.clone(),
        };
        if range.is_empty() {
            KeyRange::empty_at(range.left)
        } else {
            range
        }
    }
}

/// A key range within fixed outer hash-shard bounds.
///
/// All regions handled by one replica share the same `beg`/`end`, so range
/// operations reduce to operations on `inner`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Region {
    pub beg: u64,
    pub end: u64,
    pub inner: KeyRange,
}

impl Region {
    pub fn new(beg: u64, end: u64, inner: KeyRange) -> Self {
        Self { beg, end, inner }
    }

    /// The whole keyspace of one hash shard.
    pub fn full_keyspace(beg: u64, end: u64) -> Self {
        Self::new(beg, end, KeyRange::unbounded_from(Key::min()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.inner.contains_key(key)
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        other.is_empty() || (self.same_shard(other) && self.inner.contains_range(&other.inner))
    }

    pub fn same_shard(&self, other: &Region) -> bool {
        self.beg == other.beg && self.end == other.end
    }

    /// An empty region anchored at this region's left edge, same shard.
    pub fn collapse(&self) -> Region {
        Region {
            beg: self.beg,
            end: self.end,
            inner: KeyRange::empty_at(self.inner.left.clone()),
        }
    }

    pub fn with_inner(&self, inner: KeyRange) -> Region {
        Region {
            beg: self.beg,
            end: self.end,
            inner,
        }
    }

    pub fn intersection(&self, other: &Region) -> Region {
        assert!(
            self.same_shard(other),
            "region intersection across shard bounds ({}..{} vs {}..{})",
            self.beg,
            self.end,
            other.beg,
            other.end
        );
        self.with_inner(self.inner.intersection(&other.inner))
    }
}

/// A value of type `V` for every key of a region, run-length encoded as the
/// sorted sequence of maximal constant-value sub-ranges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionMap<V> {
    region: Region,
    runs: Vec<(KeyRange, V)>,
}

impl<V: Clone + PartialEq> RegionMap<V> {
    /// A map assigning `value` to every key of `region`.
    pub fn new(region: Region, value: V) -> Self {
        let runs = if region.is_empty() {
            Vec::new()
        } else {
            vec![(region.inner.clone(), value)]
        };
        Self { region, runs }
    }

    /// Rebuild a map from contiguous runs covering `domain` in ascending order.
    pub fn from_runs(domain: Region, runs: Vec<(KeyRange, V)>) -> Self {
        let mut expected = RightBound::Key(domain.inner.left.clone());
        for (range, _) in &runs {
            assert!(
                RightBound::Key(range.left.clone()) == expected,
                "region map runs are not contiguous"
            );
            assert!(!range.is_empty(), "region map run is empty");
            expected = range.right.clone();
        }
        assert!(
            (runs.is_empty() && domain.is_empty()) || expected == domain.inner.right,
            "region map runs do not cover their domain"
        );
        let mut map = Self {
            region: domain,
            runs,
        };
        map.coalesce();
        map
    }

    pub fn domain(&self) -> &Region {
        &self.region
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs in ascending key order.
    pub fn runs(&self) -> impl Iterator<Item = (&KeyRange, &V)> {
        self.runs.iter().map(|(r, v)| (r, v))
    }

    pub fn get(&self, key: &Key) -> Option<&V> {
        self.runs
            .iter()
            .find(|(range, _)| range.contains_key(key))
            .map(|(_, v)| v)
    }

    pub fn map<W: Clone + PartialEq>(&self, f: impl Fn(&V) -> W) -> RegionMap<W> {
        let mut out = RegionMap {
            region: self.region.clone(),
            runs: self
                .runs
                .iter()
                .map(|(range, v)| (range.clone(), f(v)))
                .collect(),
        };
        out.coalesce();
        out
    }

    /// Restrict the map to the intersection of its domain with `region`.
    pub fn mask(&self, region: &Region) -> RegionMap<V> {
        let domain = self.region.intersection(region);
        let runs = self
            .runs
            .iter()
            .filter_map(|(range, v)| {
                let clipped = range.intersection(&domain.inner);
                if clipped.is_empty() {
                    None
                } else {
                    Some((clipped, v.clone()))
                }
            })
            .collect();
        let mut out = RegionMap {
            region: domain,
            runs,
        };
        out.coalesce();
        out
    }

    /// Overwrite `region` (which must lie inside the domain) with `value`.
    pub fn update(&mut self, region: &Region, value: V) {
        if region.is_empty() {
            return;
        }
        assert!(
            self.region.contains_region(region),
            "region map update outside its domain"
        );
        let mut runs = Vec::with_capacity(self.runs.len() + 2);
        for (range, v) in &self.runs {
            let before = range.clip_right(&RightBound::Key(region.inner.left.clone()));
            if !before.is_empty() {
                runs.push((before, v.clone()));
            }
        }
        runs.push((region.inner.clone(), value));
        if let RightBound::Key(cut) = &region.inner.right {
            for (range, v) in &self.runs {
                let after = range.clip_left(cut);
                if !after.is_empty() {
                    runs.push((after, v.clone()));
                }
            }
        }
        self.runs = runs;
        self.coalesce();
    }

    /// Merge every other map's runs into this one (domains must be disjoint
    /// or overlapping sub-regions of this map's domain).
    pub fn update_map(&mut self, other: &RegionMap<V>) {
        for (range, v) in other.runs() {
            self.update(&other.region.with_inner(range.clone()), v.clone());
        }
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<(KeyRange, V)> = Vec::with_capacity(self.runs.len());
        for (range, v) in self.runs.drain(..) {
            match merged.last_mut() {
                Some((prev, pv)) if *pv == v && prev.right == RightBound::Key(range.left.clone()) => {
                    prev.right = range.right;
                }
                _ => merged.push((range, v)),
            }
        }
        self.runs = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(left: &str, right: &str) -> KeyRange {
        KeyRange::new(Key::from(left), RightBound::Key(Key::from(right)))
    }

    fn region(left: &str, right: &str) -> Region {
        Region::new(0, u64::MAX, range(left, right))
    }

    #[test]
    fn empty_and_containment() {
        assert!(KeyRange::empty().is_empty());
        assert!(KeyRange::empty_at(Key::from("m")).is_empty());
        let r = range("a", "m");
        assert!(r.contains_key(&Key::from("a")));
        assert!(r.contains_key(&Key::from("lzz")));
        assert!(!r.contains_key(&Key::from("m")));
        let unbounded = KeyRange::unbounded_from(Key::from("a"));
        assert!(unbounded.contains_key(&Key::from("zzzz")));
        assert!(!unbounded.is_empty());
    }

    #[test]
    fn intersection_and_clipping() {
        let r = range("c", "p");
        assert_eq!(r.intersection(&range("a", "g")), range("c", "g"));
        assert_eq!(r.intersection(&range("g", "z")), range("g", "p"));
        assert!(r.intersection(&range("p", "z")).is_empty());
        assert_eq!(
            r.clip_right(&RightBound::Key(Key::from("h"))),
            range("c", "h")
        );
        assert_eq!(r.clip_left(&Key::from("h")), range("h", "p"));
    }

    #[test]
    fn successor_orders_directly_above() {
        let k = Key::from("abc");
        let s = k.successor();
        assert!(s > k);
        assert!(!range("a", "z").intersection(&KeyRange::new(k, RightBound::Key(s))).is_empty());
    }

    #[test]
    fn region_map_update_splits_runs() {
        let mut map = RegionMap::new(region("a", "z"), 1u64);
        map.update(&region("g", "m"), 2);
        let runs: Vec<_> = map.runs().map(|(r, v)| (r.clone(), *v)).collect();
        assert_eq!(
            runs,
            vec![
                (range("a", "g"), 1),
                (range("g", "m"), 2),
                (range("m", "z"), 1),
            ]
        );
        map.update(&region("g", "m"), 1);
        let runs: Vec<_> = map.runs().map(|(r, v)| (r.clone(), *v)).collect();
        assert_eq!(runs, vec![(range("a", "z"), 1)]);
    }

    #[test]
    fn region_map_mask_restricts_domain() {
        let mut map = RegionMap::new(region("a", "z"), 1u64);
        map.update(&region("m", "z"), 2);
        let masked = map.mask(&region("g", "q"));
        let runs: Vec<_> = masked.runs().map(|(r, v)| (r.clone(), *v)).collect();
        assert_eq!(runs, vec![(range("g", "m"), 1), (range("m", "q"), 2)]);
        assert_eq!(masked.domain(), &region("g", "q"));
    }

    #[test]
    fn region_map_get_by_key() {
        let mut map = RegionMap::new(region("a", "z"), 10u64);
        map.update(&region("k", "n"), 20);
        assert_eq!(map.get(&Key::from("b")), Some(&10));
        assert_eq!(map.get(&Key::from("k")), Some(&20));
        assert_eq!(map.get(&Key::from("n")), Some(&10));
        assert_eq!(map.get(&Key::from("z")), None);
    }

    #[test]
    #[should_panic(expected = "outside its domain")]
    fn region_map_update_outside_domain_panics() {
        let mut map = RegionMap::new(region("a", "m"), 1u64);
        map.update(&region("a", "z"), 2);
    }
}
