//! Fixed-size CPU bitmask.
//!
//! [`CpuSet`] is laid out like the kernel's `cpu_set_t` (1024 bits in 64-bit
//! words) so it can be embedded in shared-memory records. All-zero is the
//! empty set.
//!
//! # Example
//!
//! ```rust,ignore
//! use corelend::CpuSet;
//!
//! let mask: CpuSet = [0, 1, 4].into_iter().collect();
//! assert!(mask.contains(4));
//! assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 4]);
//! assert_eq!(mask.to_string(), "[0-1,4]");
//! ```

use std::fmt;

/// Number of 64-bit words in a [`CpuSet`].
const WORDS: usize = 16;

/// Highest CPU count a [`CpuSet`] can describe.
pub const MAX_CPUS: usize = WORDS * 64;

/// A set of CPU ids in `0..MAX_CPUS`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuSet {
    bits: [u64; WORDS],
}

impl CpuSet {
    /// An empty set.
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// The set `0..n` (clamped to [`MAX_CPUS`]).
    pub fn first_n(n: usize) -> Self {
        let mut set = Self::new();
        for cpu in 0..n.min(MAX_CPUS) {
            set.insert(cpu);
        }
        set
    }

    /// A set holding a single CPU.
    pub fn single(cpu: usize) -> Self {
        let mut set = Self::new();
        set.insert(cpu);
        set
    }

    /// Add `cpu`. Ids beyond [`MAX_CPUS`] are ignored.
    ///
    /// Returns `true` if the CPU was not already present.
    #[inline]
    pub fn insert(&mut self, cpu: usize) -> bool {
        if cpu >= MAX_CPUS {
            return false;
        }
        let (word, bit) = (cpu / 64, 1u64 << (cpu % 64));
        let was_set = self.bits[word] & bit != 0;
        self.bits[word] |= bit;
        !was_set
    }

    /// Remove `cpu`. Returns `true` if it was present.
    #[inline]
    pub fn remove(&mut self, cpu: usize) -> bool {
        if cpu >= MAX_CPUS {
            return false;
        }
        let (word, bit) = (cpu / 64, 1u64 << (cpu % 64));
        let was_set = self.bits[word] & bit != 0;
        self.bits[word] &= !bit;
        was_set
    }

    /// Whether `cpu` is in the set.
    #[inline]
    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / 64] & (1u64 << (cpu % 64)) != 0
    }

    /// Number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Remove every CPU.
    pub fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    /// Lowest CPU id in the set.
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Set union.
    pub fn union(&self, other: &CpuSet) -> CpuSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        out
    }

    /// Set intersection.
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a &= *b;
        }
        out
    }

    /// CPUs in `self` that are not in `other`.
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !*b;
        }
        out
    }

    /// Whether every CPU of `self` is in `other`.
    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.difference(other).is_empty()
    }

    /// Whether the two sets share a CPU.
    pub fn intersects(&self, other: &CpuSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Iterate CPU ids in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            word: 0,
            current: self.bits[0],
        }
    }
}

/// Ascending iterator over a [`CpuSet`].
pub struct Iter<'a> {
    set: &'a CpuSet,
    word: usize,
    current: u64,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word * 64 + bit);
            }
            self.word += 1;
            if self.word >= WORDS {
                return None;
            }
            self.current = self.set.bits[self.word];
        }
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = usize;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl Extend<usize> for CpuSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for cpu in iter {
            self.insert(cpu);
        }
    }
}

/// Formats as a compact range list, e.g. `[0-3,8,10-11]`.
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        f.write_str("]")
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut set = CpuSet::new();
        assert!(set.is_empty());
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(200));
        assert!(set.contains(3));
        assert!(set.contains(200));
        assert!(!set.contains(4));
        assert_eq!(set.count(), 2);
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut set = CpuSet::new();
        assert!(!set.insert(MAX_CPUS));
        assert!(!set.contains(MAX_CPUS + 5));
        assert!(set.is_empty());
    }

    #[test]
    fn test_iter_order() {
        let set: CpuSet = [130, 2, 64, 63, 0].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2, 63, 64, 130]);
        assert_eq!(set.first(), Some(0));
        assert_eq!(CpuSet::new().first(), None);
    }

    #[test]
    fn test_set_algebra() {
        let a: CpuSet = [0, 1, 2, 3].into_iter().collect();
        let b: CpuSet = [2, 3, 4].into_iter().collect();
        assert_eq!(a.union(&b).count(), 5);
        assert_eq!(a.intersection(&b), [2, 3].into_iter().collect());
        assert_eq!(a.difference(&b), [0, 1].into_iter().collect());
        assert!(CpuSet::single(2).is_subset(&a));
        assert!(!b.is_subset(&a));
        assert!(a.intersects(&b));
        assert!(!CpuSet::single(9).intersects(&a));
    }

    #[test]
    fn test_first_n() {
        assert_eq!(CpuSet::first_n(4).count(), 4);
        assert!(CpuSet::first_n(4).contains(3));
        assert!(!CpuSet::first_n(4).contains(4));
        assert_eq!(CpuSet::first_n(MAX_CPUS * 2).count(), MAX_CPUS);
    }

    #[test]
    fn test_display() {
        let set: CpuSet = [0, 1, 2, 3, 8, 10, 11].into_iter().collect();
        assert_eq!(set.to_string(), "[0-3,8,10-11]");
        assert_eq!(CpuSet::new().to_string(), "[]");
        assert_eq!(format!("{:?}", CpuSet::single(5)), "CpuSet[5]");
    }
}
