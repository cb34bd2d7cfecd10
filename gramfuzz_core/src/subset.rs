use rand::Rng;
use rand::seq::{SliceRandom, index};
use std::collections::BTreeSet;

/// Enumerates every `size`-element subset of `items`, in the lexicographic order of
/// the set's iteration.
///
/// `size == 0` yields one empty subset; `size > items.len()` yields none.
pub fn enumerate_subsets<T: Ord + Clone>(items: &BTreeSet<T>, size: usize) -> Vec<BTreeSet<T>> {
    let pool: Vec<&T> = items.iter().collect();
    let mut out = Vec::new();
    if size > pool.len() {
        return out;
    }
    let mut chosen: Vec<&T> = Vec::with_capacity(size);
    combine(&pool, 0, size, &mut chosen, &mut out);
    out
}

fn combine<'a, T: Ord + Clone>(
    pool: &[&'a T],
    from: usize,
    size: usize,
    chosen: &mut Vec<&'a T>,
    out: &mut Vec<BTreeSet<T>>,
) {
    if chosen.len() == size {
        out.push(chosen.iter().map(|item| (*item).clone()).collect());
        return;
    }
    let still_needed = size - chosen.len();
    // Stop once too few items remain to complete the subset.
    for index in from..=(pool.len() - still_needed) {
        chosen.push(pool[index]);
        combine(pool, index + 1, size, chosen, out);
        chosen.pop();
    }
}

/// Which message types to ask the oracle to insert into a seed sequence.
///
/// At most `max_message_types` types go into one request; at most `max_requests`
/// requests are planned per enrichment round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentPlanner {
    pub max_message_types: usize,
    pub max_requests: usize,
}

impl EnrichmentPlanner {
    pub fn new(max_message_types: usize, max_requests: usize) -> Self {
        Self {
            max_message_types,
            max_requests,
        }
    }

    fn subset_size(&self, missing: &BTreeSet<String>) -> usize {
        self.max_message_types.min(missing.len())
    }

    /// The first subset in enumeration order: a deterministic prefix of `missing`.
    pub fn first(&self, missing: &BTreeSet<String>) -> Option<BTreeSet<String>> {
        let size = self.subset_size(missing);
        if size == 0 {
            return None;
        }
        Some(missing.iter().take(size).cloned().collect())
    }

    /// A random sample of up to `max_requests` distinct subsets of `missing`.
    ///
    /// Subsets are only listed in full when there are at most `max_requests` of
    /// them; otherwise index combinations are drawn until enough distinct ones exist.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        missing: &BTreeSet<String>,
        rng: &mut R,
    ) -> Vec<BTreeSet<String>> {
        let size = self.subset_size(missing);
        if size == 0 || self.max_requests == 0 {
            return Vec::new();
        }
        if binomial(missing.len(), size) <= self.max_requests {
            let mut subsets = enumerate_subsets(missing, size);
            subsets.shuffle(rng);
            return subsets;
        }

        let pool: Vec<&String> = missing.iter().collect();
        let mut drawn = BTreeSet::new();
        let mut subsets = Vec::with_capacity(self.max_requests);
        while subsets.len() < self.max_requests {
            let mut indices = index::sample(rng, pool.len(), size).into_vec();
            indices.sort_unstable();
            if drawn.insert(indices.clone()) {
                subsets.push(indices.into_iter().map(|i| pool[i].clone()).collect());
            }
        }
        subsets
    }
}

/// `n` choose `k` for `k <= n`, saturating at `usize::MAX`.
fn binomial(n: usize, k: usize) -> usize {
    let k = k.min(n - k);
    let mut result: usize = 1;
    for i in 0..k {
        result = match result.checked_mul(n - i) {
            Some(product) => product / (i + 1),
            None => return usize::MAX,
        };
    }
    result
}

/// Message types the grammar knows about but the seed sequence never exercises.
pub fn missing_message_types(
    known: &BTreeSet<String>,
    present: &BTreeSet<String>,
) -> BTreeSet<String> {
    known.difference(present).cloned().collect()
}
