use std::collections::HashMap;
use std::hash::BuildHasher;
use std::hint::black_box;
use std::time::{Duration, Instant};

use tracing::debug;

use super::corpus::KeyCorpus;
use super::report::{BenchReport, TrialStats};
use crate::{ChdMap, ChdMapHashLoader};

/// Read-only lookup used by the timed loop.
pub trait KeyQuery {
    fn query(&self, key: &[u8]) -> u64;
}

impl<H: ChdMapHashLoader> KeyQuery for ChdMap<H> {
    #[inline]
    fn query(&self, key: &[u8]) -> u64 {
        ChdMap::query(self, key)
    }
}

/// Baseline; absent keys read as zero.
impl<S: BuildHasher> KeyQuery for HashMap<Vec<u8>, u64, S> {
    #[inline]
    fn query(&self, key: &[u8]) -> u64 {
        self.get(key).copied().unwrap_or(0)
    }
}

impl<T: KeyQuery + ?Sized> KeyQuery for &T {
    #[inline]
    fn query(&self, key: &[u8]) -> u64 {
        (**self).query(key)
    }
}

/// Runs `trials` sequential query passes over `corpus` and collects timings.
pub fn run_trials<Q>(map: &Q, corpus: &KeyCorpus, trials: usize) -> BenchReport
where
    Q: KeyQuery + ?Sized,
{
    run_trials_with(map, corpus, trials, |_, _| {})
}

/// Like [`run_trials`], calling `on_trial` with the index and statistics of
/// each trial as soon as it completes.
///
/// Every pass queries the keys in corpus order and adds the results into a
/// single wrapping sum that outlives all trials; the sum goes through
/// [`black_box`] and is returned as [`BenchReport::checksum`], so the lookups
/// cannot be optimized away.
pub fn run_trials_with<Q, F>(
    map: &Q,
    corpus: &KeyCorpus,
    trials: usize,
    mut on_trial: F,
) -> BenchReport
where
    Q: KeyQuery + ?Sized,
    F: FnMut(usize, &TrialStats),
{
    let key_count = corpus.len();
    let mut stats = Vec::with_capacity(trials);
    let mut total = Duration::ZERO;
    let mut sum = 0u64;

    for trial in 0..trials {
        let start = Instant::now();
        for key in corpus.iter() {
            sum = sum.wrapping_add(map.query(black_box(key)));
        }
        sum = black_box(sum);
        let elapsed = start.elapsed();

        let trial_stats = TrialStats::new(elapsed, key_count);
        debug!(trial, keys = key_count, ?elapsed, "trial finished");
        on_trial(trial, &trial_stats);
        total += elapsed;
        stats.push(trial_stats);
    }

    BenchReport {
        trials: stats,
        total,
        key_count,
        checksum: black_box(sum),
    }
}
