use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::packet::Category;

const TALLY_FLUSH_PACKETS: u64 = 1024;
const TALLY_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Counters shared by the transmitter, the producers and the reporter.
/// Transmitter-side counters sit on their own cache lines.
#[derive(Default)]
pub struct Stats {
    sent_packets: CachePadded<AtomicU64>,
    sent_bytes: CachePadded<AtomicU64>,
    errors: CachePadded<AtomicU64>,
    enqueued: [CachePadded<AtomicU64>; 3],
    per_source: DashMap<Ipv4Addr, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Returns the running error count
    pub fn record_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_enqueued(&self, category: Category, count: u64) {
        self.enqueued[category.index()].fetch_add(count, Ordering::Relaxed);
    }

    /// Move the tally's pending per-source counts into the shared map
    pub fn flush_sources(&self, tally: &mut SourceTally) {
        for (source, count) in tally.counts.iter_mut() {
            if *count > 0 {
                *self.per_source.entry(*source).or_insert(0) += *count;
                *count = 0;
            }
        }
        tally.pending = 0;
        tally.last_flush = Instant::now();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut per_source: Vec<(Ipv4Addr, u64)> = self
            .per_source
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        per_source.sort();

        StatsSnapshot {
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            enqueued_data: self.enqueued[Category::Data.index()].load(Ordering::Relaxed),
            enqueued_templates: self.enqueued[Category::Template.index()].load(Ordering::Relaxed),
            enqueued_template_options: self.enqueued[Category::TemplateOption.index()]
                .load(Ordering::Relaxed),
            per_source,
        }
    }
}

/// Per-source send counts owned by the transmitter.
///
/// Counting here touches no lock; `Stats::flush_sources` folds the counts
/// into the shared map once enough packets or time have gone by.
pub struct SourceTally {
    counts: HashMap<Ipv4Addr, u64>,
    pending: u64,
    last_flush: Instant,
}

impl SourceTally {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            pending: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn record(&mut self, source: Ipv4Addr) {
        *self.counts.entry(source).or_insert(0) += 1;
        self.pending += 1;
    }

    pub fn is_due(&self) -> bool {
        self.pending >= TALLY_FLUSH_PACKETS || self.last_flush.elapsed() >= TALLY_FLUSH_INTERVAL
    }
}

impl Default for SourceTally {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub errors: u64,
    pub enqueued_data: u64,
    pub enqueued_templates: u64,
    pub enqueued_template_options: u64,
    /// Packets sent per simulated source, ordered by address
    pub per_source: Vec<(Ipv4Addr, u64)>,
}

impl StatsSnapshot {
    pub fn distinct_sources(&self) -> usize {
        self.per_source.len()
    }

    pub fn enqueued(&self, category: Category) -> u64 {
        match category {
            Category::Data => self.enqueued_data,
            Category::Template => self.enqueued_templates,
            Category::TemplateOption => self.enqueued_template_options,
        }
    }
}
