//! Per-run counters and cost estimation.
//!
//! One [`RunStats`] lives for the duration of a single run (a resume starts
//! a fresh one — the job row carries the cross-run totals). Snapshots feed
//! the bounded-cadence `cost_update` events; the final summary line is
//! appended to the job's processing log so the numbers survive without
//! replaying events.

use serde::{Deserialize, Serialize};

/// Mutable per-run accumulator, owned by the page loop.
#[derive(Debug)]
pub struct RunStats {
    pages_processed: u32,
    pages_skipped: u32,
    recipes_found: u32,
    needs_review: u32,
    duplicates_removed: u32,
    failed_pages: u32,
    cost_per_page_usd: f64,
}

impl RunStats {
    pub fn new(cost_per_page_usd: f64) -> Self {
        Self {
            pages_processed: 0,
            pages_skipped: 0,
            recipes_found: 0,
            needs_review: 0,
            duplicates_removed: 0,
            failed_pages: 0,
            cost_per_page_usd,
        }
    }

    /// Every attempted page counts as processed, including failed ones —
    /// `processed_pages` mirrors the loop position, not the success count.
    pub fn record_page(&mut self) {
        self.pages_processed += 1;
    }

    pub fn record_skipped(&mut self) {
        self.pages_skipped += 1;
    }

    pub fn record_recipe(&mut self, needs_review: bool) {
        self.recipes_found += 1;
        if needs_review {
            self.needs_review += 1;
        }
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_removed += 1;
    }

    pub fn record_failed_page(&mut self) {
        self.failed_pages += 1;
    }

    pub fn pages_processed(&self) -> u32 {
        self.pages_processed
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        f64::from(self.pages_processed) * self.cost_per_page_usd
    }

    /// True every `every` processed pages; gates `cost_update` emission.
    pub fn at_cost_cadence(&self, every: u32) -> bool {
        self.pages_processed > 0 && self.pages_processed % every == 0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_processed: self.pages_processed,
            pages_skipped: self.pages_skipped,
            recipes_found: self.recipes_found,
            needs_review: self.needs_review,
            duplicates_removed: self.duplicates_removed,
            failed_pages: self.failed_pages,
            estimated_cost_usd: self.estimated_cost_usd(),
        }
    }

    /// The durable one-liner appended to the processing log at completion.
    pub fn summary_line(&self) -> String {
        format!(
            "run summary: {} pages processed, {} skipped, {} failed, {} recipes ({} needs review), {} duplicates removed, est. cost ${:.4}",
            self.pages_processed,
            self.pages_skipped,
            self.failed_pages,
            self.recipes_found,
            self.needs_review,
            self.duplicates_removed,
            self.estimated_cost_usd(),
        )
    }
}

/// Immutable view of [`RunStats`], carried by `cost_update` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pages_processed: u32,
    pub pages_skipped: u32,
    pub recipes_found: u32,
    pub needs_review: u32,
    pub duplicates_removed: u32,
    pub failed_pages: u32,
    pub estimated_cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_with_pages() {
        let mut s = RunStats::new(0.002);
        for _ in 0..10 {
            s.record_page();
        }
        assert!((s.estimated_cost_usd() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn cadence_fires_every_n_pages() {
        let mut s = RunStats::new(0.002);
        assert!(!s.at_cost_cadence(5));
        for _ in 0..5 {
            s.record_page();
        }
        assert!(s.at_cost_cadence(5));
        s.record_page();
        assert!(!s.at_cost_cadence(5));
    }

    #[test]
    fn summary_line_carries_counters() {
        let mut s = RunStats::new(0.01);
        s.record_page();
        s.record_page();
        s.record_recipe(true);
        s.record_duplicate();
        s.record_failed_page();
        let line = s.summary_line();
        assert!(line.contains("2 pages processed"), "got: {line}");
        assert!(line.contains("1 recipes (1 needs review)"), "got: {line}");
        assert!(line.contains("1 duplicates removed"), "got: {line}");
        assert!(line.contains("$0.0200"), "got: {line}");
    }

    #[test]
    fn snapshot_mirrors_counters() {
        let mut s = RunStats::new(0.0);
        s.record_page();
        s.record_skipped();
        let snap = s.snapshot();
        assert_eq!(snap.pages_processed, 1);
        assert_eq!(snap.pages_skipped, 1);
        assert_eq!(snap.estimated_cost_usd, 0.0);
    }
}
