//! Journal statistics and Prometheus exporter
//!
//! # Prometheus Metrics
//!
//! - `raidlog_read_full_hits_total` - Reads served entirely from the cache
//! - `raidlog_read_partial_hits_total` - Reads partly served from the cache
//! - `raidlog_read_misses_total` - Reads with nothing cached
//! - `raidlog_cached_stripes` - Stripes with data only in the journal
//! - `raidlog_flush_threshold` - Cached columns that get a stripe flushed
//! - `raidlog_reclaimable_sectors` - Space the next tail move would free
//! - `raidlog_io_units` - I/O units per lifecycle list
//! - `raidlog_parked_stripes` - Stripes waiting for log space or an I/O unit
//! - `raidlog_faulty` - Journal device failed (0/1)

use std::fmt::{self, Write};
use std::sync::atomic::Ordering;

use raidlog_common::{ArrayId, CacheMode, Sector};

use crate::log::Log;

/// Point-in-time view of a journal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub array: ArrayId,
    pub cache_mode: CacheMode,
    pub read_full_hits: u64,
    pub read_partial_hits: u64,
    pub read_misses: u64,
    pub cached_stripes: usize,
    pub stripes_in_cache: usize,
    pub flush_threshold: usize,
    pub device_size: Sector,
    pub log_start: Sector,
    pub seq: u64,
    pub last_checkpoint: Sector,
    pub last_cp_seq: u64,
    pub next_checkpoint: Sector,
    pub reclaimable: Sector,
    pub running_units: usize,
    pub io_end_units: usize,
    pub flushing_units: usize,
    pub finished_units: usize,
    pub no_space_stripes: usize,
    pub no_mem_stripes: usize,
    pub need_cache_flush: bool,
    pub faulty: bool,
}

impl fmt::Display for JournalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "r5c_read_full_hits: {}", self.read_full_hits)?;
        writeln!(f, "r5c_read_partial_hits: {}", self.read_partial_hits)?;
        writeln!(f, "r5c_read_misses: {}", self.read_misses)?;
        writeln!(f, "r5c_cached_stripes: {}", self.cached_stripes)?;
        writeln!(f, "r5c_flush_threshold: {}", self.flush_threshold)?;
        writeln!(f, "r5c_cache_mode: {}", self.cache_mode)?;
        writeln!(f, "r5l_need_cache_flush: {}", u8::from(self.need_cache_flush))?;
        writeln!(f, "r5l_log_start: {} seq {}", self.log_start, self.seq)?;
        writeln!(
            f,
            "r5l_last_checkpoint: {} seq {}",
            self.last_checkpoint, self.last_cp_seq
        )?;
        writeln!(f, "r5l_reclaimable: {}", self.reclaimable)
    }
}

impl Log {
    /// Snapshot of counters and positions
    pub fn stats(&self) -> JournalStats {
        let head = self.head();
        let (next_checkpoint, reclaimable, running, io_end, flushing, finished, no_mem) = {
            let lists = self.lists.lock();
            (
                lists.next_checkpoint.sector,
                self.reclaimable_locked(&lists),
                lists.running.len(),
                lists.io_end.len(),
                lists.flushing.len(),
                lists.finished.len(),
                lists.no_mem_stripes.len(),
            )
        };
        let tail = self.last_checkpoint();

        JournalStats {
            array: self.array.id(),
            cache_mode: self.cache_mode(),
            read_full_hits: self.cache.read_full_hits.load(Ordering::Relaxed),
            read_partial_hits: self.cache.read_partial_hits.load(Ordering::Relaxed),
            read_misses: self.cache.read_misses.load(Ordering::Relaxed),
            cached_stripes: self.cached_stripes(),
            stripes_in_cache: self.cache.stripe_in_cache.lock().len(),
            flush_threshold: self.flush_threshold(),
            device_size: self.ring.size(),
            log_start: head.sector,
            seq: head.seq,
            last_checkpoint: tail.sector,
            last_cp_seq: tail.seq,
            next_checkpoint,
            reclaimable,
            running_units: running,
            io_end_units: io_end,
            flushing_units: flushing,
            finished_units: finished,
            no_space_stripes: self.no_space_stripes.lock().len(),
            no_mem_stripes: no_mem,
            need_cache_flush: self.need_cache_flush(),
            faulty: self.is_faulty(),
        }
    }
}

/// Prometheus text format exporter for journal statistics
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "raidlog")
    prefix: String,
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export the statistics of every journal
    pub fn export(&self, journals: &[JournalStats]) -> String {
        let mut output = String::with_capacity(4 * 1024);
        if journals.is_empty() {
            return output;
        }

        let counters: [(&str, &str, fn(&JournalStats) -> f64); 3] = [
            (
                "read_full_hits_total",
                "Reads served entirely from the cache",
                |s| s.read_full_hits as f64,
            ),
            (
                "read_partial_hits_total",
                "Reads partly served from the cache",
                |s| s.read_partial_hits as f64,
            ),
            (
                "read_misses_total",
                "Reads with nothing in the cache",
                |s| s.read_misses as f64,
            ),
        ];
        for (name, help, value) in counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            for stats in journals {
                self.write_array_metric(&mut output, name, value(stats), stats, &[]);
            }
        }

        let gauges: [(&str, &str, fn(&JournalStats) -> f64); 5] = [
            (
                "cached_stripes",
                "Stripes with data only in the journal",
                |s| s.cached_stripes as f64,
            ),
            (
                "flush_threshold",
                "Cached columns that get a stripe flushed",
                |s| s.flush_threshold as f64,
            ),
            (
                "reclaimable_sectors",
                "Journal space the next tail move would free",
                |s| s.reclaimable as f64,
            ),
            (
                "device_sectors",
                "Usable journal size",
                |s| s.device_size as f64,
            ),
            (
                "faulty",
                "Journal device failed",
                |s| f64::from(u8::from(s.faulty)),
            ),
        ];
        for (name, help, value) in gauges {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "gauge");
            for stats in journals {
                self.write_array_metric(&mut output, name, value(stats), stats, &[]);
            }
        }

        self.write_help(&mut output, "io_units", "I/O units per lifecycle list");
        self.write_type(&mut output, "io_units", "gauge");
        for stats in journals {
            for (list, count) in [
                ("running", stats.running_units),
                ("io_end", stats.io_end_units),
                ("flushing", stats.flushing_units),
                ("finished", stats.finished_units),
            ] {
                self.write_array_metric(&mut output, "io_units", count as f64, stats, &[("list", list)]);
            }
        }

        self.write_help(
            &mut output,
            "parked_stripes",
            "Stripes waiting for log space or an I/O unit",
        );
        self.write_type(&mut output, "parked_stripes", "gauge");
        for stats in journals {
            for (reason, count) in [
                ("no_space", stats.no_space_stripes),
                ("no_mem", stats.no_mem_stripes),
            ] {
                self.write_array_metric(
                    &mut output,
                    "parked_stripes",
                    count as f64,
                    stats,
                    &[("reason", reason)],
                );
            }
        }

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_array_metric(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        stats: &JournalStats,
        labels: &[(&str, &str)],
    ) {
        let mut labels_str = format!("array=\"{}\"", stats.array);
        for (k, v) in labels {
            let _ = write!(labels_str, ",{k}=\"{v}\"");
        }
        let _ = writeln!(output, "{}_{}{{{}}} {}", self.prefix, name, labels_str, value);
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("raidlog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JournalStats {
        JournalStats {
            read_full_hits: 12,
            read_partial_hits: 3,
            read_misses: 40,
            cached_stripes: 7,
            flush_threshold: 2,
            running_units: 1,
            no_space_stripes: 4,
            need_cache_flush: true,
            ..JournalStats::default()
        }
    }

    #[test]
    fn test_display_lines() {
        let text = sample().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "r5c_read_full_hits: 12");
        assert_eq!(lines[1], "r5c_read_partial_hits: 3");
        assert_eq!(lines[2], "r5c_read_misses: 40");
        assert_eq!(lines[3], "r5c_cached_stripes: 7");
        assert!(text.contains("r5c_cache_mode: 2: write-back"));
        assert!(text.contains("r5l_need_cache_flush: 1"));
    }

    #[test]
    fn test_prometheus_export() {
        let stats = sample();
        let array = stats.array.to_string();
        let output = PrometheusExporter::default().export(&[stats]);

        assert!(output.contains("# HELP raidlog_read_full_hits_total"));
        assert!(output.contains("# TYPE raidlog_read_misses_total counter"));
        assert!(output.contains(&format!("raidlog_read_full_hits_total{{array=\"{array}\"}} 12")));
        assert!(output.contains(&format!("raidlog_cached_stripes{{array=\"{array}\"}} 7")));
        assert!(output.contains(&format!(
            "raidlog_io_units{{array=\"{array}\",list=\"running\"}} 1"
        )));
        assert!(output.contains(&format!(
            "raidlog_parked_stripes{{array=\"{array}\",reason=\"no_space\"}} 4"
        )));
        assert!(PrometheusExporter::new("x").export(&[]).is_empty());
    }

    #[test]
    fn test_snapshot_of_live_log() {
        use crate::array::RaidArray;
        use crate::test_utils::{MemArray, dirty_stripe, open_log};

        let array = MemArray::new(4, 1);
        let (log, _rx, _dev) = open_log(&array, 1000);
        let sh = dirty_stripe(&array, 0, &[0], 1);
        log.write_stripe(&sh).unwrap();
        let stats = log.stats();
        assert_eq!(stats.array, array.id());
        assert_eq!(stats.running_units, 1);
        assert_eq!(stats.stripes_in_cache, 1);
        assert_eq!(stats.log_start, 24);
        assert_eq!(stats.device_size, 1000);
        assert!(!stats.faulty);
    }
}
