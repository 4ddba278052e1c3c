//! Timers and counters
//!
//! Per-phase wall-clock accumulators and the solver counters the engine
//! reports on shutdown. Recording is gated by the `time_statistics` flag;
//! disabled timers cost two branch instructions per phase.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Accumulating wall-clock timer.
#[derive(Debug, Default)]
pub struct TimeStat {
    amount: Duration,
    started: Option<Instant>,
}

impl TimeStat {
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn end(&mut self) {
        if let Some(started) = self.started.take() {
            self.amount += started.elapsed();
        }
    }

    #[must_use]
    pub fn get(&self) -> Duration {
        self.amount
    }
}

/// All engine statistics.
#[derive(Debug, Default)]
pub struct Stats {
    enabled: bool,
    pub set_current_node: TimeStat,
    pub remove: TimeStat,
    pub check_subsumption: TimeStat,
    pub mark_path_condition: TimeStat,
    pub split: TimeStat,
    pub execute: TimeStat,
    pub solver_call: TimeStat,
    pub solver_calls: u64,
    pub solver_failures: u64,
    pub entries_tabled: u64,
    pub nodes_subsumed: u64,
}

impl Stats {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Whether timers should be driven at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// A serializable snapshot of the counters and timings.
    #[must_use]
    pub fn report(&self) -> StatsReport {
        StatsReport {
            set_current_node_ms: self.set_current_node.get().as_secs_f64() * 1000.0,
            remove_ms: self.remove.get().as_secs_f64() * 1000.0,
            check_subsumption_ms: self.check_subsumption.get().as_secs_f64() * 1000.0,
            mark_path_condition_ms: self.mark_path_condition.get().as_secs_f64() * 1000.0,
            split_ms: self.split.get().as_secs_f64() * 1000.0,
            execute_ms: self.execute.get().as_secs_f64() * 1000.0,
            solver_call_ms: self.solver_call.get().as_secs_f64() * 1000.0,
            solver_calls: self.solver_calls,
            solver_failures: self.solver_failures,
            entries_tabled: self.entries_tabled,
            nodes_subsumed: self.nodes_subsumed,
        }
    }
}

/// Shutdown statistics, one line per phase.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub set_current_node_ms: f64,
    pub remove_ms: f64,
    pub check_subsumption_ms: f64,
    pub mark_path_condition_ms: f64,
    pub split_ms: f64,
    pub execute_ms: f64,
    pub solver_call_ms: f64,
    pub solver_calls: u64,
    pub solver_failures: u64,
    pub entries_tabled: u64,
    pub nodes_subsumed: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "interpolation engine timings (ms):")?;
        writeln!(f, "    setCurrentNode = {:.3}", self.set_current_node_ms)?;
        writeln!(f, "    remove = {:.3}", self.remove_ms)?;
        writeln!(f, "    checkSubsumption = {:.3}", self.check_subsumption_ms)?;
        writeln!(f, "    markPathCondition = {:.3}", self.mark_path_condition_ms)?;
        writeln!(f, "    split = {:.3}", self.split_ms)?;
        writeln!(f, "    execute = {:.3}", self.execute_ms)?;
        writeln!(f, "    solverCall = {:.3}", self.solver_call_ms)?;
        writeln!(
            f,
            "    solver calls for subsumption checks (failed) = {} ({})",
            self.solver_calls, self.solver_failures
        )?;
        writeln!(f, "    entries tabled = {}", self.entries_tabled)?;
        write!(f, "    nodes subsumed = {}", self.nodes_subsumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_stat_accumulates() {
        let mut stat = TimeStat::default();
        stat.start();
        stat.end();
        stat.start();
        stat.end();
        // No sleeping in tests: just check start/end pairing is safe and
        // monotone.
        let first = stat.get();
        stat.start();
        stat.end();
        assert!(stat.get() >= first);
    }

    #[test]
    fn test_end_without_start_is_noop() {
        let mut stat = TimeStat::default();
        stat.end();
        assert_eq!(stat.get(), Duration::ZERO);
    }

    #[test]
    fn test_disabled_stats_report_is_zeroed() {
        let stats = Stats::new(false);
        assert!(!stats.enabled());
        let report = stats.report();
        assert_eq!(report.solver_calls, 0);
        assert_eq!(report.execute_ms, 0.0);
    }

    #[test]
    fn test_report_serializes() {
        let stats = Stats::new(true);
        let report = stats.report();
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("solver_calls"));
    }
}
