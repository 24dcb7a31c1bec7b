//! Candle merge engine
//!
//! Merges a historical bar snapshot with live kline ticks into one strictly
//! ordered bar sequence and mirrors every change into a [`ChartSink`].
//! This is the only place bar timestamps are normalized to milliseconds.

use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::types::Bar;

/// Epoch values below this are taken to be seconds (10^11 s is year 5138)
const SECONDS_CUTOFF: i64 = 100_000_000_000;

/// Normalize an epoch timestamp in seconds or milliseconds to milliseconds
pub fn normalize_timestamp(ts: i64) -> i64 {
    if ts.abs() < SECONDS_CUTOFF {
        ts.saturating_mul(1_000)
    } else {
        ts
    }
}

/// Rendering surface for a bar series
#[cfg_attr(test, automock)]
pub trait ChartSink: Send {
    /// Replace the whole visible series. Called once per seed.
    fn set_full_series(&mut self, bars: &[Bar]);
    /// Replace the last visible bar
    fn upsert_last_bar(&mut self, bar: &Bar);
    /// Append a bar after the last visible one
    fn append_bar(&mut self, bar: &Bar);
}

/// What a single tick did to the series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same interval as the last bar, replaced in place
    Replaced,
    /// Newer interval, appended
    Appended,
    /// Older than the last bar, or malformed. The series is untouched.
    Discarded,
    /// Held until the series is seeded
    Buffered,
}

pub struct CandleSeries<S: ChartSink> {
    bars: Vec<Bar>,
    sink: S,
    seeded: bool,
    /// Ticks received before the snapshot arrived
    early: Vec<Bar>,
}

impl<S: ChartSink> CandleSeries<S> {
    pub fn new(sink: S) -> Self {
        Self {
            bars: Vec::new(),
            sink,
            seeded: false,
            early: Vec::new(),
        }
    }

    /// Seed from a historical snapshot: sort, dedupe (last write wins) and
    /// fold in any ticks that arrived early, then publish the full series.
    pub fn seed(&mut self, history: &[Bar]) {
        let mut bars: Vec<Bar> = history.iter().filter_map(normalized).collect();
        let dropped = history.len() - bars.len();
        if dropped > 0 {
            warn!(dropped, "Discarded malformed bars from snapshot");
        }

        // Stable sort keeps arrival order within equal timestamps
        bars.sort_by_key(|bar| bar.interval_start);
        let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.interval_start == bar.interval_start => *last = bar,
                _ => deduped.push(bar),
            }
        }
        self.bars = deduped;

        for tick in std::mem::take(&mut self.early) {
            merge_into(&mut self.bars, tick);
        }

        self.seeded = true;
        debug!(count = self.bars.len(), "Seeded candle series");
        self.sink.set_full_series(&self.bars);
    }

    /// Merge one live tick. Exactly one sink call for an accepted tick.
    pub fn apply_tick(&mut self, tick: &Bar) -> MergeOutcome {
        let Some(tick) = normalized(tick) else {
            warn!(time = tick.interval_start, "Discarded malformed tick");
            return MergeOutcome::Discarded;
        };

        if !self.seeded {
            self.early.push(tick);
            return MergeOutcome::Buffered;
        }

        let outcome = merge_into(&mut self.bars, tick);
        match outcome {
            MergeOutcome::Replaced => self.sink.upsert_last_bar(&tick),
            MergeOutcome::Appended => self.sink.append_bar(&tick),
            MergeOutcome::Discarded => {
                debug!(time = tick.interval_start, "Discarded late tick");
            }
            MergeOutcome::Buffered => {}
        }
        outcome
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|bar| bar.close)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

fn normalized(bar: &Bar) -> Option<Bar> {
    if !bar.is_valid() {
        return None;
    }
    Some(Bar {
        interval_start: normalize_timestamp(bar.interval_start),
        ..*bar
    })
}

fn merge_into(bars: &mut Vec<Bar>, tick: Bar) -> MergeOutcome {
    match bars.last_mut() {
        Some(last) if tick.interval_start == last.interval_start => {
            *last = tick;
            MergeOutcome::Replaced
        }
        Some(last) if tick.interval_start < last.interval_start => MergeOutcome::Discarded,
        _ => {
            bars.push(tick);
            MergeOutcome::Appended
        }
    }
}

/// Sink that keeps the rendered series in memory
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub series: Vec<Bar>,
    pub full_series_calls: usize,
}

impl ChartSink for RecordingSink {
    fn set_full_series(&mut self, bars: &[Bar]) {
        self.series = bars.to_vec();
        self.full_series_calls += 1;
    }

    fn upsert_last_bar(&mut self, bar: &Bar) {
        if let Some(last) = self.series.last_mut() {
            *last = *bar;
        }
    }

    fn append_bar(&mut self, bar: &Bar) {
        self.series.push(*bar);
    }
}
