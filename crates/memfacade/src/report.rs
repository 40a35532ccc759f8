//! Point-in-time view of the tracker, the counters and the guarded pool,
//! printable as a table or as JSON.

use colored::*;
use prettytable::{color, Attr, Cell, Row, Table};
use serde::Serialize;

use crate::accounting::{CurrentMemoryTracker, Event, ProfileCounters};
use crate::backend::Backend;
use crate::facade::InstrumentedAlloc;
#[cfg(feature = "guarded")]
use crate::guarded::GuardedStats;

/// Output format for [`Snapshot::print`].
///
/// * `Table` - Human-readable table (default)
/// * `Json` - Compact JSON format (single line)
/// * `JsonPretty` - Pretty-printed JSON format with indentation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Format {
    #[default]
    Table,
    Json,
    JsonPretty,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CounterSnapshot {
    pub name: &'static str,
    pub description: &'static str,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot {
    pub backend: &'static str,
    pub live_bytes: i64,
    pub peak_bytes: i64,
    /// 0 when no soft limit is set.
    pub soft_limit: i64,
    pub counters: Vec<CounterSnapshot>,
    #[cfg(feature = "guarded")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guarded: Option<GuardedStats>,
}

impl Snapshot {
    pub fn capture<B: Backend + 'static>(alloc: &InstrumentedAlloc<B, CurrentMemoryTracker, ProfileCounters>) -> Self {
        Self::from_parts(B::NAME, alloc.tracker(), alloc.events())
            .with_guarded_stats(alloc)
    }

    pub fn from_parts(backend: &'static str, tracker: &CurrentMemoryTracker, counters: &ProfileCounters) -> Self {
        Self {
            backend,
            live_bytes: tracker.amount(),
            peak_bytes: tracker.peak(),
            soft_limit: tracker.soft_limit(),
            counters: Event::ALL
                .iter()
                .map(|&event| CounterSnapshot {
                    name: event.name(),
                    description: event.description(),
                    value: counters.get(event),
                })
                .collect(),
            #[cfg(feature = "guarded")]
            guarded: None,
        }
    }

    #[cfg(feature = "guarded")]
    fn with_guarded_stats<B: Backend + 'static>(mut self, alloc: &InstrumentedAlloc<B, CurrentMemoryTracker, ProfileCounters>) -> Self {
        self.guarded = alloc
            .guarded()
            .filter(|pool| pool.is_initialized())
            .map(|pool| pool.stats());
        self
    }

    #[cfg(not(feature = "guarded"))]
    fn with_guarded_stats<B: Backend + 'static>(self, _alloc: &InstrumentedAlloc<B, CurrentMemoryTracker, ProfileCounters>) -> Self {
        self
    }

    pub fn counter(&self, event: Event) -> u64 {
        self.counters
            .iter()
            .find(|counter| counter.name == event.name())
            .map_or(0, |counter| counter.value)
    }

    pub fn to_table(&self) -> Table {
        let use_colors = std::env::var("NO_COLOR").is_err();
        let header = |text: &str| {
            if use_colors {
                Cell::new(text)
                    .with_style(Attr::Bold)
                    .with_style(Attr::ForegroundColor(color::CYAN))
            } else {
                Cell::new(text).with_style(Attr::Bold)
            }
        };

        let mut table = Table::new();
        table.add_row(Row::new(vec![header("Metric"), header("Value")]));
        let mut row = |name: &str, value: String| {
            table.add_row(Row::new(vec![Cell::new(name), Cell::new(&value)]));
        };

        row("live", format_bytes(self.live_bytes));
        row("peak", format_bytes(self.peak_bytes));
        if self.soft_limit > 0 {
            row("soft limit", format_bytes(self.soft_limit));
        }
        for counter in &self.counters {
            row(counter.name, counter.value.to_string());
        }
        #[cfg(feature = "guarded")]
        if let Some(stats) = &self.guarded {
            row("guarded slots", format!("{}/{}", stats.in_use, stats.slots));
            row("guarded slot size", format_bytes(stats.slot_size as i64));
            row("sample probability", format!("{}", stats.sample_probability));
        }
        table
    }

    pub fn to_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }

    pub fn print(&self, format: Format) -> Result<(), serde_json::Error> {
        match format {
            Format::Table => {
                println!("{} {}", "[memfacade]".blue().bold(), self.backend.yellow().bold());
                self.to_table().printstd();
            }
            Format::Json => println!("{}", self.to_json(false)?),
            Format::JsonPretty => println!("{}", self.to_json(true)?),
        }
        Ok(())
    }
}

/// Human-readable byte count in 1024-based units. Live bytes dip below zero
/// when approximate releases overshoot, so the sign is kept.
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let sign = if bytes < 0 { "-" } else { "" };
    let magnitude = bytes.unsigned_abs();
    if magnitude < 1024 {
        return format!("{sign}{magnitude} B");
    }
    let mut value = magnitude as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{sign}{value:.1} {}", UNITS[unit])
}
