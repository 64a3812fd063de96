use crate::error::WindowError;
use crate::record::TopicPartition;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::trace;

/// One keyed observation fed into the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEvent {
    pub key: String,
    pub value: u64,
    pub event_time: DateTime<Utc>,
}

impl WindowEvent {
    pub fn new(key: impl Into<String>, value: u64, event_time: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            event_time,
        }
    }
}

/// Per-key running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accumulator {
    pub count: u64,
    pub sum: u64,
}

impl Accumulator {
    fn add(&mut self, value: u64) -> Option<()> {
        let count = self.count.checked_add(1)?;
        let sum = self.sum.checked_add(value)?;
        self.count = count;
        self.sum = sum;
        Some(())
    }
}

/// A tumbling window `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub aggregates: BTreeMap<String, Accumulator>,
}

/// A closed window together with the input offsets it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedWindow {
    pub window: Window,
    pub offsets: BTreeMap<TopicPartition, i64>,
}

/// What happened to an ingested event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Applied,
    /// Earlier than anything still open; dropped
    Late { window_start: DateTime<Utc> },
}

/// Tumbling-window state machine
///
/// At most one window is open at a time. Input offsets accumulate until the
/// next flush so they commit together with the aggregates derived from them.
#[derive(Debug)]
pub struct WindowState {
    size_ms: i64,
    open: Option<Window>,
    last_flushed_end: Option<DateTime<Utc>>,
    uncommitted: BTreeMap<TopicPartition, i64>,
}

impl WindowState {
    /// Fails unless `size` is a positive number of milliseconds that fits an `i64`
    pub fn new(size: Duration) -> Result<Self, WindowError> {
        let size_ms = i64::try_from(size.as_millis())
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| WindowError::InvalidBoundary(format!("window size {:?}", size)))?;
        Ok(Self {
            size_ms,
            open: None,
            last_flushed_end: None,
            uncommitted: BTreeMap::new(),
        })
    }

    pub fn open_window(&self) -> Option<&Window> {
        self.open.as_ref()
    }

    pub fn last_flushed_end(&self) -> Option<DateTime<Utc>> {
        self.last_flushed_end
    }

    pub fn has_uncommitted_offsets(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Window boundaries aligned to multiples of the window size
    pub fn bounds_for(
        &self,
        event_time: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), WindowError> {
        let out_of_range = || {
            WindowError::InvalidBoundary(format!(
                "window of {}ms around {}",
                self.size_ms, event_time
            ))
        };
        let start_ms = event_time
            .timestamp_millis()
            .div_euclid(self.size_ms)
            .checked_mul(self.size_ms)
            .ok_or_else(out_of_range)?;
        let start = millis(start_ms).ok_or_else(out_of_range)?;
        let end = start
            .checked_add_signed(ChronoDuration::milliseconds(self.size_ms))
            .ok_or_else(out_of_range)?;
        Ok((start, end))
    }

    /// Close the open window if `event` lies at or past its end
    ///
    /// Returns the window that must be flushed before `event` is applied.
    pub fn advance_for(&mut self, event: &WindowEvent) -> Option<ClosedWindow> {
        match &self.open {
            Some(window) if event.event_time >= window.end => self.close(),
            _ => None,
        }
    }

    /// Fold `event` into the open window, opening one if needed
    ///
    /// Call [`advance_for`](Self::advance_for) first so an event past the
    /// open window's end is never folded into it.
    pub fn apply(&mut self, event: &WindowEvent) -> Result<Admission, WindowError> {
        if let Some(window) = &self.open {
            if event.event_time < window.start {
                return Ok(Admission::Late {
                    window_start: window.start,
                });
            }
        } else if let Some(flushed_end) = self.last_flushed_end {
            if event.event_time < flushed_end {
                return Ok(Admission::Late {
                    window_start: flushed_end,
                });
            }
        }

        if self.open.is_none() {
            let (start, end) = self.bounds_for(event.event_time)?;
            trace!(%start, %end, "Opening window");
            self.open = Some(Window {
                start,
                end,
                aggregates: BTreeMap::new(),
            });
        }

        if let Some(window) = self.open.as_mut() {
            window
                .aggregates
                .entry(event.key.clone())
                .or_default()
                .add(event.value)
                .ok_or_else(|| WindowError::CounterOverflow {
                    key: event.key.clone(),
                    window_start: window.start.to_rfc3339(),
                })?;
        }
        Ok(Admission::Applied)
    }

    /// Remember that every input offset below `offset` has been ingested
    pub fn mark_offset(&mut self, tp: TopicPartition, offset: i64) {
        self.uncommitted
            .entry(tp)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    /// Close the open window if the clock has reached its end
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<ClosedWindow> {
        match &self.open {
            Some(window) if window.end <= now => self.close(),
            _ => None,
        }
    }

    /// Offsets ingested while no window is open
    pub fn take_idle_offsets(&mut self) -> Option<BTreeMap<TopicPartition, i64>> {
        if self.open.is_some() || self.uncommitted.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.uncommitted))
    }

    /// Give back offsets whose commit failed so the next flush carries them
    pub fn restore_offsets(&mut self, offsets: BTreeMap<TopicPartition, i64>) {
        for (tp, offset) in offsets {
            self.mark_offset(tp, offset);
        }
    }

    /// Drop the open window without emitting it
    pub fn discard(&mut self) -> Option<Window> {
        self.open.take()
    }

    fn close(&mut self) -> Option<ClosedWindow> {
        let window = self.open.take()?;
        self.last_flushed_end = Some(window.end);
        Some(ClosedWindow {
            window,
            offsets: std::mem::take(&mut self.uncommitted),
        })
    }
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
