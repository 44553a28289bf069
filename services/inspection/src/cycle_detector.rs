//! Cycle boundary detection over the raw event backlog.
//!
//! A cycle for a `(cycle_name, execution_center_id)` key opens on a
//! false→true transition of the activity flag and closes on the matching
//! true→false transition, the closing event included. Open cycles are tracked
//! per key so interleaved cycles of different keys never mix.
//!
//! Detection is a pure function of the events it is given: nothing here
//! touches the store. Cycles are rebuilt from unprocessed events on every pass.

use crate::event_store::RawEvent;
use crate::fields::{self, ExtractedFields, ParseError};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace, warn};

/// Identity of a physical cycle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleKey {
    pub cycle_name: String,
    pub execution_center_id: String,
}

impl CycleKey {
    pub fn new(cycle_name: impl Into<String>, execution_center_id: impl Into<String>) -> Self {
        Self {
            cycle_name: cycle_name.into(),
            execution_center_id: execution_center_id.into(),
        }
    }

    /// `{cycle_name}-{execution_center_id}`, unique per inspection
    pub fn product_code(&self) -> String {
        format!("{}-{}", self.cycle_name, self.execution_center_id)
    }
}

impl fmt::Display for CycleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cycle_name, self.execution_center_id)
    }
}

/// Lifecycle of a detected cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Rising edge seen, still collecting
    Open,
    /// Falling edge seen, settlement window not yet elapsed
    Closed,
    /// Settlement window elapsed, ready for correlation
    Settling,
    /// Photos correlated and inspection materialized
    Finalized,
}

/// A raw event together with its extracted fields and ordering timestamp
#[derive(Debug, Clone)]
pub struct CycleEvent {
    pub raw: RawEvent,
    pub fields: ExtractedFields,
    pub timestamp: DateTime<Utc>,
}

/// Events between one rising edge and its falling edge for one key
#[derive(Debug, Clone)]
pub struct Cycle {
    pub key: CycleKey,
    /// Ordered by timestamp; the first is the start event and, once closed,
    /// the last is the end event
    pub events: Vec<CycleEvent>,
    pub state: CycleState,
}

impl Cycle {
    fn open(key: CycleKey, start: CycleEvent) -> Self {
        Self {
            key,
            events: vec![start],
            state: CycleState::Open,
        }
    }

    pub fn start_event(&self) -> &CycleEvent {
        &self.events[0]
    }

    /// Absent while the cycle is still open
    pub fn end_event(&self) -> Option<&CycleEvent> {
        match self.state {
            CycleState::Open => None,
            _ => self.events.last(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.start_event().timestamp
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.end_event().map(|e| e.timestamp)
    }

    /// Calendar date of the start event at the plant offset
    pub fn start_date(&self, offset: FixedOffset) -> NaiveDate {
        self.started_at().with_timezone(&offset).date_naive()
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.raw.id).collect()
    }

    pub fn product_code(&self) -> String {
        self.key.product_code()
    }

    fn last_seen(&self) -> DateTime<Utc> {
        self.events.last().map_or(self.started_at(), |e| e.timestamp)
    }

    /// True if any member tick raised the PLC failure flag
    pub fn plc_reported_failure(&self) -> bool {
        self.events.iter().any(|e| e.fields.failure_flag)
    }
}

/// Why an event was excluded from every cycle
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    /// Payload could not be decoded; retrying will never succeed
    Malformed(ParseError),
    /// Cycle name or execution center id absent
    MissingKey(ParseError),
    /// Inactive tick outside any open cycle
    Idle,
    /// Member of an open cycle that stopped ticking
    Abandoned,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Malformed(_) => "malformed",
            DiscardReason::MissingKey(_) => "missing_key",
            DiscardReason::Idle => "idle",
            DiscardReason::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discarded {
    pub event_id: i64,
    pub reason: DiscardReason,
}

/// Result of one detection pass
#[derive(Debug, Default)]
pub struct Detection {
    /// Cycles whose falling edge was seen, ordered by end timestamp
    pub closed: Vec<Cycle>,
    /// Cycles still collecting when the batch ran out; their events stay
    /// unprocessed and are rescanned next pass
    pub open: Vec<Cycle>,
    /// Open cycles that went silent for longer than the open-cycle timeout;
    /// their events are listed in `discarded`
    pub abandoned: Vec<Cycle>,
    pub discarded: Vec<Discarded>,
    /// Events scanned, after the per-page limit
    pub scanned: usize,
}

impl Detection {
    pub fn discarded_ids(&self) -> Vec<i64> {
        self.discarded.iter().map(|d| d.event_id).collect()
    }
}

/// Groups ordered raw events into cycles
#[derive(Debug, Clone)]
pub struct CycleDetector {
    batch_limit: usize,
    offset: FixedOffset,
    open_timeout: Option<Duration>,
}

impl CycleDetector {
    pub fn new(batch_limit: usize, offset: FixedOffset) -> Self {
        Self {
            batch_limit,
            offset,
            open_timeout: None,
        }
    }

    /// Abandon open cycles with no tick for `timeout`
    pub fn with_open_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    pub fn scan(&self) -> Scan<'_> {
        Scan {
            detector: self,
            open: HashMap::new(),
            detection: Detection::default(),
            newest: None,
        }
    }

    /// Detect over a single page of at most `batch_limit` events.
    pub fn detect(&self, events: Vec<RawEvent>) -> Detection {
        let mut scan = self.scan();
        scan.feed(events);
        scan.finish(None)
    }
}

/// Detection across consecutive backlog pages. Open cycles carry over from
/// one page to the next.
pub struct Scan<'a> {
    detector: &'a CycleDetector,
    open: HashMap<CycleKey, Cycle>,
    detection: Detection,
    newest: Option<DateTime<Utc>>,
}

impl Scan<'_> {
    /// Feed the next page. Events are stably sorted by their embedded
    /// timestamp (delivery time when none is embedded), so ties keep store
    /// order; pages themselves are consumed in delivery order.
    pub fn feed(&mut self, events: Vec<RawEvent>) {
        let mut parsed = Vec::with_capacity(events.len());

        for raw in events {
            match fields::parse(&raw.payload, self.detector.offset) {
                Ok(fields) => {
                    let timestamp = fields.observed_at.unwrap_or(raw.delivered_at);
                    parsed.push(CycleEvent {
                        raw,
                        fields,
                        timestamp,
                    });
                }
                Err(err) => {
                    let reason = match err {
                        ParseError::MissingField(_) => DiscardReason::MissingKey(err),
                        _ => DiscardReason::Malformed(err),
                    };
                    warn!(event_id = raw.id, reason = reason.as_str(), "Excluding event from cycle detection");
                    self.detection.discarded.push(Discarded {
                        event_id: raw.id,
                        reason,
                    });
                }
            }
        }

        parsed.sort_by_key(|e| e.timestamp);
        parsed.truncate(self.detector.batch_limit);
        self.detection.scanned += parsed.len();

        for event in parsed {
            self.newest = self.newest.max(Some(event.timestamp));
            self.step(event);
        }
    }

    fn step(&mut self, event: CycleEvent) {
        let key = CycleKey::new(
            event.fields.cycle_name.clone(),
            event.fields.execution_center_id.clone(),
        );
        let active = event.fields.activity_flag;

        match self.open.remove(&key) {
            None if active => {
                trace!(cycle = %key, event_id = event.raw.id, "Cycle opened");
                self.open.insert(key.clone(), Cycle::open(key, event));
            }
            None => {
                self.detection.discarded.push(Discarded {
                    event_id: event.raw.id,
                    reason: DiscardReason::Idle,
                });
            }
            Some(mut cycle) => {
                cycle.events.push(event);
                if active {
                    self.open.insert(key, cycle);
                } else {
                    cycle.state = CycleState::Closed;
                    debug!(
                        cycle = %cycle.key,
                        events = cycle.events.len(),
                        "Cycle closed"
                    );
                    self.detection.closed.push(cycle);
                }
            }
        }
    }

    /// Events scanned so far
    pub fn scanned(&self) -> usize {
        self.detection.scanned
    }

    /// Finish the scan. Pass `now` when the whole backlog was read;
    /// otherwise silence is measured against the newest event scanned.
    pub fn finish(mut self, now: Option<DateTime<Utc>>) -> Detection {
        let reference = now.or(self.newest);
        let mut open: Vec<Cycle> = self.open.into_values().collect();
        open.sort_by_key(|c| c.started_at());

        for cycle in open {
            let stale = match (self.detector.open_timeout, reference) {
                (Some(timeout), Some(reference)) => reference - cycle.last_seen() >= timeout,
                _ => false,
            };
            if !stale {
                self.detection.open.push(cycle);
                continue;
            }
            warn!(
                cycle = %cycle.key,
                events = cycle.events.len(),
                last_seen = %cycle.last_seen(),
                "Abandoning open cycle without a falling edge"
            );
            self.detection
                .discarded
                .extend(cycle.events.iter().map(|e| Discarded {
                    event_id: e.raw.id,
                    reason: DiscardReason::Abandoned,
                }));
            self.detection.abandoned.push(cycle);
        }

        self.detection
    }
}
