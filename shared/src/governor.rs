//! Capacity governor
//!
//! Paces every read and write against a per-kind budget over a sliding
//! one-minute window. The window is the sum of individually timestamped
//! charges, so capacity frees up continuously as charges age out instead of
//! all at once at a window boundary.
//!
//! A worker reserves its estimated cost before an operation and settles the
//! reservation with the actual cost the service reported afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::models::CapacityKind;

/// Length of the sliding window
pub const CAPACITY_WINDOW: Duration = Duration::from_secs(60);

/// Shortest delay handed back, so callers never spin
const MIN_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Charge {
    id: u64,
    at: Instant,
    units: f64,
}

#[derive(Debug, Default)]
struct Ledger {
    charges: VecDeque<Charge>,
    lifetime_units: f64,
}

#[derive(Debug)]
struct Lane {
    /// Units allowed per window; None disables pacing
    budget: Option<f64>,
    ledger: Mutex<Ledger>,
}

impl Lane {
    fn new(budget: Option<f64>) -> Self {
        Self {
            budget,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A granted charge, to be settled once the actual cost is known
#[derive(Debug)]
#[must_use = "settle the reservation with the actual consumed units"]
pub struct Reservation {
    kind: CapacityKind,
    id: u64,
    estimated: f64,
}

impl Reservation {
    pub fn kind(&self) -> CapacityKind {
        self.kind
    }

    pub fn estimated(&self) -> f64 {
        self.estimated
    }
}

/// Outcome of a reservation request
#[derive(Debug)]
pub enum Decision {
    Granted(Reservation),
    /// Retry after this long
    Wait(Duration),
}

/// Shared read/write capacity ledger
///
/// One instance per run, shared by reference with every worker.
#[derive(Debug)]
pub struct CapacityGovernor {
    window: Duration,
    read: Lane,
    write: Lane,
    next_id: AtomicU64,
}

impl CapacityGovernor {
    /// Create a governor from per-second ceilings, as operators configure them
    pub fn per_second(read: Option<u32>, write: Option<u32>) -> Self {
        let per_window = |rate: u32| f64::from(rate) * CAPACITY_WINDOW.as_secs_f64();
        Self::with_window(read.map(per_window), write.map(per_window), CAPACITY_WINDOW)
    }

    /// Create a governor with explicit per-window budgets
    pub fn with_window(read_budget: Option<f64>, write_budget: Option<f64>, window: Duration) -> Self {
        Self {
            window,
            read: Lane::new(read_budget),
            write: Lane::new(write_budget),
            next_id: AtomicU64::new(0),
        }
    }

    /// A governor that never delays but still keeps totals
    pub fn unlimited() -> Self {
        Self::with_window(None, None, CAPACITY_WINDOW)
    }

    fn lane(&self, kind: CapacityKind) -> &Lane {
        match kind {
            CapacityKind::Read => &self.read,
            CapacityKind::Write => &self.write,
        }
    }

    /// Units allowed per window for a kind
    pub fn window_budget(&self, kind: CapacityKind) -> Option<f64> {
        self.lane(kind).budget
    }

    /// Try to charge `estimated` units now
    ///
    /// An estimate larger than the whole budget is clamped to the budget, and
    /// an empty window always admits one operation, so a tiny ceiling slows
    /// the run down but never stalls it.
    pub fn reserve(&self, kind: CapacityKind, estimated: f64) -> Decision {
        let lane = self.lane(kind);
        let now = Instant::now();
        let mut estimated = estimated.max(0.0);
        let mut ledger = lane.lock();

        while let Some(front) = ledger.charges.front() {
            if front.at + self.window <= now {
                ledger.charges.pop_front();
            } else {
                break;
            }
        }

        if let Some(budget) = lane.budget {
            estimated = estimated.min(budget);
            let used: f64 = ledger.charges.iter().map(|c| c.units).sum();

            if used + estimated > budget && !ledger.charges.is_empty() {
                // Walk forward until enough old charges have aged out
                let mut remaining = used;
                let mut delay = self.window;
                for charge in &ledger.charges {
                    remaining -= charge.units;
                    if remaining + estimated <= budget {
                        delay = (charge.at + self.window).saturating_duration_since(now);
                        break;
                    }
                }
                let delay = delay.max(MIN_DELAY);
                debug!(kind = %kind, used, estimated, budget, delay_ms = delay.as_millis() as u64, "Capacity window full");
                return Decision::Wait(delay);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ledger.charges.push_back(Charge {
            id,
            at: now,
            units: estimated,
        });
        ledger.lifetime_units += estimated;

        Decision::Granted(Reservation { kind, id, estimated })
    }

    /// Reserve, sleeping for as long as the governor asks
    pub async fn acquire(&self, kind: CapacityKind, estimated: f64) -> Reservation {
        loop {
            match self.reserve(kind, estimated) {
                Decision::Granted(reservation) => return reservation,
                Decision::Wait(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Replace a reservation's estimate with the actual consumed units
    pub fn settle(&self, reservation: Reservation, actual: f64) {
        let actual = actual.max(0.0);
        let mut ledger = self.lane(reservation.kind).lock();
        let mut charged = None;
        // Recent charges sit at the back
        if let Some(charge) = ledger.charges.iter_mut().rev().find(|c| c.id == reservation.id) {
            charged = Some(charge.units);
            charge.units = actual;
        }
        let previous = charged.unwrap_or(reservation.estimated);
        ledger.lifetime_units += actual - previous;
    }

    /// Units charged in the current window
    pub fn in_window(&self, kind: CapacityKind) -> f64 {
        let now = Instant::now();
        let ledger = self.lane(kind).lock();
        ledger
            .charges
            .iter()
            .filter(|c| c.at + self.window > now)
            .map(|c| c.units)
            .sum()
    }

    /// Units charged since the run started
    pub fn lifetime(&self, kind: CapacityKind) -> f64 {
        self.lane(kind).lock().lifetime_units
    }

    /// How many items of a request fit the budget
    ///
    /// Given a request of `items` items estimated at `estimated` units, returns
    /// the largest item count whose proportional cost fits one window. Never
    /// less than one.
    pub fn viable_items(&self, kind: CapacityKind, estimated: f64, items: usize) -> usize {
        match self.lane(kind).budget {
            Some(budget) if estimated > budget && items > 1 => {
                let scaled = (items as f64 * budget / estimated).floor() as usize;
                scaled.clamp(1, items)
            }
            _ => items.max(1),
        }
    }
}
