//! Timer driven year animation.
//!
//! Starting the animator draws every year's bubble as an overview; it then
//! walks the year sequence one tick at a time, rendering each year into its
//! [`RenderState`]. When the sequence runs out the timer is
//! cancelled and per-year controls become available; selecting a year renders
//! it straight away and never restarts the timer.
//!
//! Time comes from a [`Clock`], so tests and offline export drive the loop with
//! a [`VirtualClock`] instead of waiting on real time.

use crate::error::{MapError, MapResult};
use crate::scene::{FrameDelta, RenderState};
use crate::types::YearAggregate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Monotonic time source, measured from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    nanos: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationState {
    Idle,
    Advancing,
    Manual,
    Done,
    Disposed,
}

/// One clickable year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct YearControl {
    pub year: i32,
    pub active: bool,
}

#[derive(Debug)]
struct IntervalTimer {
    period: Duration,
    next_due: Duration,
}

pub struct Animator<C: Clock> {
    years: Vec<i32>,
    aggregates: Arc<BTreeMap<i32, YearAggregate>>,
    scene: RenderState,
    clock: C,
    interval: Duration,
    state: AnimationState,
    cursor: usize,
    timer: Option<IntervalTimer>,
    selected: Option<i32>,
    controls_visible: bool,
}

impl<C: Clock> Animator<C> {
    pub fn new(
        years: Vec<i32>,
        aggregates: Arc<BTreeMap<i32, YearAggregate>>,
        scene: RenderState,
        clock: C,
        interval: Duration,
    ) -> MapResult<Self> {
        if interval.is_zero() {
            return Err(MapError::invalid_argument("animation interval must be positive"));
        }
        Ok(Self {
            years,
            aggregates,
            scene,
            clock,
            interval,
            state: AnimationState::Idle,
            cursor: 0,
            timer: None,
            selected: None,
            controls_visible: false,
        })
    }

    pub fn state(&self) -> AnimationState {
        self.state
    }

    pub fn scene(&self) -> &RenderState {
        &self.scene
    }

    pub fn years(&self) -> &[i32] {
        &self.years
    }

    pub fn timer_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Show the overview and begin automatic progression. Only valid from `Idle`.
    pub fn start(&mut self) -> MapResult<()> {
        if self.state != AnimationState::Idle {
            return Err(MapError::invalid_argument(format!(
                "animation already started (state {:?})",
                self.state
            )));
        }
        self.state = AnimationState::Advancing;
        let shown = self.scene.render_overview(self.aggregates.values());
        debug!(bubbles = shown, "overview before first tick");
        if self.years.is_empty() {
            self.finish();
            return Ok(());
        }
        self.timer = Some(IntervalTimer {
            period: self.interval,
            next_due: self.clock.now() + self.interval,
        });
        info!(years = self.years.len(), interval_ms = self.interval.as_millis() as u64, "animation started");
        Ok(())
    }

    /// Fire every tick due at the clock's current time. Returns the frames
    /// rendered, in order.
    pub fn poll(&mut self) -> Vec<FrameDelta> {
        let mut frames = Vec::new();
        self.poll_with(|delta, _| frames.push(delta.clone()));
        frames
    }

    /// Like [`Animator::poll`], handing each frame and the scene right after
    /// it was rendered to `on_frame`.
    pub fn poll_with(&mut self, mut on_frame: impl FnMut(&FrameDelta, &RenderState)) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        loop {
            let due = match &self.timer {
                Some(timer) if timer.next_due <= now => timer.next_due,
                _ => break,
            };
            let delta = self.tick();
            fired += 1;
            on_frame(&delta, &self.scene);
            if let Some(timer) = self.timer.as_mut() {
                timer.next_due = due + timer.period;
            }
        }
        fired
    }

    fn tick(&mut self) -> FrameDelta {
        let year = self.years[self.cursor];
        let delta = self.scene.render_year(year, self.aggregates.get(&year));
        self.cursor += 1;
        if self.cursor >= self.years.len() {
            self.finish();
        }
        delta
    }

    fn finish(&mut self) {
        self.cancel_timer();
        self.state = AnimationState::Done;
        self.controls_visible = true;
        info!("animation finished; year controls available");
    }

    fn cancel_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(_) => {
                debug!("animation timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Jump to `year` immediately. Stops automatic progression for good.
    pub fn select(&mut self, year: i32) -> MapResult<FrameDelta> {
        if self.state == AnimationState::Disposed {
            return Err(MapError::invalid_argument("animation has been disposed"));
        }
        if !self.years.contains(&year) {
            return Err(MapError::invalid_argument(format!(
                "year {year} is not part of the sequence"
            )));
        }
        if self.cancel_timer() {
            info!(year, "manual selection cancelled automatic progression");
        }
        self.state = AnimationState::Manual;
        self.controls_visible = true;
        self.selected = Some(year);
        Ok(self.scene.render_year(year, self.aggregates.get(&year)))
    }

    /// One control per year once the automatic run is over.
    pub fn controls(&self) -> Option<Vec<YearControl>> {
        if !self.controls_visible || self.state == AnimationState::Disposed {
            return None;
        }
        Some(
            self.years
                .iter()
                .map(|&year| YearControl {
                    year,
                    active: self.selected == Some(year),
                })
                .collect(),
        )
    }

    /// Cancel the timer and release the scene.
    pub fn dispose(&mut self) {
        if self.state == AnimationState::Disposed {
            return;
        }
        self.cancel_timer();
        self.scene.dispose();
        self.controls_visible = false;
        self.state = AnimationState::Disposed;
    }
}

impl<C: Clock> Drop for Animator<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}
