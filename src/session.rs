//! Live animation session shared by the dev server's handlers.

use crate::animation::{AnimationState, Animator, SystemClock, YearControl};
use crate::error::MapResult;
use crate::scene::{FrameDelta, RenderState};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// What a browser needs to show one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameEvent {
    pub year: Option<i32>,
    pub label: String,
    pub state: AnimationState,
    pub controls: Option<Vec<YearControl>>,
    pub delta: Option<FrameDelta>,
    pub svg: String,
}

impl FrameEvent {
    fn capture(delta: Option<&FrameDelta>, scene: &RenderState, state: AnimationState, controls: Option<Vec<YearControl>>) -> Self {
        Self {
            year: scene.current_year(),
            label: scene.label().to_string(),
            state,
            controls,
            delta: delta.cloned(),
            svg: scene.to_svg(),
        }
    }
}

pub struct Session {
    animator: Mutex<Animator<SystemClock>>,
    frames: broadcast::Sender<FrameEvent>,
}

impl Session {
    pub fn new(animator: Animator<SystemClock>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(64);
        Arc::new(Self {
            animator: Mutex::new(animator),
            frames,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Animator<SystemClock>> {
        self.animator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.frames.subscribe()
    }

    pub fn years(&self) -> Vec<i32> {
        self.lock().years().to_vec()
    }

    pub fn current(&self) -> FrameEvent {
        let anim = self.lock();
        FrameEvent::capture(None, anim.scene(), anim.state(), anim.controls())
    }

    /// Start the animation and publish its overview frame.
    pub fn start(&self) -> MapResult<()> {
        let mut anim = self.lock();
        anim.start()?;
        let event = FrameEvent::capture(None, anim.scene(), anim.state(), anim.controls());
        drop(anim);
        let _ = self.frames.send(event);
        Ok(())
    }

    /// Fire due ticks and publish each rendered frame.
    pub fn pump(&self) -> usize {
        let mut anim = self.lock();
        let mut events = Vec::new();
        anim.poll_with(|delta, scene| {
            events.push(FrameEvent::capture(Some(delta), scene, AnimationState::Advancing, None));
        });
        // The last frame of the run already sees the final state.
        if let Some(last) = events.last_mut() {
            last.state = anim.state();
            last.controls = anim.controls();
        }
        drop(anim);

        let fired = events.len();
        for event in events {
            let _ = self.frames.send(event);
        }
        fired
    }

    pub fn select(&self, year: i32) -> MapResult<FrameEvent> {
        let mut anim = self.lock();
        let delta = anim.select(year)?;
        let event = FrameEvent::capture(Some(&delta), anim.scene(), anim.state(), anim.controls());
        drop(anim);
        let _ = self.frames.send(event.clone());
        info!(year, "year selected");
        Ok(event)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.lock().state(),
            AnimationState::Done | AnimationState::Manual | AnimationState::Disposed
        )
    }

    pub fn dispose(&self) {
        self.lock().dispose();
        debug!("session disposed");
    }
}

/// Start the animation and keep pumping it until it stops advancing.
pub async fn drive(session: Arc<Session>, resolution: Duration) -> MapResult<()> {
    session.start()?;
    let mut ticker = tokio::time::interval(resolution);
    loop {
        ticker.tick().await;
        session.pump();
        if session.is_finished() {
            break;
        }
    }
    info!("automatic progression over");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scene::tests::{aggregate, scene};
    use crate::types::YearAggregate;
    use std::collections::BTreeMap;

    pub(crate) fn session(years: Vec<i32>, interval: Duration) -> Arc<Session> {
        let aggregates: BTreeMap<i32, YearAggregate> =
            years.iter().map(|&y| (y, aggregate(y, 50_000, &["A"]))).collect();
        let animator = Animator::new(years, Arc::new(aggregates), scene(), SystemClock::new(), interval).unwrap();
        Session::new(animator)
    }

    #[tokio::test]
    async fn drive_publishes_every_frame_then_stops() {
        let session = session(vec![1930, 1934, 1938], Duration::from_millis(10));
        let mut rx = session.subscribe();
        drive(session.clone(), Duration::from_millis(2)).await.unwrap();

        let overview = rx.try_recv().unwrap();
        assert_eq!(overview.year, None);
        assert!(overview.delta.is_none());
        assert_eq!(overview.svg.matches("<circle").count(), 3);

        let mut years = Vec::new();
        while let Ok(event) = rx.try_recv() {
            years.push(event.year.unwrap());
            if event.year == Some(1938) {
                assert_eq!(event.state, AnimationState::Done);
                assert_eq!(event.controls.as_ref().map(Vec::len), Some(3));
            }
        }
        assert_eq!(years, vec![1930, 1934, 1938]);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn select_publishes_and_reports_errors() {
        let session = session(vec![1930, 1934], Duration::from_secs(60));
        session.start().unwrap();
        let mut rx = session.subscribe();

        let event = session.select(1934).unwrap();
        assert_eq!(event.year, Some(1934));
        assert_eq!(event.state, AnimationState::Manual);
        assert!(event.svg.contains("World Cup 1934"));
        assert_eq!(rx.try_recv().unwrap().year, Some(1934));

        assert!(session.select(2050).is_err());
        assert_eq!(session.pump(), 0);
    }

    #[test]
    fn current_before_start_is_blank() {
        let session = session(vec![1930], Duration::from_secs(1));
        let event = session.current();
        assert_eq!(event.year, None);
        assert_eq!(event.state, AnimationState::Idle);
        assert!(event.controls.is_none());
    }
}
