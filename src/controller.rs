//! Single-owner async driver for a tracking session.
//!
//! A [`TrackingController`] is a cheap handle to a session actor running on
//! its own tokio task. The actor is the only code that touches the
//! [`ActivitySession`]; everything that wants to change it sends a message:
//!
//! - location updates arrive on the channel returned by the [`LocationSource`]
//! - caller commands arrive on an mpsc channel with a oneshot reply
//! - a metrics refresh interval, an autosave interval and the first-fix
//!   acquisition deadline fire as timers
//!
//! All five are multiplexed with `tokio::select!`, so no two mutations ever
//! run concurrently and no lock is held across an `.await`. Status is
//! reported on an unbounded [`TrackerEvent`] channel.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

use crate::clock::Clock;
use crate::error::{LocationError, PersistenceError, Result, TrackerError};
use crate::location::{LocationSource, LocationUpdate};
use crate::metrics::MetricsSnapshot;
use crate::session::{ActivitySession, ActivitySummary};
use crate::snapshot::{self, RecoveredSession};
use crate::state::{SessionEvent, SessionState};
use crate::store::{ActivityRepository, SnapshotStore};
use crate::TrackerConfig;

/// Capacity of the command channel.
const COMMAND_BUFFER: usize = 32;

/// Collaborators the controller drives.
#[derive(Clone)]
pub struct TrackingDeps {
    pub location: Arc<dyn LocationSource>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub activities: Arc<dyn ActivityRepository>,
    pub clock: Arc<dyn Clock>,
}

/// Status updates published by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    MetricsUpdated(MetricsSnapshot),
    /// Acquisition trouble. The session keeps running.
    Degraded(LocationError),
    /// No sample arrived within the acquisition window after starting
    AcquisitionTimeout { seconds: u64 },
    /// A periodic snapshot could not be written
    AutosaveFailed(PersistenceError),
    /// The finished activity was handed to the activity repository
    Saved { session_id: String },
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Start(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Finish(Reply<ActivitySummary>),
    Cancel(Reply<()>),
    RetrySave(Reply<ActivitySummary>),
    SaveSnapshot(Reply<()>),
    Metrics(oneshot::Sender<MetricsSnapshot>),
    Session(oneshot::Sender<ActivitySession>),
}

/// Handle to a running session actor.
#[derive(Debug)]
pub struct TrackingController {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl TrackingController {
    /// Spawn an actor for a fresh `IDLE` session.
    ///
    /// Must be called from within a tokio runtime. See [`spawn`](Self::spawn)
    /// for how the returned event receiver must be handled.
    pub fn new_session(
        id: impl Into<String>,
        config: TrackerConfig,
        deps: TrackingDeps,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TrackerEvent>)> {
        let session = ActivitySession::with_speed_window(id, deps.clock.now(), config.speed_window);
        Self::spawn(session, config, deps)
    }

    /// Spawn an actor owning `session`.
    ///
    /// A session that is already `ACTIVE` or `PAUSED` (typically one taken
    /// from a [`RecoveredSession`]) is reattached to the location source and
    /// its timers are started. The session's speed window is set from
    /// `config`.
    ///
    /// The event channel is unbounded and receives a `MetricsUpdated` on
    /// every refresh tick while recording; keep draining it or drop the
    /// receiver.
    pub fn spawn(
        mut session: ActivitySession,
        config: TrackerConfig,
        deps: TrackingDeps,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TrackerEvent>)> {
        config.validate()?;
        session.set_speed_window(config.speed_window);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            "[Tracker] Spawning controller for {} ({})",
            session.id(),
            session.state()
        );
        let actor = SessionActor {
            session,
            config,
            deps,
            events: event_tx,
            samples: None,
            refresh: None,
            autosave: None,
            acquisition: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Ok((
            Self {
                commands: command_tx,
                task,
            },
            event_rx,
        ))
    }

    /// Load and decode the stored crash-recovery snapshot, if any.
    ///
    /// A corrupt snapshot is reported as an error and left in the store;
    /// the caller decides whether to clear it.
    pub async fn recover(snapshots: &dyn SnapshotStore) -> Result<Option<RecoveredSession>> {
        let payload = match snapshots.load().await? {
            Some(p) => p,
            None => return Ok(None),
        };
        match snapshot::decode(&payload) {
            Ok(recovered) => Ok(Some(recovered)),
            Err(e) => {
                warn!("[Tracker] Stored snapshot cannot be recovered: {}", e);
                Err(e)
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TrackerError::ControllerClosed)?;
        rx.await.map_err(|_| TrackerError::ControllerClosed)
    }

    /// `IDLE → STARTING → ACTIVE`.
    ///
    /// If the location source fails to start, the session stays `STARTING`
    /// and the error is returned; calling `start` again retries.
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await?
    }

    /// Stop tracking, complete the session and save it.
    ///
    /// A failed save is returned as a retryable persistence error; the
    /// completed session stays with the actor for [`retry_save`](Self::retry_save).
    pub async fn finish(&self) -> Result<ActivitySummary> {
        self.request(Command::Finish).await?
    }

    /// Stop tracking and cancel the session.
    pub async fn cancel(&self) -> Result<()> {
        self.request(Command::Cancel).await?
    }

    /// Save a completed session again after a failed [`finish`](Self::finish).
    pub async fn retry_save(&self) -> Result<ActivitySummary> {
        self.request(Command::RetrySave).await?
    }

    /// Write a crash-recovery snapshot now. Unlike autosave, failures are
    /// returned.
    pub async fn save_snapshot(&self) -> Result<()> {
        self.request(Command::SaveSnapshot).await?
    }

    /// Metrics as of now.
    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        self.request(Command::Metrics).await
    }

    /// A copy of the session.
    pub async fn session(&self) -> Result<ActivitySession> {
        self.request(Command::Session).await
    }

    /// Stop the actor and wait for it to exit. Tracking is halted first.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.commands);
        self.task.await.map_err(|e| {
            warn!("[Tracker] Controller task ended abnormally: {}", e);
            TrackerError::ControllerClosed
        })
    }
}

struct SessionActor {
    session: ActivitySession,
    config: TrackerConfig,
    deps: TrackingDeps,
    events: mpsc::UnboundedSender<TrackerEvent>,
    samples: Option<mpsc::Receiver<LocationUpdate>>,
    refresh: Option<Interval>,
    autosave: Option<Interval>,
    acquisition: Option<Pin<Box<Sleep>>>,
}

async fn next_update(rx: &mut Option<mpsc::Receiver<LocationUpdate>>) -> Option<LocationUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => pending().await,
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(d) => d.as_mut().await,
        None => pending().await,
    }
}

fn periodic(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        if self.session.state().is_recording() {
            self.reattach().await;
        }

        loop {
            tokio::select! {
                biased;

                // A fix delivered before a command is applied before it
                update = next_update(&mut self.samples), if self.samples.is_some() => {
                    self.on_update(update);
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = expire(&mut self.acquisition), if self.acquisition.is_some() => {
                    self.on_acquisition_timeout();
                }
                _ = tick(&mut self.refresh), if self.refresh.is_some() => {
                    self.on_refresh();
                }
                _ = tick(&mut self.autosave), if self.autosave.is_some() => {
                    if let Err(e) = self.write_snapshot().await {
                        warn!("[Tracker] Autosave of {} failed: {}", self.session.id(), e);
                        if let TrackerError::Persistence(p) = e {
                            self.emit(TrackerEvent::AutosaveFailed(p));
                        }
                    }
                }
            }
        }

        self.halt().await;
        debug!("[Tracker] Controller for {} exited", self.session.id());
    }

    async fn handle(&mut self, command: Command) {
        // Replies are dropped silently if the caller went away
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause().await);
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume().await);
            }
            Command::Finish(reply) => {
                let _ = reply.send(self.finish().await);
            }
            Command::Cancel(reply) => {
                let _ = reply.send(self.cancel().await);
            }
            Command::RetrySave(reply) => {
                let _ = reply.send(self.save_activity().await);
            }
            Command::SaveSnapshot(reply) => {
                let _ = reply.send(self.write_snapshot().await);
            }
            Command::Metrics(reply) => {
                let now = self.now();
                let _ = reply.send(*self.session.refresh_metrics(now));
            }
            Command::Session(reply) => {
                let _ = reply.send(self.session.clone());
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    fn emit(&self, event: TrackerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Apply a lifecycle step and publish the state change.
    fn step(
        &mut self,
        apply: impl FnOnce(&mut ActivitySession, DateTime<Utc>) -> Result<()>,
    ) -> Result<()> {
        let from = self.session.state();
        let now = self.now();
        apply(&mut self.session, now)?;
        let to = self.session.state();
        if from != to {
            self.emit(TrackerEvent::StateChanged { from, to });
        }
        Ok(())
    }

    /// A location control call failed. The session state stands; samples
    /// that keep arriving while paused are dropped by the session.
    fn location_degraded(&self, action: &str, error: LocationError) {
        warn!(
            "[Tracker] Location {} failed for {}: {}",
            action,
            self.session.id(),
            error
        );
        self.emit(TrackerEvent::Degraded(error));
    }

    fn publish_metrics(&self) {
        self.emit(TrackerEvent::MetricsUpdated(*self.session.metrics()));
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn start(&mut self) -> Result<()> {
        match self.session.state() {
            SessionState::Idle => self.step(ActivitySession::start)?,
            SessionState::Starting => {
                info!("[Tracker] Retrying location start for {}", self.session.id());
            }
            from => {
                return Err(TrackerError::InvalidStateTransition {
                    from,
                    event: SessionEvent::Start,
                })
            }
        }

        match self.deps.location.start_tracking().await {
            Ok(rx) => {
                self.samples = Some(rx);
                self.step(ActivitySession::activate)?;
                self.arm_timers();
                self.publish_metrics();
                info!("[Tracker] {} is recording", self.session.id());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[Tracker] Location start failed for {}: {}",
                    self.session.id(),
                    e
                );
                self.emit(TrackerEvent::Degraded(e.clone()));
                Err(e.into())
            }
        }
    }

    async fn pause(&mut self) -> Result<()> {
        self.step(ActivitySession::pause)?;
        if let Err(e) = self.deps.location.pause_tracking().await {
            self.location_degraded("pause", e);
        }
        self.publish_metrics();
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.step(ActivitySession::resume)?;
        if let Err(e) = self.deps.location.resume_tracking().await {
            self.location_degraded("resume", e);
        }
        self.publish_metrics();
        Ok(())
    }

    async fn finish(&mut self) -> Result<ActivitySummary> {
        self.step(ActivitySession::stop)?;
        self.halt().await;
        self.step(ActivitySession::complete)?;
        self.publish_metrics();
        self.save_activity().await
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.session.state().is_recording() {
            self.step(ActivitySession::stop)?;
        }
        self.step(ActivitySession::cancel)?;
        self.halt().await;
        if let Err(e) = self.deps.snapshots.clear().await {
            warn!("[Tracker] Could not clear snapshot after cancel: {}", e);
        }
        info!("[Tracker] {} cancelled", self.session.id());
        Ok(())
    }

    /// Hand the completed session to the activity repository. The snapshot
    /// is cleared only once the save succeeded.
    async fn save_activity(&mut self) -> Result<ActivitySummary> {
        let summary = self
            .session
            .summary()
            .ok_or(TrackerError::InvalidStateTransition {
                from: self.session.state(),
                event: SessionEvent::Complete,
            })?;

        if let Err(e) = self.deps.activities.save(&self.session).await {
            warn!(
                "[Tracker] Saving {} failed, retry with retry_save: {}",
                self.session.id(),
                e
            );
            return Err(e.into());
        }

        if let Err(e) = self.deps.snapshots.clear().await {
            warn!("[Tracker] Could not clear snapshot after save: {}", e);
        }
        info!(
            "[Tracker] Saved {} ({:.0}m)",
            summary.session_id, summary.metrics.distance_meters
        );
        self.emit(TrackerEvent::Saved {
            session_id: summary.session_id.clone(),
        });
        Ok(summary)
    }

    async fn write_snapshot(&mut self) -> Result<()> {
        let now = self.now();
        let payload = match snapshot::encode(&self.session, now) {
            Some(payload) => payload?,
            None => return Ok(()),
        };
        self.deps.snapshots.save(&payload).await?;
        self.session.mark_persisted(now);
        debug!("[Tracker] Snapshot of {} written", self.session.id());
        Ok(())
    }

    // ========================================================================
    // Sources
    // ========================================================================

    fn on_update(&mut self, update: Option<LocationUpdate>) {
        match update {
            Some(Ok(sample)) => {
                self.acquisition = None;
                if let (Some(max), Some(accuracy)) = (self.config.max_accuracy_meters, sample.accuracy) {
                    if accuracy > max {
                        debug!(
                            "[Tracker] Dropped sample with accuracy {:.0}m (max {:.0}m)",
                            accuracy, max
                        );
                        self.emit(TrackerEvent::Degraded(LocationError::AccuracyTooLow {
                            accuracy,
                        }));
                        return;
                    }
                }
                self.session.append_sample(sample);
            }
            Some(Err(e)) => {
                warn!("[Tracker] Location degraded: {}", e);
                self.emit(TrackerEvent::Degraded(e));
            }
            None => {
                warn!("[Tracker] Location stream closed unexpectedly");
                self.samples = None;
                self.emit(TrackerEvent::Degraded(LocationError::ServiceUnavailable));
            }
        }
    }

    fn on_acquisition_timeout(&mut self) {
        self.acquisition = None;
        let seconds = self.config.acquisition_timeout.as_secs();
        warn!(
            "[Tracker] No location fix for {} within {}s",
            self.session.id(),
            seconds
        );
        self.emit(TrackerEvent::AcquisitionTimeout { seconds });
    }

    fn on_refresh(&mut self) {
        let now = self.now();
        let metrics = *self.session.refresh_metrics(now);
        self.emit(TrackerEvent::MetricsUpdated(metrics));
    }

    fn arm_timers(&mut self) {
        self.refresh = Some(periodic(self.config.metrics_refresh_interval));
        self.autosave = Some(periodic(self.config.autosave_interval));
        self.acquisition = Some(Box::pin(sleep(self.config.acquisition_timeout)));
    }

    async fn reattach(&mut self) {
        match self.deps.location.start_tracking().await {
            Ok(rx) => {
                self.samples = Some(rx);
                if self.session.state() == SessionState::Paused {
                    if let Err(e) = self.deps.location.pause_tracking().await {
                        self.location_degraded("pause", e);
                    }
                }
                info!("[Tracker] Reattached {} to location", self.session.id());
            }
            Err(e) => {
                warn!(
                    "[Tracker] Could not reattach {} to location: {}",
                    self.session.id(),
                    e
                );
                self.emit(TrackerEvent::Degraded(e));
            }
        }
        self.arm_timers();
    }

    /// Drop the subscription and every timer.
    async fn halt(&mut self) {
        self.samples = None;
        self.refresh = None;
        self.autosave = None;
        self.acquisition = None;
        if self.deps.location.is_tracking() {
            let points = self.deps.location.stop_tracking().await;
            debug!("[Tracker] Location stopped ({} points delivered)", points.len());
        }
    }
}
