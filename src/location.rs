//! Geolocation collaborator contract.
//!
//! Acquisition itself (permissions, hardware polling) lives outside this
//! crate. A [`LocationSource`] hands the driver a channel of
//! [`LocationUpdate`]s, each either a sample or an acquisition error.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::error::LocationError;
use crate::GeoSample;

/// One delivery from a location source.
pub type LocationUpdate = std::result::Result<GeoSample, LocationError>;

/// Result type for location operations.
pub type LocationResult<T> = std::result::Result<T, LocationError>;

/// Source of geolocation samples.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Begin delivering updates. Deliveries preserve the order the platform
    /// produced them in.
    async fn start_tracking(&self) -> LocationResult<mpsc::Receiver<LocationUpdate>>;

    /// Stop delivering, close the channel and return the points delivered
    /// since the last start.
    async fn stop_tracking(&self) -> Vec<GeoSample>;

    /// Suspend deliveries. A source that cannot pause may keep delivering.
    async fn pause_tracking(&self) -> LocationResult<()>;

    async fn resume_tracking(&self) -> LocationResult<()>;

    /// One-shot fix, independent of tracking.
    async fn current_location(&self) -> LocationResult<GeoSample>;

    fn is_tracking(&self) -> bool;

    /// Points delivered since the last start.
    fn tracking_points(&self) -> Vec<GeoSample>;
}

#[derive(Debug, Default)]
struct SimulatorState {
    sender: Option<mpsc::Sender<LocationUpdate>>,
    paused: bool,
    points: Vec<GeoSample>,
    last: Option<GeoSample>,
    start_error: Option<LocationError>,
    control_error: Option<LocationError>,
    starts: usize,
}

/// Scripted location source for tests and demos.
///
/// Samples are pushed with [`emit`](Self::emit). Pausing only changes the
/// reported status: deliveries continue, as with platforms that flush
/// buffered fixes late, and the session is expected to drop them.
#[derive(Debug)]
pub struct SimulatedLocationSource {
    capacity: usize,
    state: Mutex<SimulatorState>,
}

impl Default for SimulatedLocationSource {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SimulatedLocationSource {
    /// Create a source whose channel buffers up to `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SimulatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        // Poisoning is ignored; the script state stays usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `start_tracking` call fail with `error`.
    pub fn fail_next_start(&self, error: LocationError) {
        self.lock().start_error = Some(error);
    }

    /// Make the next `pause_tracking` or `resume_tracking` call fail.
    pub fn fail_next_control(&self, error: LocationError) {
        self.lock().control_error = Some(error);
    }

    /// Deliver a sample. Returns `false` when not tracking or the channel is
    /// full or closed.
    pub fn emit(&self, sample: GeoSample) -> bool {
        let mut state = self.lock();
        state.last = Some(sample);
        let delivered = state
            .sender
            .as_ref()
            .is_some_and(|tx| tx.try_send(Ok(sample)).is_ok());
        if delivered {
            state.points.push(sample);
        }
        delivered
    }

    /// Deliver an acquisition error.
    pub fn emit_error(&self, error: LocationError) -> bool {
        let state = self.lock();
        state
            .sender
            .as_ref()
            .is_some_and(|tx| tx.try_send(Err(error)).is_ok())
    }

    /// Set the fix returned by `current_location`.
    pub fn set_current(&self, sample: GeoSample) {
        self.lock().last = Some(sample);
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Number of successful `start_tracking` calls.
    pub fn start_count(&self) -> usize {
        self.lock().starts
    }
}

#[async_trait]
impl LocationSource for SimulatedLocationSource {
    async fn start_tracking(&self) -> LocationResult<mpsc::Receiver<LocationUpdate>> {
        let mut state = self.lock();
        if let Some(error) = state.start_error.take() {
            debug!("[Location] Simulated start failure: {}", error);
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        state.sender = Some(tx);
        state.paused = false;
        state.points.clear();
        state.starts += 1;
        info!("[Location] Simulated tracking started");
        Ok(rx)
    }

    async fn stop_tracking(&self) -> Vec<GeoSample> {
        let mut state = self.lock();
        state.sender = None;
        state.paused = false;
        info!(
            "[Location] Simulated tracking stopped after {} points",
            state.points.len()
        );
        std::mem::take(&mut state.points)
    }

    async fn pause_tracking(&self) -> LocationResult<()> {
        let mut state = self.lock();
        if let Some(error) = state.control_error.take() {
            return Err(error);
        }
        state.paused = true;
        Ok(())
    }

    async fn resume_tracking(&self) -> LocationResult<()> {
        let mut state = self.lock();
        if let Some(error) = state.control_error.take() {
            return Err(error);
        }
        state.paused = false;
        Ok(())
    }

    async fn current_location(&self) -> LocationResult<GeoSample> {
        self.lock().last.ok_or(LocationError::SignalLost)
    }

    fn is_tracking(&self) -> bool {
        self.lock().sender.is_some()
    }

    fn tracking_points(&self) -> Vec<GeoSample> {
        self.lock().points.clone()
    }
}
