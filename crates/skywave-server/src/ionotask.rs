use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use skywave_propagation::engine::{ConditionsUpdate, StateSnapshot};
use skywave_propagation::GridSquare;
use skywave_protocol::messages::{ControlMessage, PropagationUpdate, SignalQualityUpdate};
use skywave_protocol::types::SessionId;

use crate::bus::Event;
use crate::state::{HandshakeState, ServerState};

/// A reading from an external solar-weather feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolarReading {
    pub solar_flux_index: Option<u16>,
    pub k_index: Option<u8>,
}

/// External ingest interface. Implementations fetch SFI/K from wherever
/// (SWPC, DX cluster views); only the callback shape is part of the core.
#[async_trait]
pub trait SolarDataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means the source had nothing new (or failed); the tick moves
    /// on to the next source.
    async fn fetch(&self) -> Option<SolarReading>;
}

/// Periodic ionospheric refresh task.
///
/// Re-entrant-safe: a tick that fires while the previous one still runs is
/// skipped, never queued. The task dies with the server (aborted handle).
pub struct IonosphericUpdater {
    state: Arc<ServerState>,
    sources: Vec<Arc<dyn SolarDataSource>>,
    ticking: AtomicBool,
}

impl IonosphericUpdater {
    pub fn new(state: Arc<ServerState>, sources: Vec<Arc<dyn SolarDataSource>>) -> Self {
        Self {
            state,
            sources,
            ticking: AtomicBool::new(false),
        }
    }

    /// Run forever on the configured interval.
    pub async fn run(self: Arc<Self>) {
        let minutes = self.state.config.hf_propagation.update_interval.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(minutes as u64 * 60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(minutes, "ionospheric updater running");
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One refresh pass. Public so the admin override path and tests can
    /// drive it directly.
    pub async fn tick(&self) {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("ionospheric tick still running, coalescing");
            return;
        }

        let mut last_snapshot: Option<StateSnapshot> = None;

        if self.state.config.hf_propagation.use_external_data {
            for source in &self.sources {
                match source.fetch().await {
                    Some(reading) => {
                        self.state.bus.publish(Event::ExternalDataUpdated {
                            source: source.name().to_string(),
                        });
                        if let Some(snapshot) = self.state.engine.apply_update(ConditionsUpdate {
                            solar_flux_index: reading.solar_flux_index,
                            k_index: reading.k_index,
                            ..Default::default()
                        }) {
                            last_snapshot = Some(snapshot);
                        }
                    }
                    None => debug!(source = source.name(), "no external reading"),
                }
            }
        }

        if let Some(snapshot) = self.state.engine.tick_auto_season(Utc::now()) {
            last_snapshot = Some(snapshot);
        }

        if let Some(snapshot) = last_snapshot {
            propagate_snapshot(&self.state, snapshot).await;
        }

        self.ticking.store(false, Ordering::Release);
    }
}

/// Fan a state change out: bus events, dynamic band links, the
/// PropagationUpdate broadcast, and per-session quality recomputation.
///
/// The epoch in the snapshot was incremented (and the pair cache cleared)
/// before this runs, so everything observers recompute lands under the new
/// epoch.
pub async fn propagate_snapshot(state: &Arc<ServerState>, snapshot: StateSnapshot) {
    state.bus.publish(Event::PropagationUpdated {
        epoch: snapshot.epoch,
    });
    state.bus.publish(Event::MufChanged {
        muf_mhz: snapshot.muf_reference_mhz,
    });

    // Re-derive the dynamic link overlay from the open-bands set.
    let changed_channels = {
        let mut topology = state.topology.write().await;
        topology.tree.apply_open_bands(&snapshot.open_bands)
    };
    if !changed_channels.is_empty() {
        state.bump_routing_epoch();
        let topology = state.topology.read().await;
        for channel in changed_channels {
            if let Some(entry) = topology.tree.get(channel) {
                state.broadcast(&ControlMessage::ChannelState(entry.to_state()), None);
            }
        }
    }

    state.broadcast(
        &ControlMessage::PropagationUpdate(PropagationUpdate {
            solar_flux_index: snapshot.state.solar_flux_index,
            k_index: snapshot.state.k_index,
            season: snapshot.state.season,
            muf_reference_mhz: snapshot.muf_reference_mhz as f32,
            epoch: snapshot.epoch,
            open_bands: snapshot.open_bands.clone(),
        }),
        None,
    );

    recompute_signal_quality(state).await;
}

/// Recompute pair strengths for every located session and push quality
/// hints. Fanned out over a bounded worker set; one failing pair cannot
/// stall the rest.
async fn recompute_signal_quality(state: &Arc<ServerState>) {
    let located: Vec<(SessionId, GridSquare)> = state
        .sessions
        .iter()
        .filter(|s| s.handshake == HandshakeState::Authenticated)
        .filter_map(|s| s.grid.clone().map(|g| (s.id, g)))
        .collect();
    if located.len() < 2 {
        return;
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut handles = Vec::new();

    for (speaker, speaker_grid) in located.clone() {
        for (receiver, receiver_grid) in &located {
            if *receiver == speaker {
                continue;
            }
            let permit = semaphore.clone().acquire_owned();
            let state = state.clone();
            let speaker_grid = speaker_grid.clone();
            let receiver_grid = receiver_grid.clone();
            let receiver = *receiver;
            handles.push(tokio::spawn(async move {
                let _permit = match permit.await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let strength =
                    state
                        .engine
                        .signal_strength(&speaker_grid, &receiver_grid, Utc::now());
                state.bus.publish(Event::SignalStrengthChanged {
                    grid_a: speaker_grid.as_str().to_string(),
                    grid_b: receiver_grid.as_str().to_string(),
                    strength,
                });
                let band = state.engine.recommend_band(&speaker_grid, &receiver_grid);
                state.send_to(
                    receiver,
                    &ControlMessage::SignalQualityUpdate(SignalQualityUpdate {
                        speaker_session: speaker,
                        strength: strength as f32,
                        recommended_band: band,
                    }),
                );
            }));
        }
    }
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("signal quality task panicked: {e}");
        }
    }
}
