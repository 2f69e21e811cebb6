use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use tracing::debug;

use skywave_protocol::types::{Band, Season};

use crate::bands;
use crate::fading::FadingSample;
use crate::grid::{distance_km, GridSquare};
use crate::ionosphere::IonosphericState;
use crate::signal;

/// Snapshot of the ionospheric state after a mutation, for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: IonosphericState,
    pub epoch: u64,
    pub muf_reference_mhz: f64,
    pub open_bands: Vec<Band>,
}

/// A requested change to the ionospheric state; `None` fields are unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionsUpdate {
    pub solar_flux_index: Option<u16>,
    pub k_index: Option<u8>,
    pub season: Option<Season>,
    pub auto_time: Option<bool>,
}

struct PairCache {
    /// Epoch the cached entries were computed under.
    epoch: u64,
    entries: HashMap<(String, String), f64>,
}

/// The propagation engine: ionospheric state, epoch counter and pair cache.
///
/// All methods are cheap and synchronous; callers on the voice path only ever
/// touch the cache mutex. Mutations go through [`apply_update`] which bumps
/// the epoch before clearing the cache, so any entry observed under an epoch
/// is guaranteed to have been computed under that epoch.
///
/// [`apply_update`]: PropagationEngine::apply_update
pub struct PropagationEngine {
    state: Mutex<IonosphericState>,
    epoch: AtomicU64,
    cache: Mutex<PairCache>,
}

impl PropagationEngine {
    pub fn new(initial: IonosphericState) -> Self {
        Self {
            state: Mutex::new(initial),
            epoch: AtomicU64::new(0),
            cache: Mutex::new(PairCache {
                epoch: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Current state, copied out.
    pub fn state(&self) -> IonosphericState {
        *self.state.lock().expect("ionospheric state lock poisoned")
    }

    /// Current ionospheric epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Number of cached pair entries. Exposed for tests and stats.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("pair cache lock poisoned").entries.len()
    }

    /// Apply a partial update. Returns a snapshot when anything changed,
    /// `None` when the update was a no-op.
    ///
    /// The epoch increment happens before the cache clear and before the
    /// returned snapshot can reach any subscriber.
    pub fn apply_update(&self, update: ConditionsUpdate) -> Option<StateSnapshot> {
        let mut state = self.state.lock().expect("ionospheric state lock poisoned");
        let previous = *state;

        if let Some(sfi) = update.solar_flux_index {
            *state = IonosphericState::new(sfi, state.k_index, state.season, state.auto_time);
        }
        if let Some(k) = update.k_index {
            *state = IonosphericState::new(state.solar_flux_index, k, state.season, state.auto_time);
        }
        if let Some(season) = update.season {
            state.season = season;
        }
        if let Some(auto) = update.auto_time {
            state.auto_time = auto;
        }

        if *state == previous {
            return None;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut cache = self.cache.lock().expect("pair cache lock poisoned");
            cache.epoch = epoch;
            cache.entries.clear();
        }

        let snapshot = StateSnapshot {
            state: *state,
            epoch,
            muf_reference_mhz: state.muf_reference(),
            open_bands: bands::open_bands(crate::ionosphere::MUF_REFERENCE_DISTANCE_KM, &state),
        };
        debug!(
            sfi = state.solar_flux_index,
            k = state.k_index,
            epoch,
            "ionospheric conditions changed"
        );
        Some(snapshot)
    }

    /// Refresh the season from the wall clock when `auto_time` is set.
    /// Returns a snapshot when the season actually rolled over.
    pub fn tick_auto_season(&self, now: DateTime<Utc>) -> Option<StateSnapshot> {
        let state = self.state();
        if !state.auto_time {
            return None;
        }
        let season = Season::from_month(now.month());
        if season == state.season {
            return None;
        }
        self.apply_update(ConditionsUpdate {
            season: Some(season),
            ..Default::default()
        })
    }

    /// Signal strength for a pair at an instant, memoized under the current
    /// epoch. Symmetric: the (b, a) entry is inserted alongside (a, b).
    pub fn signal_strength(&self, a: &GridSquare, b: &GridSquare, at: DateTime<Utc>) -> f64 {
        let current_epoch = self.epoch.load(Ordering::Acquire);
        let key = (a.as_str().to_string(), b.as_str().to_string());

        {
            let mut cache = self.cache.lock().expect("pair cache lock poisoned");
            if cache.epoch != current_epoch {
                cache.epoch = current_epoch;
                cache.entries.clear();
            } else if let Some(&strength) = cache.entries.get(&key) {
                return strength;
            }
        }

        let state = self.state();
        let stochastic = rand::thread_rng().gen::<f64>();
        let strength = signal::compute_strength(&state, a, b, at, stochastic);

        let mut cache = self.cache.lock().expect("pair cache lock poisoned");
        // A concurrent epoch change wins; do not repopulate a stale cache.
        if cache.epoch == self.epoch.load(Ordering::Acquire) {
            cache
                .entries
                .insert((key.1.clone(), key.0.clone()), strength);
            cache.entries.insert(key, strength);
        }
        strength
    }

    /// Band recommendation for a pair under current conditions.
    pub fn recommend_band(&self, a: &GridSquare, b: &GridSquare) -> Band {
        bands::recommend_band(distance_km(a, b), &self.state())
    }

    /// Band recommendation for a raw distance.
    pub fn recommend_band_for_distance(&self, distance_km: f64) -> Band {
        bands::recommend_band(distance_km, &self.state())
    }

    /// Sample the fading model for a previously obtained strength.
    pub fn fading(&self, strength: f64) -> FadingSample {
        FadingSample::sample(strength)
    }
}

impl Default for PropagationEngine {
    fn default() -> Self {
        Self::new(IonosphericState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn engine() -> PropagationEngine {
        PropagationEngine::new(IonosphericState::new(150, 2, Season::Summer, false))
    }

    #[test]
    fn strength_is_memoized_per_epoch() {
        let engine = engine();
        let a = GridSquare::parse("JO59jw").unwrap();
        let b = GridSquare::parse("FN31pr").unwrap();
        let first = engine.signal_strength(&a, &b, noon());
        // The stochastic factor would change on recomputation; a cache hit
        // returns the identical value.
        for _ in 0..10 {
            assert_eq!(engine.signal_strength(&a, &b, noon()), first);
        }
        assert_eq!(engine.cache_len(), 2);
    }

    #[test]
    fn strength_lookup_is_symmetric() {
        let engine = engine();
        let a = GridSquare::parse("JO59jw").unwrap();
        let b = GridSquare::parse("FN31pr").unwrap();
        let ab = engine.signal_strength(&a, &b, noon());
        let ba = engine.signal_strength(&b, &a, noon());
        assert_eq!(ab, ba);
    }

    #[test]
    fn update_bumps_epoch_and_clears_cache() {
        let engine = engine();
        let a = GridSquare::parse("JO59jw").unwrap();
        let b = GridSquare::parse("FN31pr").unwrap();
        engine.signal_strength(&a, &b, noon());
        assert_eq!(engine.cache_len(), 2);
        let before = engine.epoch();

        let snapshot = engine
            .apply_update(ConditionsUpdate {
                solar_flux_index: Some(200),
                ..Default::default()
            })
            .expect("state changed");

        assert_eq!(snapshot.epoch, before + 1);
        assert_eq!(engine.epoch(), before + 1);
        assert_eq!(engine.cache_len(), 0);
        assert_eq!(snapshot.state.solar_flux_index, 200);
        assert!(!snapshot.open_bands.is_empty());
    }

    #[test]
    fn noop_update_returns_none() {
        let engine = engine();
        let before = engine.epoch();
        assert!(engine
            .apply_update(ConditionsUpdate {
                solar_flux_index: Some(150),
                k_index: Some(2),
                ..Default::default()
            })
            .is_none());
        assert_eq!(engine.epoch(), before);
    }

    #[test]
    fn each_field_triggers_an_epoch() {
        let engine = engine();
        assert!(engine
            .apply_update(ConditionsUpdate {
                k_index: Some(7),
                ..Default::default()
            })
            .is_some());
        assert!(engine
            .apply_update(ConditionsUpdate {
                season: Some(Season::Winter),
                ..Default::default()
            })
            .is_some());
        assert_eq!(engine.epoch(), 2);
    }

    #[test]
    fn auto_season_rolls_over() {
        let engine = PropagationEngine::new(IonosphericState::new(150, 2, Season::Winter, true));
        let july = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let snapshot = engine.tick_auto_season(july).expect("season changed");
        assert_eq!(snapshot.state.season, Season::Summer);
        // Second tick in the same month is a no-op.
        assert!(engine.tick_auto_season(july).is_none());
    }

    #[test]
    fn auto_season_disabled_is_inert() {
        let engine = engine();
        let january = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(engine.tick_auto_season(january).is_none());
    }

    #[test]
    fn recommend_band_short_path() {
        let engine = engine();
        let a = GridSquare::parse("JO59jw").unwrap();
        let b = GridSquare::parse("JO59aa").unwrap();
        assert_eq!(engine.recommend_band(&a, &b), Band::Band20m);
        assert_eq!(engine.recommend_band_for_distance(400.0), Band::Band20m);
    }
}
