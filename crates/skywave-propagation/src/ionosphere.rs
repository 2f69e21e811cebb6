use serde::{Deserialize, Serialize};

use skywave_protocol::types::Season;

use crate::grid::EARTH_RADIUS_KM;

/// Bounds for the solar flux index accepted from config and updates.
pub const SFI_MIN: u16 = 60;
pub const SFI_MAX: u16 = 300;

/// Reference distance (km) used when summarizing the MUF for clients.
pub const MUF_REFERENCE_DISTANCE_KM: f64 = 3000.0;

/// Global ionospheric state. One instance per server, owned by the
/// propagation engine and mutated only through it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IonosphericState {
    /// Solar flux index, clamped to [60, 300].
    pub solar_flux_index: u16,
    /// Geomagnetic K-index, 0-9.
    pub k_index: u8,
    pub season: Season,
    /// When set, season and day/night follow the wall clock instead of
    /// the configured season.
    pub auto_time: bool,
}

impl Default for IonosphericState {
    fn default() -> Self {
        Self {
            solar_flux_index: 120,
            k_index: 2,
            season: Season::Winter,
            auto_time: true,
        }
    }
}

impl IonosphericState {
    pub fn new(solar_flux_index: u16, k_index: u8, season: Season, auto_time: bool) -> Self {
        Self {
            solar_flux_index: solar_flux_index.clamp(SFI_MIN, SFI_MAX),
            k_index: k_index.min(9),
            season,
            auto_time,
        }
    }

    /// Critical frequency of the F2 layer at vertical incidence, MHz.
    pub fn fof2(&self) -> f64 {
        let solar_factor = 1.0 + (self.solar_flux_index as f64 - 100.0) / 100.0;
        let geomagnetic_factor = 1.0 - 0.5 * self.k_index as f64 / 9.0;
        let season_factor = match self.season {
            Season::Winter => 0.8,
            Season::Spring => 1.0,
            Season::Summer => 1.2,
            Season::Fall => 1.0,
        };
        5.0 * solar_factor * geomagnetic_factor * season_factor
    }

    /// Virtual F-layer height, km.
    pub fn f_layer_height(&self) -> f64 {
        let solar_factor = 1.0 + (self.solar_flux_index as f64 - 100.0) / 200.0;
        let geomagnetic_factor = 1.0 + 0.2 * self.k_index as f64 / 9.0;
        let season_factor = match self.season {
            Season::Winter => 1.1,
            Season::Spring => 1.0,
            Season::Summer => 0.9,
            Season::Fall => 1.0,
        };
        300.0 * solar_factor * geomagnetic_factor * season_factor
    }

    /// Maximum usable frequency for a path of the given length, MHz.
    ///
    /// The path is split into the fewest hops the F-layer geometry allows;
    /// the take-off angle of one hop then sets the secant gain over foF2.
    pub fn muf(&self, distance_km: f64) -> f64 {
        let fof2 = self.fof2();
        if distance_km <= 0.0 {
            return fof2;
        }
        let h = self.f_layer_height();
        let max_hop = 2.0 * (h * 2.0 * EARTH_RADIUS_KM).sqrt();
        let hops = (distance_km / max_hop).ceil().max(1.0);
        // Angle of incidence from vertical at the reflection point of one hop.
        let half_hop = distance_km / (2.0 * hops);
        let incidence = (half_hop / h).atan();
        fof2 / incidence.cos()
    }

    /// MUF at the 3000 km reference distance, for status broadcasts.
    pub fn muf_reference(&self) -> f64 {
        self.muf(MUF_REFERENCE_DISTANCE_KM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> IonosphericState {
        IonosphericState::new(100, 0, Season::Spring, false)
    }

    #[test]
    fn fof2_baseline() {
        // SFI 100, K 0, spring: all factors are 1.
        assert!((quiet().fof2() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn fof2_scales_with_solar_flux() {
        let high = IonosphericState::new(200, 0, Season::Spring, false);
        assert!((high.fof2() - 10.0).abs() < 1e-9);
        let low = IonosphericState::new(60, 0, Season::Spring, false);
        assert!((low.fof2() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn fof2_degrades_with_k_index() {
        let storm = IonosphericState::new(100, 9, Season::Spring, false);
        assert!((storm.fof2() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn fof2_season_factors() {
        let winter = IonosphericState::new(100, 0, Season::Winter, false);
        let summer = IonosphericState::new(100, 0, Season::Summer, false);
        assert!((winter.fof2() - 4.0).abs() < 1e-9);
        assert!((summer.fof2() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn layer_height_baseline() {
        assert!((quiet().f_layer_height() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn layer_height_rises_in_winter_and_storms() {
        let winter = IonosphericState::new(100, 0, Season::Winter, false);
        assert!((winter.f_layer_height() - 330.0).abs() < 1e-9);
        let storm = IonosphericState::new(100, 9, Season::Spring, false);
        assert!((storm.f_layer_height() - 360.0).abs() < 1e-9);
    }

    #[test]
    fn muf_exceeds_fof2_for_oblique_paths() {
        let state = quiet();
        assert!(state.muf(3000.0) > state.fof2());
        assert!(state.muf(500.0) > state.fof2());
    }

    #[test]
    fn muf_zero_distance_is_vertical_incidence() {
        let state = quiet();
        assert!((state.muf(0.0) - state.fof2()).abs() < 1e-9);
    }

    #[test]
    fn muf_monotonic_in_hop_length() {
        // Within a single hop, longer paths have lower take-off angles and
        // therefore higher MUF.
        let state = quiet();
        assert!(state.muf(2000.0) > state.muf(1000.0));
        assert!(state.muf(1000.0) > state.muf(300.0));
    }

    #[test]
    fn muf_high_sfi_reaches_ten_meters() {
        let state = IonosphericState::new(200, 1, Season::Spring, false);
        assert!(state.muf(3000.0) > 28.0, "muf {}", state.muf(3000.0));
    }

    #[test]
    fn constructor_clamps_inputs() {
        let s = IonosphericState::new(1000, 42, Season::Fall, false);
        assert_eq!(s.solar_flux_index, SFI_MAX);
        assert_eq!(s.k_index, 9);
        let s = IonosphericState::new(10, 0, Season::Fall, false);
        assert_eq!(s.solar_flux_index, SFI_MIN);
    }
}
