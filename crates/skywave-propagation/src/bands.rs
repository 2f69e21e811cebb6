use skywave_protocol::types::Band;

use crate::ionosphere::IonosphericState;

/// Pick the band a pair at this distance should try under the given
/// ionospheric conditions.
///
/// Short paths always get 20 m regardless of MUF; mid-range paths pick from
/// a three-band split; long paths walk the full ladder downward until the
/// band fits under the MUF.
pub fn recommend_band(distance_km: f64, state: &IonosphericState) -> Band {
    if distance_km < 500.0 {
        return Band::Band20m;
    }

    let muf = state.muf(distance_km);

    if distance_km < 2000.0 {
        return if muf > 21.0 {
            Band::Band15m
        } else if muf > 14.0 {
            Band::Band20m
        } else {
            Band::Band40m
        };
    }

    for band in Band::LADDER {
        if muf > band.frequency_mhz() {
            return band;
        }
    }
    Band::Band160m
}

/// Bands currently usable at a distance: carrier frequency under the MUF.
pub fn open_bands(distance_km: f64, state: &IonosphericState) -> Vec<Band> {
    let muf = state.muf(distance_km);
    Band::LADDER
        .iter()
        .copied()
        .filter(|band| band.frequency_mhz() <= muf)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywave_protocol::types::Season;

    fn state(sfi: u16, k: u8) -> IonosphericState {
        IonosphericState::new(sfi, k, Season::Spring, false)
    }

    #[test]
    fn short_path_is_always_twenty_meters() {
        assert_eq!(recommend_band(400.0, &state(60, 9)), Band::Band20m);
        assert_eq!(recommend_band(400.0, &state(300, 0)), Band::Band20m);
        assert_eq!(recommend_band(0.0, &state(120, 3)), Band::Band20m);
    }

    #[test]
    fn mid_range_splits_on_muf() {
        // Quiet sun: MUF at 1500 km stays under 21 MHz.
        let quiet = state(80, 4);
        assert!(matches!(
            recommend_band(1500.0, &quiet),
            Band::Band20m | Band::Band40m
        ));

        // Active sun pushes the same path to 15 m.
        let active = state(250, 0);
        assert!(active.muf(1500.0) > 21.0);
        assert_eq!(recommend_band(1500.0, &active), Band::Band15m);
    }

    #[test]
    fn long_path_high_sfi_reaches_ten_or_twelve() {
        let active = state(200, 1);
        let band = recommend_band(3000.0, &active);
        assert!(
            matches!(band, Band::Band10m | Band::Band12m),
            "got {band:?} at muf {}",
            active.muf(3000.0)
        );
    }

    #[test]
    fn long_path_storm_steps_down_the_ladder() {
        let storm = state(60, 9);
        let band = recommend_band(10000.0, &storm);
        // Depressed MUF: nothing above 30 m should come back.
        assert!(band.frequency_mhz() <= Band::Band30m.frequency_mhz(), "got {band:?}");
    }

    #[test]
    fn ladder_bottoms_out_at_one_sixty() {
        // MUF below every carrier frequency still returns a band.
        let mut floor = state(60, 9);
        floor.season = Season::Winter;
        let band = recommend_band(20000.0, &floor);
        assert!(Band::LADDER.contains(&band));
    }

    #[test]
    fn open_bands_sorted_and_bounded_by_muf() {
        let active = state(200, 1);
        let bands = open_bands(3000.0, &active);
        assert!(!bands.is_empty());
        let muf = active.muf(3000.0);
        for band in &bands {
            assert!(band.frequency_mhz() <= muf);
        }
        // 160 m is open under practically any conditions.
        assert!(bands.contains(&Band::Band160m));
    }
}
