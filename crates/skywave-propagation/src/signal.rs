use chrono::{DateTime, Utc};

use crate::grid::{distance_km, GridSquare};
use crate::ionosphere::IonosphericState;
use crate::solar;

/// Compute the raw signal-strength score for a pair of squares.
///
/// The score is the product of six independent factors, clamped to [0, 1].
/// `stochastic` must be a uniform draw from [0, 1); it is passed in so the
/// engine can memoize the result and tests can pin it.
pub fn compute_strength(
    state: &IonosphericState,
    a: &GridSquare,
    b: &GridSquare,
    at: DateTime<Utc>,
    stochastic: f64,
) -> f64 {
    let distance = distance_km(a, b);
    let distance_factor = 1.0 / (1.0 + distance / 1000.0);

    let a_day = solar::is_daytime(a.latitude(), a.longitude(), at);
    let b_day = solar::is_daytime(b.latitude(), b.longitude(), at);
    let time_factor = match (a_day, b_day) {
        (true, true) => 1.0,
        (false, false) => 0.8,
        _ => 0.5,
    };

    let solar_factor = (state.solar_flux_index as f64 / 200.0).clamp(0.1, 1.0);
    let geomagnetic_factor = (1.0 - state.k_index as f64 / 9.0).clamp(0.1, 1.0);

    let season_factor = match state.season {
        skywave_protocol::types::Season::Winter => 0.7,
        skywave_protocol::types::Season::Spring => 0.9,
        skywave_protocol::types::Season::Summer => 1.0,
        skywave_protocol::types::Season::Fall => 0.8,
    };

    let random_factor = 0.8 + 0.2 * stochastic;

    (distance_factor * time_factor * solar_factor * geomagnetic_factor * season_factor
        * random_factor)
        .clamp(0.0, 1.0)
}
