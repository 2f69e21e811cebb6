use rand::Rng;

/// One draw of the fading model for a given signal strength.
///
/// Sampled per forwarded packet; the slow/fast components are periodic in
/// wall-clock time so consecutive packets fade coherently, the random and
/// deep-fade components are independent per draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadingSample {
    /// Probability in [0, 0.95] that this packet is dropped.
    pub packet_loss_probability: f64,
    /// Jitter scale in [0, 1] for the receiver's delay line.
    pub jitter: f64,
    /// Additive-noise scale in [0, 1].
    pub noise_factor: f64,
    /// Whether a deep-fade event fired for this draw.
    pub deep_fade: bool,
}

impl FadingSample {
    /// Sample the model at a wall-clock instant (milliseconds) with the
    /// caller's RNG. `strength` is the pair signal strength in [0, 1].
    pub fn sample_at<R: Rng + ?Sized>(strength: f64, now_millis: u64, rng: &mut R) -> Self {
        let degradation = (1.0 - strength.clamp(0.0, 1.0)).clamp(0.0, 1.0);

        // Slow QSB: one period every five to seven seconds.
        let t_slow = rng.gen_range(5000u64..=7000);
        let slow_phase = (now_millis % t_slow) as f64 / t_slow as f64;
        let c_slow = 0.5 * (1.0 + (2.0 * std::f64::consts::PI * slow_phase).sin());

        // Fast flutter.
        let t_fast = rng.gen_range(100u64..=400);
        let fast_phase = (now_millis % t_fast) as f64 / t_fast as f64;
        let c_fast = 0.3 * (1.0 + (6.0 * std::f64::consts::PI * fast_phase).sin());

        let c_rand = 0.2 * rng.gen::<f64>();

        let deep_probability = (0.05 + 0.15 * degradation).min(0.2);
        let deep_fade = rng.gen::<f64>() < deep_probability;
        let c_deep = if deep_fade {
            0.7 + 0.3 * rng.gen::<f64>()
        } else {
            0.0
        };

        let modulation = 0.5 + 0.3 * c_slow + 0.1 * c_fast + c_rand + c_deep;
        let packet_loss_probability =
            (degradation.powf(1.3) * modulation).clamp(0.0, 0.95);

        Self {
            packet_loss_probability,
            jitter: (degradation * modulation).clamp(0.0, 1.0),
            noise_factor: degradation,
            deep_fade,
        }
    }

    /// Sample with the thread RNG at the current wall clock.
    pub fn sample(strength: f64) -> Self {
        let now_millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::sample_at(strength, now_millis, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5EED)
    }

    #[test]
    fn perfect_signal_never_drops() {
        let mut r = rng();
        for millis in (0..60_000).step_by(777) {
            let s = FadingSample::sample_at(1.0, millis, &mut r);
            assert_eq!(s.packet_loss_probability, 0.0);
            assert_eq!(s.jitter, 0.0);
            assert_eq!(s.noise_factor, 0.0);
        }
    }

    #[test]
    fn dead_signal_caps_at_ninety_five_percent() {
        let mut r = rng();
        for millis in (0..60_000).step_by(777) {
            let s = FadingSample::sample_at(0.0, millis, &mut r);
            assert!(s.packet_loss_probability <= 0.95);
            assert_eq!(s.noise_factor, 1.0);
        }
    }

    #[test]
    fn outputs_stay_in_bounds() {
        let mut r = rng();
        for strength in [0.0, 0.05, 0.3, 0.5, 0.9, 1.0] {
            for millis in (0..20_000).step_by(313) {
                let s = FadingSample::sample_at(strength, millis, &mut r);
                assert!((0.0..=0.95).contains(&s.packet_loss_probability));
                assert!((0.0..=1.0).contains(&s.jitter));
                assert!((0.0..=1.0).contains(&s.noise_factor));
            }
        }
    }

    #[test]
    fn weaker_signal_loses_more_on_average() {
        let mut r = rng();
        let average = |strength: f64, r: &mut StdRng| {
            let mut total = 0.0;
            for millis in (0..100_000).step_by(97) {
                total += FadingSample::sample_at(strength, millis, r).packet_loss_probability;
            }
            total / (100_000 / 97 + 1) as f64
        };
        let weak = average(0.1, &mut r);
        let strong = average(0.8, &mut r);
        assert!(weak > strong, "weak {weak} strong {strong}");
    }

    #[test]
    fn deep_fade_rate_bounded() {
        let mut r = rng();
        let mut fades = 0u32;
        let draws = 5_000u32;
        for i in 0..draws {
            if FadingSample::sample_at(0.0, i as u64 * 37, &mut r).deep_fade {
                fades += 1;
            }
        }
        // Worst-case Bernoulli probability is 0.2.
        let rate = fades as f64 / draws as f64;
        assert!(rate < 0.25, "rate {rate}");
        assert!(rate > 0.1, "rate {rate}");
    }

    #[test]
    fn noise_tracks_degradation_exactly() {
        let mut r = rng();
        let s = FadingSample::sample_at(0.3, 1234, &mut r);
        assert!((s.noise_factor - 0.7).abs() < 1e-12);
    }
}
