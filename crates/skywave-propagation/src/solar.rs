use chrono::{DateTime, Datelike, Timelike, Utc};

/// Solar zenith angle in degrees at a coordinate and UTC instant.
///
/// Uses the Cooper declination approximation and the mean-solar-time hour
/// angle; accurate to a degree or two, which is plenty for a day/night gate.
pub fn solar_zenith_deg(lat: f64, lon: f64, at: DateTime<Utc>) -> f64 {
    let doy = at.ordinal() as f64;
    let declination =
        23.45_f64.to_radians() * (2.0 * std::f64::consts::PI * (284.0 + doy) / 365.0).sin();

    let utc_hours =
        at.hour() as f64 + at.minute() as f64 / 60.0 + at.second() as f64 / 3600.0;
    // Mean solar time: four minutes of rotation per degree of longitude.
    let tz_correction_minutes = 4.0 * lon;
    let solar_hours = utc_hours + tz_correction_minutes / 60.0;
    let hour_angle = (15.0 * (solar_hours - 12.0)).to_radians();

    let lat_rad = lat.to_radians();
    let cos_zenith =
        lat_rad.sin() * declination.sin() + lat_rad.cos() * declination.cos() * hour_angle.cos();
    cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Whether the sun is above the horizon at a coordinate and instant.
pub fn is_daytime(lat: f64, lon: f64, at: DateTime<Utc>) -> bool {
    solar_zenith_deg(lat, lon, at) < 90.0
}
