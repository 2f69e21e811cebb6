use crate::error::PropagationError;

/// Mean Earth radius in kilometers, used for all great-circle math.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated Maidenhead locator, normalized to canonical case
/// (upper-case field, lower-case subsquare).
#[derive(Debug, Clone, PartialEq)]
pub struct GridSquare {
    normalized: String,
    lat: f64,
    lon: f64,
}

impl GridSquare {
    /// Parse a 4- or 6-character Maidenhead locator.
    ///
    /// The decoded coordinate is the center of the smallest square the
    /// locator describes.
    pub fn parse(locator: &str) -> Result<Self, PropagationError> {
        let chars: Vec<char> = locator.chars().collect();
        if chars.len() != 4 && chars.len() != 6 {
            return Err(PropagationError::InvalidLocatorLength(locator.to_string()));
        }

        let field_lon = field_index(chars[0], locator)?;
        let field_lat = field_index(chars[1], locator)?;

        let square_lon = digit_index(chars[2], locator)?;
        let square_lat = digit_index(chars[3], locator)?;

        // Field: 20 degrees of longitude, 10 of latitude. Square: 2 and 1.
        let mut lon = field_lon as f64 * 20.0 - 180.0 + square_lon as f64 * 2.0;
        let mut lat = field_lat as f64 * 10.0 - 90.0 + square_lat as f64;

        let mut normalized = String::with_capacity(chars.len());
        normalized.push(chars[0].to_ascii_uppercase());
        normalized.push(chars[1].to_ascii_uppercase());
        normalized.push(chars[2]);
        normalized.push(chars[3]);

        if chars.len() == 6 {
            let sub_lon = subsquare_index(chars[4], locator)?;
            let sub_lat = subsquare_index(chars[5], locator)?;
            // Subsquare: 1/12 degree of longitude, 1/24 of latitude;
            // offset to the subsquare center.
            lon += sub_lon as f64 / 12.0 + 1.0 / 24.0;
            lat += sub_lat as f64 / 24.0 + 1.0 / 48.0;
            normalized.push(chars[4].to_ascii_lowercase());
            normalized.push(chars[5].to_ascii_lowercase());
        } else {
            // Square center.
            lon += 1.0;
            lat += 0.5;
        }

        Ok(Self {
            normalized,
            lat,
            lon,
        })
    }

    /// Encode a coordinate as a locator with `precision` characters (4 or 6).
    pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<Self, PropagationError> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(PropagationError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(PropagationError::LongitudeOutOfRange(lon));
        }

        // Nudge the poles/antimeridian inside the top square.
        let lon = (lon + 180.0).min(359.999_999) / 2.0;
        let lat = (lat + 90.0).min(179.999_999);

        let mut s = String::with_capacity(precision);
        s.push((b'A' + (lon / 10.0) as u8) as char);
        s.push((b'A' + (lat / 10.0) as u8) as char);
        s.push((b'0' + (lon % 10.0) as u8) as char);
        s.push((b'0' + (lat % 10.0) as u8) as char);
        if precision >= 6 {
            s.push((b'a' + ((lon % 1.0) * 24.0) as u8) as char);
            s.push((b'a' + ((lat % 1.0) * 24.0) as u8) as char);
        }
        Self::parse(&s)
    }

    /// The canonical text form ("JO59jw").
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Latitude of the square center, degrees.
    pub fn latitude(&self) -> f64 {
        self.lat
    }

    /// Longitude of the square center, degrees.
    pub fn longitude(&self) -> f64 {
        self.lon
    }
}

impl std::fmt::Display for GridSquare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized)
    }
}

fn field_index(c: char, locator: &str) -> Result<u8, PropagationError> {
    let up = c.to_ascii_uppercase();
    if up.is_ascii_uppercase() && up <= 'R' {
        Ok(up as u8 - b'A')
    } else {
        Err(PropagationError::InvalidField(locator.to_string()))
    }
}

fn digit_index(c: char, locator: &str) -> Result<u8, PropagationError> {
    c.to_digit(10)
        .map(|d| d as u8)
        .ok_or_else(|| PropagationError::InvalidSquare(locator.to_string()))
}

fn subsquare_index(c: char, locator: &str) -> Result<u8, PropagationError> {
    let low = c.to_ascii_lowercase();
    if low.is_ascii_lowercase() && low <= 'x' {
        Ok(low as u8 - b'a')
    } else {
        Err(PropagationError::InvalidSubsquare(locator.to_string()))
    }
}

/// Great-circle distance between two squares via the haversine formula.
pub fn distance_km(a: &GridSquare, b: &GridSquare) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}
