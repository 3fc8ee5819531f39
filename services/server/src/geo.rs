//! Geospatial scoring: a 52-bit interleaved geohash over sorted-set scores,
//! plus great-circle distance.
//!
//! Encoding maps longitude into 26 bits by binary subdivision of
//! [-180, 180] and latitude into 26 bits by subdivision of
//! [-85.05112878, 85.05112878]; the bits are interleaved with longitude on
//! the even positions counted from the most significant bit. 52 bits fit
//! exactly in an f64 mantissa, so the hash survives the round trip through
//! a sorted-set score.

/// Refinement steps per axis; the hash is `2 * GEO_STEP_MAX` bits wide.
pub const GEO_STEP_MAX: u32 = 26;

pub const GEO_LAT_MIN: f64 = -85.05112878;
pub const GEO_LAT_MAX: f64 = 85.05112878;
pub const GEO_LON_MIN: f64 = -180.0;
pub const GEO_LON_MAX: f64 = 180.0;

const EARTH_RADIUS_M: f64 = 6372797.560856;

pub fn coordinates_in_range(longitude: f64, latitude: f64) -> bool {
    (GEO_LON_MIN..=GEO_LON_MAX).contains(&longitude)
        && (GEO_LAT_MIN..=GEO_LAT_MAX).contains(&latitude)
}

/// Encode a coordinate pair into its 52-bit hash.
///
/// Returns `None` when either coordinate is outside the encodable range.
pub fn encode(longitude: f64, latitude: f64) -> Option<u64> {
    if !coordinates_in_range(longitude, latitude) {
        return None;
    }

    let mut lon_range = (GEO_LON_MIN, GEO_LON_MAX);
    let mut lat_range = (GEO_LAT_MIN, GEO_LAT_MAX);
    let mut hash = 0u64;

    for _ in 0..GEO_STEP_MAX {
        let lon_mid = (lon_range.0 + lon_range.1) / 2.0;
        let lon_bit = if longitude >= lon_mid {
            lon_range.0 = lon_mid;
            1
        } else {
            lon_range.1 = lon_mid;
            0
        };

        let lat_mid = (lat_range.0 + lat_range.1) / 2.0;
        let lat_bit = if latitude >= lat_mid {
            lat_range.0 = lat_mid;
            1
        } else {
            lat_range.1 = lat_mid;
            0
        };

        hash = (hash << 1) | lon_bit;
        hash = (hash << 1) | lat_bit;
    }

    Some(hash)
}

/// Decode a 52-bit hash back to the midpoint of its cell.
pub fn decode(hash: u64) -> (f64, f64) {
    let mut lon_range = (GEO_LON_MIN, GEO_LON_MAX);
    let mut lat_range = (GEO_LAT_MIN, GEO_LAT_MAX);

    for step in 0..GEO_STEP_MAX {
        let lon_bit = (hash >> (51 - step * 2)) & 1;
        let lat_bit = (hash >> (50 - step * 2)) & 1;

        if lon_bit == 1 {
            lon_range.0 = (lon_range.0 + lon_range.1) / 2.0;
        } else {
            lon_range.1 = (lon_range.0 + lon_range.1) / 2.0;
        }
        if lat_bit == 1 {
            lat_range.0 = (lat_range.0 + lat_range.1) / 2.0;
        } else {
            lat_range.1 = (lat_range.0 + lat_range.1) / 2.0;
        }
    }

    (
        (lon_range.0 + lon_range.1) / 2.0,
        (lat_range.0 + lat_range.1) / 2.0,
    )
}

/// Great-circle (haversine) distance in metres between two
/// `(longitude, latitude)` pairs.
pub fn distance_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let lon1 = a.0.to_radians();
    let lat1 = a.1.to_radians();
    let lon2 = b.0.to_radians();
    let lat2 = b.1.to_radians();

    let d_lat = lat2 - lat1;
    let d_lon = lon2 - lon1;

    let h = (d_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}
