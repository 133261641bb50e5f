//! Geohash encoding.
//!
//! A geohash interleaves longitude and latitude range-halving bits and
//! packs them five at a time into a base-32 alphabet. Longer hashes name
//! smaller cells; a hash is a prefix of every finer hash for the same
//! point, which is what makes it a useful low-cardinality location label.

/// The geohash base-32 alphabet (digits plus lowercase letters minus a/i/l/o).
const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest supported hash; 12 characters already names a cell under 5 cm.
const MAX_PRECISION: usize = 12;

/// Encode a location as a geohash of exactly `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);

    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut bits = 0u32;
    let mut ch = 0usize;

    while hash.len() < precision {
        if bits % 2 == 0 {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            ch <<= 1;
            if lon >= mid {
                ch |= 1;
                lon_range.0 = mid;
            } else {
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            ch <<= 1;
            if lat >= mid {
                ch |= 1;
                lat_range.0 = mid;
            } else {
                lat_range.1 = mid;
            }
        }

        bits += 1;
        if bits % 5 == 0 {
            hash.push(BASE32[ch] as char);
            ch = 0;
        }
    }

    hash
}

/// Decode a geohash to its cell center and half-sizes:
/// `(lat, lon, lat_error, lon_error)`. Returns None on invalid characters.
pub fn decode(hash: &str) -> Option<(f64, f64, f64, f64)> {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in hash.bytes() {
        let idx = BASE32.iter().position(|&b| b == c.to_ascii_lowercase())?;

        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            let range = if even { &mut lon_range } else { &mut lat_range };
            let mid = (range.0 + range.1) / 2.0;
            if bit == 1 {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even = !even;
        }
    }

    let lat = (lat_range.0 + lat_range.1) / 2.0;
    let lon = (lon_range.0 + lon_range.1) / 2.0;
    let lat_err = (lat_range.1 - lat_range.0) / 2.0;
    let lon_err = (lon_range.1 - lon_range.0) / 2.0;

    Some((lat, lon, lat_err, lon_err))
}

/// Encode with the shortest precision that round-trips the input.
///
/// The hash grows until its cell, rounded to the decimals the cell size
/// justifies, reproduces the given coordinates. Coarse inputs (a country
/// centroid) come out short; precise ones (a city fix) come out longer.
pub fn encode_auto(lat: f64, lon: f64) -> String {
    for precision in 1..=MAX_PRECISION {
        let hash = encode(lat, lon, precision);
        let (clat, clon, lat_err, lon_err) = decode(&hash).expect("own output decodes");

        if round_with_error(clat, lat_err) == lat && round_with_error(clon, lon_err) == lon {
            return hash;
        }
    }

    encode(lat, lon, MAX_PRECISION)
}

/// Round `v` to the number of decimals a half-size of `err` justifies.
fn round_with_error(v: f64, err: f64) -> f64 {
    let decimals = (-(2.0 * err).log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    (v * factor).round() / factor
}
