use sha2::{Digest, Sha256};

/// Inputs that can affect a computed path. Fingerprints over this tuple key
/// the prediction cache and name progress streams, so two workers given the
/// same request derive the same identifier with no coordination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestKey {
    pub time: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub burst_alt: f64,
    pub float_hours: f64,
    pub ascent_rate: f64,
    pub descent_rate: f64,
    pub coeff: f64,
    /// Ensemble member, or -1 for a whole-ensemble request id.
    pub member: i32,
}

/// Deterministic 16-character hex digest of a request tuple.
///
/// Floats are rendered at fixed precision before hashing so the digest is
/// stable across processes and architectures.
pub fn fingerprint(key: &RequestKey) -> String {
    let canonical = format!(
        "{:.0}|{:.6}|{:.6}|{:.2}|{:.2}|{:.4}|{:.3}|{:.3}|{:.4}|{}",
        key.time,
        key.lat,
        key.lon,
        key.alt,
        key.burst_alt,
        key.float_hours,
        key.ascent_rate,
        key.descent_rate,
        key.coeff,
        key.member,
    );
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
