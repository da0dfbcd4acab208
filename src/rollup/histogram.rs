//! Fixed-precision duration histogram with a versioned binary digest
//!
//! Buckets are geometric over [1ms, 60000ms] with ~5% relative width, so a
//! percentile read is within one bucket of the true value anywhere in range.
//! The digest format is explicit and versioned (the bucket layout is derived
//! from the version tag, only counts and exact stats are stored) so old
//! rollups stay decodable as the implementation evolves.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;

/// Lowest recordable duration; values below are floored to this
pub const MIN_DURATION_MS: f64 = 1.0;
/// Highest recordable duration; values above are clamped to this
pub const MAX_DURATION_MS: f64 = 60_000.0;

/// Per-bucket growth factor (~5% relative precision)
const GROWTH: f64 = 1.05;

/// Digest format version. Bumping it means a new bucket layout; decoding
/// rejects versions it does not know.
pub const DIGEST_VERSION: u8 = 1;

/// Upper bounds of every bucket, derived once from the layout constants
static BUCKET_BOUNDS: Lazy<Vec<f64>> = Lazy::new(|| {
    let mut bounds = Vec::new();
    let mut bound = MIN_DURATION_MS;
    while bound < MAX_DURATION_MS {
        bound *= GROWTH;
        bounds.push(bound.min(MAX_DURATION_MS));
    }
    bounds
});

fn bucket_index(value: f64) -> usize {
    match BUCKET_BOUNDS.binary_search_by(|bound| bound.partial_cmp(&value).expect("finite bound")) {
        Ok(i) => i,
        Err(i) => i.min(BUCKET_BOUNDS.len() - 1),
    }
}

/// Histogram over request durations for one rollup group
#[derive(Debug, Clone, PartialEq)]
pub struct DurationHistogram {
    counts: Vec<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl DurationHistogram {
    /// Create an empty histogram
    pub fn new() -> Self {
        Self {
            counts: vec![0; BUCKET_BOUNDS.len()],
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: 0.0,
        }
    }

    /// Record one duration, floored to 1ms and clamped to the range ceiling.
    /// Min/max/sum track the clamped value exactly; only the percentile reads
    /// are bucket-resolution approximations.
    pub fn record(&mut self, duration_ms: f64) {
        let value = duration_ms.max(MIN_DURATION_MS).min(MAX_DURATION_MS);
        self.counts[bucket_index(value)] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Number of recorded samples
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Exact mean of the recorded (clamped) values
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Exact minimum, or 0 when empty
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    /// Exact maximum, or 0 when empty
    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// Percentile read at bucket resolution. `q` in [0, 1].
    pub fn percentile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let rank = ((q * self.count as f64).ceil() as u64).clamp(1, self.count);
        let mut seen = 0u64;
        for (i, &bucket_count) in self.counts.iter().enumerate() {
            seen += bucket_count;
            if seen >= rank {
                // Clamp to the observed extremes so sparse histograms do not
                // report a bucket bound outside the recorded data.
                return BUCKET_BOUNDS[i].min(self.max).max(self.min);
            }
        }

        self.max
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.50)
    }

    pub fn p95(&self) -> f64 {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }

    /// Serialize to the versioned digest format:
    /// `[version:u8][count:u64][sum:f64][min:f64][max:f64][n_buckets:u32][counts:u64...]`
    /// all little-endian. Bucket bounds are implied by the version.
    pub fn to_digest(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 8 + 8 + 4 + self.counts.len() * 8);
        buf.push(DIGEST_VERSION);
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.sum.to_le_bytes());
        buf.extend_from_slice(&self.min().to_le_bytes());
        buf.extend_from_slice(&self.max.to_le_bytes());
        buf.extend_from_slice(&(self.counts.len() as u32).to_le_bytes());
        for c in &self.counts {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf
    }

    /// Decode a digest. Rejects unknown versions and truncated payloads.
    pub fn from_digest(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            bail!("Empty histogram digest");
        }
        if bytes[0] != DIGEST_VERSION {
            bail!("Unsupported histogram digest version: {}", bytes[0]);
        }

        let mut offset = 1usize;
        let count = read_u64(bytes, &mut offset)?;
        let sum = read_f64(bytes, &mut offset)?;
        let min = read_f64(bytes, &mut offset)?;
        let max = read_f64(bytes, &mut offset)?;
        let n_buckets = read_u32(bytes, &mut offset)? as usize;

        if n_buckets != BUCKET_BOUNDS.len() {
            bail!(
                "Histogram digest bucket count mismatch: {} vs {}",
                n_buckets,
                BUCKET_BOUNDS.len()
            );
        }

        let mut counts = Vec::with_capacity(n_buckets);
        for _ in 0..n_buckets {
            counts.push(read_u64(bytes, &mut offset)?);
        }

        Ok(Self {
            counts,
            count,
            sum,
            min: if count == 0 { f64::INFINITY } else { min },
            max,
        })
    }
}

fn read_bytes<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *offset + len;
    if end > bytes.len() {
        bail!("Truncated histogram digest");
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64> {
    let slice = read_bytes(bytes, offset, 8)?;
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32> {
    let slice = read_bytes(bytes, offset, 4)?;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

fn read_f64(bytes: &[u8], offset: &mut usize) -> Result<f64> {
    let slice = read_bytes(bytes, offset, 8)?;
    Ok(f64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_stats() {
        let mut h = DurationHistogram::new();
        h.record(200.0);
        h.record(400.0);

        assert_eq!(h.count(), 2);
        assert!((h.avg() - 300.0).abs() < f64::EPSILON);
        assert!((h.min() - 200.0).abs() < f64::EPSILON);
        assert!((h.max() - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_percentiles_within_relative_precision() {
        let mut h = DurationHistogram::new();
        for i in 1..=1000 {
            h.record(i as f64);
        }

        // True p95 = 950, p99 = 990; one ~5% bucket of slack.
        assert!((h.p95() - 950.0).abs() / 950.0 < 0.06, "p95 = {}", h.p95());
        assert!((h.p99() - 990.0).abs() / 990.0 < 0.06, "p99 = {}", h.p99());
        assert!((h.p50() - 500.0).abs() / 500.0 < 0.06, "p50 = {}", h.p50());
    }

    #[test]
    fn test_floor_and_clamp() {
        let mut h = DurationHistogram::new();
        h.record(0.2);
        h.record(500_000.0);

        assert!((h.min() - MIN_DURATION_MS).abs() < f64::EPSILON);
        assert!((h.max() - MAX_DURATION_MS).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_histogram() {
        let h = DurationHistogram::new();
        assert_eq!(h.count(), 0);
        assert_eq!(h.avg(), 0.0);
        assert_eq!(h.min(), 0.0);
        assert_eq!(h.max(), 0.0);
        assert_eq!(h.p95(), 0.0);
    }

    #[test]
    fn test_digest_roundtrip() {
        let mut h = DurationHistogram::new();
        for d in [3.0, 40.0, 750.0, 12_000.0] {
            h.record(d);
        }

        let digest = h.to_digest();
        assert_eq!(digest[0], DIGEST_VERSION);

        let decoded = DurationHistogram::from_digest(&digest).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.p95(), h.p95());
    }

    #[test]
    fn test_digest_rejects_unknown_version() {
        let mut h = DurationHistogram::new();
        h.record(10.0);
        let mut digest = h.to_digest();
        digest[0] = 99;

        assert!(DurationHistogram::from_digest(&digest).is_err());
        assert!(DurationHistogram::from_digest(&[]).is_err());
        assert!(DurationHistogram::from_digest(&digest[..5]).is_err());
    }

    #[test]
    fn test_single_value_percentiles_are_exact() {
        let mut h = DurationHistogram::new();
        h.record(800.0);
        assert!((h.p95() - 800.0).abs() < f64::EPSILON);
        assert!((h.p50() - 800.0).abs() < f64::EPSILON);
    }
}
