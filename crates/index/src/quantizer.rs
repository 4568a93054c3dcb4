//! Scalar quantization
//!
//! Stored vectors are L2-normalized and each component mapped from
//! `[-1, 1]` to a `u8` code: `round((x / |x| + 1) * 127.5)`. The original
//! magnitude is kept beside the codes. Queries are normalized the same way but
//! mapped to `i8`: `round(x / |x| * 127)`.
//!
//! The approximate cosine between a stored vector and a query is then
//!
//! ```text
//! cos ≈ Σ c_i q_i / (127.5 * 127) - Σ q_i / 127
//! ```
//!
//! computed with one integer dot product, and the metric distance follows from
//! the cosine and the two magnitudes.
//!
//! Rounding moves each stored component by at most `0.5 / 127.5` and each
//! query component by at most `0.5 / 127`, which bounds how far the
//! approximate cosine can drift from the exact one; see
//! [`QuantizedQuery::error_bound`].

use crate::kernels::DistanceKernels;
use quiver_core::DistanceMetric;

const STORED_SCALE: f32 = 127.5;
const QUERY_SCALE: f32 = 127.0;
const STORED_STEP: f32 = 0.5 / STORED_SCALE;
const QUERY_STEP: f32 = 0.5 / QUERY_SCALE;

/// Maps full-precision vectors to 8-bit codes.
pub struct ScalarQuantizer;

/// A query quantized to signed codes.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedQuery {
    /// Signed codes, one per dimension
    pub codes: Vec<i8>,
    /// L2 norm of the original query
    pub magnitude: f32,
    code_sum: i32,
}

fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn inverse(magnitude: f32) -> f32 {
    if magnitude > 0.0 {
        1.0 / magnitude
    } else {
        1.0
    }
}

impl ScalarQuantizer {
    /// Quantize a stored vector. Returns the codes and the original magnitude.
    pub fn quantize_vector(vector: &[f32]) -> (Vec<u8>, f32) {
        let magnitude = l2_norm(vector);
        let scale = inverse(magnitude);
        let codes = vector
            .iter()
            .map(|&x| ((x * scale + 1.0) * STORED_SCALE).round().clamp(0.0, 255.0) as u8)
            .collect();
        (codes, magnitude)
    }

    /// Quantize a query.
    pub fn quantize_query(query: &[f32]) -> QuantizedQuery {
        let magnitude = l2_norm(query);
        let scale = inverse(magnitude);
        let codes: Vec<i8> = query
            .iter()
            .map(|&x| (x * scale * QUERY_SCALE).round().clamp(-128.0, 127.0) as i8)
            .collect();
        let code_sum = codes.iter().map(|&c| c as i32).sum();
        QuantizedQuery {
            codes,
            magnitude,
            code_sum,
        }
    }

    /// Reconstruct an approximation of a stored vector.
    pub fn dequantize(codes: &[u8], magnitude: f32) -> Vec<f32> {
        codes
            .iter()
            .map(|&c| (c as f32 / STORED_SCALE - 1.0) * magnitude)
            .collect()
    }
}

impl QuantizedQuery {
    /// Approximate cosine similarity to a stored vector's codes.
    #[inline]
    pub fn approx_cosine(&self, kernels: &DistanceKernels, codes: &[u8]) -> f32 {
        let dot = kernels.dot_u8_i8(codes, &self.codes) as f32;
        dot / (STORED_SCALE * QUERY_SCALE) - self.code_sum as f32 / QUERY_SCALE
    }

    /// Upper bound on `|approx_distance - exact distance|` against a stored
    /// vector of `magnitude`.
    pub fn error_bound(&self, metric: DistanceMetric, magnitude: f32) -> f32 {
        let root = (self.codes.len() as f32).sqrt();
        // δu·|q̃|₁ + δq·|û|₁ with |û|₁ <= √d and |q̃|₁ <= √d (1 + δq √d)
        let cosine = root * (STORED_STEP * (1.0 + QUERY_STEP * root) + QUERY_STEP);
        let product = self.magnitude * magnitude;
        let (drift, scale) = match metric {
            // The exact kernel calls near-zero vectors orthogonal
            DistanceMetric::Cosine if product <= 2.0 * f32::EPSILON => return 2.0,
            DistanceMetric::Cosine => (cosine, 1.0),
            DistanceMetric::DotProduct => (product * cosine, product),
            DistanceMetric::Euclidean => (
                2.0 * product * cosine,
                self.magnitude * self.magnitude + magnitude * magnitude,
            ),
        };
        // f32 accumulation in both the approximate and the exact kernels
        let rounding = scale * (1e-5 + 4.0 * self.codes.len() as f32 * f32::EPSILON);
        drift + rounding
    }

    /// Approximate distance under `metric`; lower is closer.
    #[inline]
    pub fn approx_distance(
        &self,
        kernels: &DistanceKernels,
        metric: DistanceMetric,
        codes: &[u8],
        magnitude: f32,
    ) -> f32 {
        if self.magnitude == 0.0 || magnitude == 0.0 {
            return match metric {
                DistanceMetric::Cosine => 1.0,
                DistanceMetric::DotProduct => 0.0,
                DistanceMetric::Euclidean => {
                    self.magnitude * self.magnitude + magnitude * magnitude
                }
            };
        }
        let cos = self.approx_cosine(kernels, codes).clamp(-1.0, 1.0);
        match metric {
            DistanceMetric::Cosine => 1.0 - cos,
            DistanceMetric::DotProduct => -(self.magnitude * magnitude * cos),
            DistanceMetric::Euclidean => {
                let sq = self.magnitude * self.magnitude + magnitude * magnitude
                    - 2.0 * self.magnitude * magnitude * cos;
                sq.max(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_code_ranges() {
        let (codes, mag) = ScalarQuantizer::quantize_vector(&[1.0, 0.0, -1.0]);
        assert!((mag - 2f32.sqrt()).abs() < 1e-6);
        // 1/sqrt(2) -> 218, 0 -> 128 (127.5 rounded), -1/sqrt(2) -> 37
        assert_eq!(codes, vec![218, 128, 37]);

        let q = ScalarQuantizer::quantize_query(&[0.0, 5.0]);
        assert_eq!(q.codes, vec![0, 127]);
        assert_eq!(q.magnitude, 5.0);
    }

    #[test]
    fn test_zero_vector() {
        let (codes, mag) = ScalarQuantizer::quantize_vector(&[0.0, 0.0]);
        assert_eq!(mag, 0.0);
        assert_eq!(codes, vec![128, 128]);
        let q = ScalarQuantizer::quantize_query(&[1.0, 0.0]);
        let k = DistanceKernels::scalar();
        assert_eq!(q.approx_distance(&k, DistanceMetric::Cosine, &codes, mag), 1.0);
        assert_eq!(q.approx_distance(&k, DistanceMetric::Euclidean, &codes, mag), 1.0);
    }

    #[test]
    fn test_dequantize_close_to_original() {
        let v = vec![0.3, -0.4, 1.2, 0.05];
        let (codes, mag) = ScalarQuantizer::quantize_vector(&v);
        let back = ScalarQuantizer::dequantize(&codes, mag);
        for (a, b) in v.iter().zip(&back) {
            assert!((a - b).abs() < 0.02 * mag, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_error_bound_holds() {
        let kernels = DistanceKernels::global();
        let mut rng = StdRng::seed_from_u64(8);
        for metric in [
            DistanceMetric::Euclidean,
            DistanceMetric::Cosine,
            DistanceMetric::DotProduct,
        ] {
            for dim in [2usize, 7, 32, 128] {
                for _ in 0..200 {
                    let scale = rng.gen_range(0.01f32..20.0);
                    let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-scale..scale)).collect();
                    let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                    let (codes, mag) = ScalarQuantizer::quantize_vector(&a);
                    let q = ScalarQuantizer::quantize_query(&b);
                    let approx = q.approx_distance(kernels, metric, &codes, mag);
                    let exact = kernels.distance(metric, &b, &a);
                    let bound = q.error_bound(metric, mag);
                    assert!(
                        (approx - exact).abs() <= bound,
                        "{:?} d={}: approx {} exact {} bound {}",
                        metric,
                        dim,
                        approx,
                        exact,
                        bound
                    );
                }
            }
        }
    }

    #[test]
    fn test_approx_distance_tracks_exact() {
        let kernels = DistanceKernels::global();
        let mut rng = StdRng::seed_from_u64(3);
        for metric in [
            DistanceMetric::Euclidean,
            DistanceMetric::Cosine,
            DistanceMetric::DotProduct,
        ] {
            for _ in 0..50 {
                let a: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let b: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let (codes, mag) = ScalarQuantizer::quantize_vector(&a);
                let q = ScalarQuantizer::quantize_query(&b);
                let approx = q.approx_distance(kernels, metric, &codes, mag);
                let exact = kernels.distance(metric, &b, &a);
                let scale = match metric {
                    DistanceMetric::Cosine => 1.0,
                    _ => mag * q.magnitude,
                };
                assert!(
                    (approx - exact).abs() < 0.05 * scale.max(1.0),
                    "{:?}: approx {} exact {}",
                    metric,
                    approx,
                    exact
                );
            }
        }
    }
}
