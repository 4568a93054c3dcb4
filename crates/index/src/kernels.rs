//! Numeric distance kernels
//!
//! Kernels are plain function pointers chosen once per process by
//! [`DistanceKernels::detect`]: AVX2+FMA on x86_64 CPUs that report both
//! features, portable scalar loops everywhere else. Every search and build
//! path goes through the table, so the per-call cost of dispatch is one
//! indirect call and no feature probing.
//!
//! All kernels operate on the common prefix of their inputs; callers check
//! dimensions before reaching here.

use quiver_core::DistanceMetric;
use std::sync::OnceLock;

/// Function table of distance kernels.
#[derive(Debug, Clone, Copy)]
pub struct DistanceKernels {
    name: &'static str,
    dot_f32: fn(&[f32], &[f32]) -> f32,
    l2_sq_f32: fn(&[f32], &[f32]) -> f32,
    dot_u8_i8: fn(&[u8], &[i8]) -> i32,
}

static SELECTED: OnceLock<DistanceKernels> = OnceLock::new();

impl DistanceKernels {
    /// Best kernels the running CPU supports.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2")
                && std::arch::is_x86_feature_detected!("fma")
            {
                return DistanceKernels {
                    name: "avx2-fma",
                    dot_f32: avx2::dot_f32,
                    l2_sq_f32: avx2::l2_sq_f32,
                    dot_u8_i8: avx2::dot_u8_i8,
                };
            }
        }
        Self::scalar()
    }

    /// Portable kernels.
    pub fn scalar() -> Self {
        DistanceKernels {
            name: "scalar",
            dot_f32: scalar::dot_f32,
            l2_sq_f32: scalar::l2_sq_f32,
            dot_u8_i8: scalar::dot_u8_i8,
        }
    }

    /// Process-wide kernels, detected on first use.
    pub fn global() -> &'static DistanceKernels {
        SELECTED.get_or_init(|| {
            let kernels = Self::detect();
            tracing::info!(target: "quiver::index", kernels = kernels.name, "Selected distance kernels");
            kernels
        })
    }

    /// Kernel family name (`"avx2-fma"` or `"scalar"`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Inner product.
    #[inline]
    pub fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        (self.dot_f32)(a, b)
    }

    /// Squared Euclidean distance.
    #[inline]
    pub fn l2_sq_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        (self.l2_sq_f32)(a, b)
    }

    /// Integer inner product of unsigned codes and signed query codes.
    #[inline]
    pub fn dot_u8_i8(&self, codes: &[u8], query: &[i8]) -> i32 {
        (self.dot_u8_i8)(codes, query)
    }

    /// Squared L2 norm.
    #[inline]
    pub fn norm_sq(&self, a: &[f32]) -> f32 {
        (self.dot_f32)(a, a)
    }

    /// Exact distance under `metric`; lower is closer.
    pub fn distance(&self, metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
        match metric {
            DistanceMetric::Euclidean => self.l2_sq_f32(a, b),
            DistanceMetric::DotProduct => -self.dot_f32(a, b),
            DistanceMetric::Cosine => {
                let denom = (self.norm_sq(a) * self.norm_sq(b)).sqrt();
                if denom <= f32::EPSILON {
                    1.0
                } else {
                    1.0 - self.dot_f32(a, b) / denom
                }
            }
        }
    }
}

mod scalar {
    pub(super) fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    pub(super) fn l2_sq_f32(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }

    pub(super) fn dot_u8_i8(codes: &[u8], query: &[i8]) -> i32 {
        codes
            .iter()
            .zip(query)
            .map(|(&c, &q)| c as i32 * q as i32)
            .sum()
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    // The safe wrappers are only placed in a kernel table after `detect`
    // has confirmed AVX2 and FMA on the running CPU.

    pub(super) fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        // SAFETY: CPU support checked by `detect`; reads stay within `n`.
        unsafe { dot_f32_impl(a.as_ptr(), b.as_ptr(), n) }
    }

    pub(super) fn l2_sq_f32(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        // SAFETY: as above.
        unsafe { l2_sq_f32_impl(a.as_ptr(), b.as_ptr(), n) }
    }

    pub(super) fn dot_u8_i8(codes: &[u8], query: &[i8]) -> i32 {
        let n = codes.len().min(query.len());
        // SAFETY: as above.
        unsafe { dot_u8_i8_impl(codes.as_ptr(), query.as_ptr(), n) }
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn hsum_ps(v: __m256) -> f32 {
        let hi = _mm256_extractf128_ps(v, 1);
        let lo = _mm256_castps256_ps128(v);
        let sum = _mm_add_ps(lo, hi);
        let high64 = _mm_movehl_ps(sum, sum);
        let sum = _mm_add_ps(sum, high64);
        let high32 = _mm_shuffle_ps(sum, sum, 0x55);
        _mm_cvtss_f32(_mm_add_ss(sum, high32))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn hsum_epi32(v: __m256i) -> i32 {
        let hi = _mm256_extracti128_si256(v, 1);
        let lo = _mm256_castsi256_si128(v);
        let sum = _mm_add_epi32(lo, hi);
        let sum = _mm_hadd_epi32(sum, sum);
        let sum = _mm_hadd_epi32(sum, sum);
        _mm_cvtsi128_si32(sum)
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn dot_f32_impl(a: *const f32, b: *const f32, n: usize) -> f32 {
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();
        let mut i = 0;
        while i + 16 <= n {
            acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i)), acc0);
            acc1 = _mm256_fmadd_ps(
                _mm256_loadu_ps(a.add(i + 8)),
                _mm256_loadu_ps(b.add(i + 8)),
                acc1,
            );
            i += 16;
        }
        while i + 8 <= n {
            acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i)), acc0);
            i += 8;
        }
        let mut sum = hsum_ps(_mm256_add_ps(acc0, acc1));
        while i < n {
            sum += *a.add(i) * *b.add(i);
            i += 1;
        }
        sum
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn l2_sq_f32_impl(a: *const f32, b: *const f32, n: usize) -> f32 {
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();
        let mut i = 0;
        while i + 16 <= n {
            let d0 = _mm256_sub_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i)));
            let d1 = _mm256_sub_ps(_mm256_loadu_ps(a.add(i + 8)), _mm256_loadu_ps(b.add(i + 8)));
            acc0 = _mm256_fmadd_ps(d0, d0, acc0);
            acc1 = _mm256_fmadd_ps(d1, d1, acc1);
            i += 16;
        }
        while i + 8 <= n {
            let d = _mm256_sub_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i)));
            acc0 = _mm256_fmadd_ps(d, d, acc0);
            i += 8;
        }
        let mut sum = hsum_ps(_mm256_add_ps(acc0, acc1));
        while i < n {
            let d = *a.add(i) - *b.add(i);
            sum += d * d;
            i += 1;
        }
        sum
    }

    /// Both operands are widened to i16 before `madd`, so no lane saturates
    /// (|255 * -128| * 2 fits an i32 pair sum).
    #[target_feature(enable = "avx2")]
    unsafe fn dot_u8_i8_impl(codes: *const u8, query: *const i8, n: usize) -> i32 {
        let mut acc = _mm256_setzero_si256();
        let mut i = 0;
        while i + 16 <= n {
            let c = _mm256_cvtepu8_epi16(_mm_loadu_si128(codes.add(i) as *const __m128i));
            let q = _mm256_cvtepi8_epi16(_mm_loadu_si128(query.add(i) as *const __m128i));
            acc = _mm256_add_epi32(acc, _mm256_madd_epi16(c, q));
            i += 16;
        }
        let mut sum = hsum_epi32(acc);
        while i < n {
            sum += *codes.add(i) as i32 * *query.add(i) as i32;
            i += 1;
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_f32(rng: &mut StdRng, n: usize) -> Vec<f32> {
        (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }

    #[test]
    fn test_detected_matches_scalar_f32() {
        let detected = DistanceKernels::detect();
        let scalar = DistanceKernels::scalar();
        let mut rng = StdRng::seed_from_u64(7);
        for n in [0, 1, 7, 8, 15, 16, 17, 100, 128, 333] {
            let a = random_f32(&mut rng, n);
            let b = random_f32(&mut rng, n);
            let tol = 1e-4 * (n as f32).max(1.0);
            assert!((detected.dot_f32(&a, &b) - scalar.dot_f32(&a, &b)).abs() < tol, "dot n={}", n);
            assert!(
                (detected.l2_sq_f32(&a, &b) - scalar.l2_sq_f32(&a, &b)).abs() < tol,
                "l2 n={}",
                n
            );
        }
    }

    #[test]
    fn test_integer_dot_is_exact_at_extremes() {
        let detected = DistanceKernels::detect();
        let scalar = DistanceKernels::scalar();
        for n in [1, 15, 16, 31, 32, 64, 257] {
            let codes = vec![255u8; n];
            let low = vec![-128i8; n];
            let high = vec![127i8; n];
            assert_eq!(detected.dot_u8_i8(&codes, &low), scalar.dot_u8_i8(&codes, &low));
            assert_eq!(detected.dot_u8_i8(&codes, &high), scalar.dot_u8_i8(&codes, &high));
            assert_eq!(scalar.dot_u8_i8(&codes, &low), -255 * 128 * n as i32);
        }
    }

    #[test]
    fn test_integer_dot_random() {
        let detected = DistanceKernels::detect();
        let scalar = DistanceKernels::scalar();
        let mut rng = StdRng::seed_from_u64(11);
        let codes: Vec<u8> = (0..300).map(|_| rng.gen()).collect();
        let query: Vec<i8> = (0..300).map(|_| rng.gen()).collect();
        assert_eq!(detected.dot_u8_i8(&codes, &query), scalar.dot_u8_i8(&codes, &query));
    }

    #[test]
    fn test_metric_distances() {
        let k = DistanceKernels::global();
        let a = [3.0, 4.0, 0.0];
        let b = [0.0, 0.0, 0.0];
        assert!((k.distance(DistanceMetric::Euclidean, &a, &b) - 25.0).abs() < 1e-5);
        assert!((k.distance(DistanceMetric::DotProduct, &a, &a) + 25.0).abs() < 1e-5);
        assert!(k.distance(DistanceMetric::Cosine, &a, &a).abs() < 1e-5);
        assert_eq!(k.distance(DistanceMetric::Cosine, &a, &b), 1.0);
    }

    #[test]
    fn test_global_is_stable() {
        assert_eq!(DistanceKernels::global().name(), DistanceKernels::global().name());
    }
}
