//! Distance kernels shared by the metrics.
//!
//! Each kernel dispatches at runtime to the widest vector unit available and
//! falls back to a scalar loop. For a given machine the dispatch is fixed, so
//! repeated calls on identical inputs return identical bits.

/// Compute the squared Euclidean distance between two vectors.
#[inline]
pub fn l2_distance_sqr(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 support was checked just above.
            return unsafe { x86::l2_distance_sqr_avx2(a, b) };
        }
    }

    // SAFETY: NEON is mandatory on aarch64.
    #[cfg(target_arch = "aarch64")]
    let result = unsafe { neon::l2_distance_sqr_neon(a, b) };

    #[cfg(not(target_arch = "aarch64"))]
    let result = l2_distance_sqr_scalar(a, b);

    result
}

/// Compute the sum of absolute component differences between two vectors.
#[inline]
pub fn l1_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut lanes = [0.0f32; 8];
    let mut a_chunks = a.chunks_exact(8);
    let mut b_chunks = b.chunks_exact(8);
    for (ca, cb) in a_chunks.by_ref().zip(b_chunks.by_ref()) {
        for ((lane, x), y) in lanes.iter_mut().zip(ca).zip(cb) {
            *lane += (x - y).abs();
        }
    }
    let tail: f32 = a_chunks
        .remainder()
        .iter()
        .zip(b_chunks.remainder())
        .map(|(x, y)| (x - y).abs())
        .sum();
    lanes.iter().sum::<f32>() + tail
}

#[cfg_attr(target_arch = "aarch64", allow(dead_code))]
#[inline]
fn l2_distance_sqr_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut lanes = [0.0f32; 8];
    let mut a_chunks = a.chunks_exact(8);
    let mut b_chunks = b.chunks_exact(8);
    for (ca, cb) in a_chunks.by_ref().zip(b_chunks.by_ref()) {
        for ((lane, x), y) in lanes.iter_mut().zip(ca).zip(cb) {
            let diff = x - y;
            *lane += diff * diff;
        }
    }
    let tail: f32 = a_chunks
        .remainder()
        .iter()
        .zip(b_chunks.remainder())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum();
    lanes.iter().sum::<f32>() + tail
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use core::arch::x86_64::*;

    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn l2_distance_sqr_avx2(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len().min(b.len());
        let body = len - len % 8;
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();
        let mut acc = _mm256_setzero_ps();

        let mut i = 0usize;
        while i < body {
            let diff = _mm256_sub_ps(_mm256_loadu_ps(a_ptr.add(i)), _mm256_loadu_ps(b_ptr.add(i)));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(diff, diff));
            i += 8;
        }

        let mut lanes = [0f32; 8];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        let mut sum: f32 = lanes.iter().sum();
        for j in body..len {
            let diff = *a_ptr.add(j) - *b_ptr.add(j);
            sum += diff * diff;
        }
        sum
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use core::arch::aarch64::*;

    #[inline]
    #[target_feature(enable = "neon")]
    pub unsafe fn l2_distance_sqr_neon(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len().min(b.len());
        let body = len - len % 4;
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();
        let mut acc = vdupq_n_f32(0.0);

        let mut i = 0usize;
        while i < body {
            let diff = vsubq_f32(vld1q_f32(a_ptr.add(i)), vld1q_f32(b_ptr.add(i)));
            acc = vfmaq_f32(acc, diff, diff);
            i += 4;
        }

        let mut sum = vaddvq_f32(acc);
        for j in body..len {
            let diff = *a_ptr.add(j) - *b_ptr.add(j);
            sum += diff * diff;
        }
        sum
    }
}
