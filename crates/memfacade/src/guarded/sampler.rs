//! Per-thread sampling decision and re-entrancy flag.
//!
//! Everything lives in a const-initialised thread local of plain `Cell`s, so
//! access never allocates and never registers a destructor.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

struct SamplerState {
    /// Allocations left until the next sample; 0 means not drawn yet.
    countdown: Cell<u32>,
    rng: Cell<u64>,
    /// Set while this thread is inside the guarded pool.
    inside: Cell<bool>,
}

thread_local! {
    static SAMPLER: SamplerState = const {
        SamplerState {
            countdown: Cell::new(0),
            rng: Cell::new(0),
            inside: Cell::new(false),
        }
    };
}

static SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

/// Decides whether the current allocation is sampled, so that on average a
/// fraction `probability` of calls is. 0 (or NaN) never samples, 1 always
/// does.
#[inline]
pub(crate) fn should_sample(probability: f64) -> bool {
    if probability.is_nan() || probability <= 0.0 {
        return false;
    }
    SAMPLER
        .try_with(|state| {
            if state.inside.get() {
                return false;
            }
            if probability >= 1.0 {
                return true;
            }
            let left = match state.countdown.get() {
                0 => draw_gap(state, probability),
                n => n,
            };
            if left == 1 {
                state.countdown.set(draw_gap(state, probability));
                true
            } else {
                state.countdown.set(left - 1);
                false
            }
        })
        .unwrap_or(false)
}

/// Returns true with probability `ppm / 1_000_000`.
#[inline]
pub(crate) fn chance(ppm: u32) -> bool {
    if ppm == 0 {
        return false;
    }
    SAMPLER
        .try_with(|state| next_random(state) % 1_000_000 < u64::from(ppm))
        .unwrap_or(false)
}

/// Marks this thread as inside the pool until the guard drops. `None` when
/// already inside: the caller must not sample or take pool paths again.
#[inline]
pub(crate) fn enter() -> Option<Reentrancy> {
    SAMPLER
        .try_with(|state| {
            if state.inside.replace(true) {
                None
            } else {
                Some(Reentrancy { _private: () })
            }
        })
        .ok()
        .flatten()
}

pub(crate) struct Reentrancy {
    _private: (),
}

impl Drop for Reentrancy {
    fn drop(&mut self) {
        let _ = SAMPLER.try_with(|state| state.inside.set(false));
    }
}

/// Calls up to and including the next sample. Geometric with success
/// probability `probability`, so the mean gap is exactly `1 / probability`.
fn draw_gap(state: &SamplerState, probability: f64) -> u32 {
    // Uniform on (0, 1].
    let u = ((next_random(state) >> 11) + 1) as f64 / (1u64 << 53) as f64;
    let gap = (u.ln() / (-probability).ln_1p()).floor() + 1.0;
    if gap >= u32::MAX as f64 {
        u32::MAX
    } else {
        gap.max(1.0) as u32
    }
}

fn next_random(state: &SamplerState) -> u64 {
    let mut x = state.rng.get();
    if x == 0 {
        x = splitmix64(SEED.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed) ^ (state as *const _ as u64));
        if x == 0 {
            x = 1;
        }
    }
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    state.rng.set(x);
    x
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
