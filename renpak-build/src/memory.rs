//! Phase A memory budget
//!
//! Sequence encoding buffers whole groups of decoded RGBA frames, so
//! admission is gated on an estimate of the bytes each group will pin.

/// Assumed decoded footprint per frame: 1080p RGBA with decode and encoder
/// scratch headroom (≈ 24 MiB).
pub const ASSUMED_FRAME_BYTES: u64 = 1920 * 1080 * 4 * 3;

/// Baseline attributed to each worker before any frames are buffered.
const PER_WORKER_BASELINE: u64 = 256 * 1024 * 1024;

const MIN_BUDGET: u64 = 1 << 30;
const DEFAULT_BUDGET: u64 = 4 << 30;

/// Probes available system memory and computes the Phase A budget:
/// `0.5 × available − workers × baseline`, floored at 1 GiB. Falls back to
/// 4 GiB when the probe reports nothing.
pub fn phase_a_budget(workers: usize) -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    budget_from_available(sys.available_memory(), workers)
}

fn budget_from_available(available: u64, workers: usize) -> u64 {
    if available == 0 {
        return DEFAULT_BUDGET;
    }
    (available / 2)
        .saturating_sub(PER_WORKER_BASELINE.saturating_mul(workers as u64))
        .max(MIN_BUDGET)
}

/// Estimated bytes a group pins while in flight.
pub fn group_estimate(frame_count: usize, assumed_frame_bytes: u64) -> u64 {
    (frame_count as u64).saturating_mul(assumed_frame_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_probe_uses_default() {
        assert_eq!(budget_from_available(0, 8), DEFAULT_BUDGET);
    }

    #[test]
    fn test_small_systems_hit_the_floor() {
        assert_eq!(budget_from_available(2 << 30, 8), MIN_BUDGET);
    }

    #[test]
    fn test_large_systems_use_half_minus_baseline() {
        let available = 64u64 << 30;
        let budget = budget_from_available(available, 4);
        assert_eq!(budget, available / 2 - 4 * PER_WORKER_BASELINE);
    }

    #[test]
    fn test_group_estimate_scales_with_frames() {
        assert_eq!(group_estimate(3, 10), 30);
        assert_eq!(group_estimate(12, ASSUMED_FRAME_BYTES), 12 * ASSUMED_FRAME_BYTES);
    }
}
