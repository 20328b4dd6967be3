//! Maize crop-coefficient (Kc) curve indexed by days after sowing.
//!
//! Both evapotranspiration estimators scale their reference ETo through this
//! one function.

/// Kc applied before sowing and after the last growth segment.
pub const POST_HARVEST_KC: f64 = 0.35;

/// One growth stage: `[start_das, end_das)` with Kc interpolated linearly from
/// `kc_start` to `kc_end`. The last stage is closed at its end.
struct Segment {
    start_das: f64,
    end_das: f64,
    kc_start: f64,
    kc_end: f64,
}

// The jumps at 55 and 95 DAS are part of the published schedule.
const SEGMENTS: [Segment; 4] = [
    Segment {
        start_das: 0.0,
        end_das: 25.0,
        kc_start: 0.30,
        kc_end: 0.40,
    },
    Segment {
        start_das: 25.0,
        end_das: 55.0,
        kc_start: 0.40,
        kc_end: 0.80,
    },
    Segment {
        start_das: 55.0,
        end_das: 95.0,
        kc_start: 1.15,
        kc_end: 1.20,
    },
    Segment {
        start_das: 95.0,
        end_das: 120.0,
        kc_start: 0.70,
        kc_end: 0.35,
    },
];

/// Crop coefficient for maize `das` days after sowing.
pub fn maize_kc(das: f64) -> f64 {
    let last = SEGMENTS.len() - 1;
    for (i, seg) in SEGMENTS.iter().enumerate() {
        let inside = if i == last {
            (seg.start_das..=seg.end_das).contains(&das)
        } else {
            (seg.start_das..seg.end_das).contains(&das)
        };
        if inside {
            let frac = (das - seg.start_das) / (seg.end_das - seg.start_das);
            return seg.kc_start + (seg.kc_end - seg.kc_start) * frac;
        }
    }
    POST_HARVEST_KC
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn segment_endpoints() {
        assert!(close(maize_kc(0.0), 0.30));
        assert!(close(maize_kc(25.0), 0.40));
        assert!(close(maize_kc(55.0), 1.15));
        assert!(close(maize_kc(95.0), 0.70));
        assert!(close(maize_kc(120.0), 0.35));
    }

    #[test]
    fn boundary_jumps_are_kept() {
        // Approaching 55 from below lands near 0.80, then jumps to 1.15.
        assert!((maize_kc(54.999) - 0.80).abs() < 1e-3);
        assert!(close(maize_kc(55.0), 1.15));
        // Approaching 95 from below lands near 1.20, then drops to 0.70.
        assert!((maize_kc(94.999) - 1.20).abs() < 1e-3);
        assert!(close(maize_kc(95.0), 0.70));
    }

    #[test]
    fn midpoints_are_linear() {
        assert!(close(maize_kc(12.5), 0.35));
        assert!(close(maize_kc(40.0), 0.60));
        assert!(close(maize_kc(75.0), 1.175));
        assert!(close(maize_kc(107.5), 0.525));
    }

    #[test]
    fn outside_growth_window_is_post_harvest() {
        for das in [-10.0, -0.5, 120.5, 121.0, 365.0] {
            assert!(close(maize_kc(das), POST_HARVEST_KC), "das={das}");
        }
    }

    #[test]
    fn monotonic_within_each_segment() {
        for seg in &SEGMENTS {
            let rising = seg.kc_end > seg.kc_start;
            let mut prev = maize_kc(seg.start_das);
            let mut d = seg.start_das + 0.5;
            while d < seg.end_das {
                let kc = maize_kc(d);
                if rising {
                    assert!(kc >= prev, "not rising at das={d}");
                } else {
                    assert!(kc <= prev, "not falling at das={d}");
                }
                prev = kc;
                d += 0.5;
            }
        }
    }
}
