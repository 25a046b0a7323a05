const BASELINE_BPS: f64 = 5_000_000.0;
const GROW_AT: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct AdaptiveScale {
    scale_bps: f64,
    peak_bps: f64,
}

impl Default for AdaptiveScale {
    fn default() -> Self {
        Self {
            scale_bps: BASELINE_BPS,
            peak_bps: 0.0,
        }
    }
}

impl AdaptiveScale {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn observe(&mut self, bits_per_second: f64) -> f64 {
        if bits_per_second > self.peak_bps {
            self.peak_bps = bits_per_second;
        }
        if bits_per_second > self.scale_bps * GROW_AT {
            let target = (bits_per_second * 1.3).max(self.scale_bps * 1.5);
            self.scale_bps = target.min(self.peak_bps * 2.0);
        }
        (bits_per_second / self.scale_bps * 100.0).min(100.0)
    }
}
