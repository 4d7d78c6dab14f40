//! Range-of-motion estimator (spec.md §4.5): integrates velocity into
//! displacement and derives per-rep / per-set ROM metrics.

const ROUND_DECIMALS: f64 = 1000.0;

fn round3(v: f64) -> f64 {
    (v * ROUND_DECIMALS).round() / ROUND_DECIMALS
}

pub struct RomEstimator {
    position: f64,
    rep_baseline: f64,
    rep_min: f64,
    rep_max: f64,
    completed_roms: Vec<f64>,
    partial_ratio: f64,
}

impl RomEstimator {
    pub fn new(partial_ratio: f64) -> Self {
        Self {
            position: 0.0,
            rep_baseline: 0.0,
            rep_min: f64::INFINITY,
            rep_max: f64::NEG_INFINITY,
            completed_roms: Vec::new(),
            partial_ratio,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.rep_baseline = 0.0;
        self.rep_min = f64::INFINITY;
        self.rep_max = f64::NEG_INFINITY;
        self.completed_roms.clear();
    }

    pub fn step(&mut self, velocity: f64, dt: f64) {
        self.position += velocity * dt;
        let abs_pos = self.position.abs();
        self.rep_min = self.rep_min.min(abs_pos);
        self.rep_max = self.rep_max.max(abs_pos);
    }

    pub fn rep_start(&mut self) {
        self.rep_baseline = self.position;
        self.rep_min = self.position.abs();
        self.rep_max = self.position.abs();
    }

    /// Returns (rom_meters, is_partial).
    pub fn rep_complete(&mut self) -> (f64, bool) {
        let rom = round3(self.rep_max - self.rep_min);
        let is_partial = match self.avg_rom() {
            Some(avg) if avg > 0.0 => rom < avg * self.partial_ratio,
            _ => false,
        };
        self.completed_roms.push(rom);
        (rom, is_partial)
    }

    pub fn completed(&self) -> &[f64] {
        &self.completed_roms
    }

    pub fn avg_rom(&self) -> Option<f64> {
        if self.completed_roms.is_empty() {
            None
        } else {
            Some(self.completed_roms.iter().sum::<f64>() / self.completed_roms.len() as f64)
        }
    }

    pub fn rom_loss_pct(&self) -> Option<f64> {
        if self.completed_roms.len() < 2 {
            return None;
        }
        let first = self.completed_roms[0];
        if first <= 0.0 {
            return None;
        }
        let last = *self.completed_roms.last().unwrap();
        Some(((1.0 - last / first) * 100.0).clamp(0.0, 100.0))
    }

    /// Coefficient of variation (std/mean * 100) across completed reps.
    pub fn rom_consistency(&self) -> Option<f64> {
        let n = self.completed_roms.len();
        if n == 0 {
            return None;
        }
        let mean = self.completed_roms.iter().sum::<f64>() / n as f64;
        if mean == 0.0 {
            return None;
        }
        let variance =
            self.completed_roms.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        Some((variance.sqrt() / mean) * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rep_rom_is_max_minus_min_abs_position() {
        let mut rom = RomEstimator::new(0.7);
        rom.rep_start();
        rom.step(1.0, 0.1); // position 0.1
        rom.step(1.0, 0.1); // position 0.2
        rom.step(-1.0, 0.1); // position 0.1
        let (value, _partial) = rom.rep_complete();
        assert!((value - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rom_loss_none_below_two_reps() {
        let mut rom = RomEstimator::new(0.7);
        rom.rep_start();
        rom.step(1.0, 0.1);
        rom.rep_complete();
        assert_eq!(rom.rom_loss_pct(), None);
    }

    #[test]
    fn partial_rep_flagged_below_threshold_of_average() {
        let mut rom = RomEstimator::new(0.7);
        rom.rep_start();
        rom.step(1.0, 1.0);
        rom.rep_complete(); // rom = 1.0, avg undefined at call time (no prior reps)

        rom.rep_start();
        rom.step(1.0, 1.0);
        rom.rep_complete(); // rom = 1.0 again, avg = 1.0 so not partial

        rom.rep_start();
        rom.step(0.5, 1.0);
        let (_, partial) = rom.rep_complete(); // rom = 0.5 < 0.7 * 1.0
        assert!(partial);
    }
}
