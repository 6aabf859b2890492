// =============================================================================
// Weighted bin accumulator — distance-weighted 2-D cell aggregation
// =============================================================================
//
// Aggregates irregular (x, y, value) triples onto a fixed K×L grid. Samples
// closer to a cell's center contribute more than samples near the edges:
//
//   weight = -log10(max(d², ε)) / (d + 1)⁴
//
// where d is the sample's normalized distance to the nearest cell center,
// scaled by the axis spans. Samples beyond the saturation distance still get
// a minimum positive weight, never zero. A uniform strategy and plain
// max/min/sum aggregations are also available; for those, weighting is
// disabled and the per-cell count gates the output the same way.
//
// Cells with fewer than `min_samples_per_cell` hits are absent from the
// output, never a stale weighted value.
// =============================================================================

use serde::Serialize;

/// Floor inside the log so d = 0 stays finite.
const DISTANCE_EPSILON: f64 = 1e-10;
/// Weight assigned past the saturation distance; positive by contract.
const SATURATION_WEIGHT: f64 = 1e-3;

/// How sample distance maps to weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightingStrategy {
    /// TuneLab-style logarithmic falloff from the cell center.
    Logarithmic,
    /// Every accepted sample weighs 1.
    Uniform,
}

/// Per-cell aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Distance-weighted mean (the default).
    WeightedMean,
    Max,
    Min,
    Sum,
}

/// Accumulator configuration.
#[derive(Debug, Clone)]
pub struct BinConfig {
    pub strategy: WeightingStrategy,
    pub aggregation: Aggregation,
    pub min_samples_per_cell: u64,
    /// Normalized distance beyond which the weight saturates to the floor.
    pub saturation_distance: f64,
}

impl Default for BinConfig {
    fn default() -> Self {
        Self {
            strategy: WeightingStrategy::Logarithmic,
            aggregation: Aggregation::WeightedMean,
            min_samples_per_cell: 1,
            saturation_distance: 0.95,
        }
    }
}

/// Sample accounting for a filled accumulator.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BinStats {
    pub samples_added: u64,
    pub samples_rejected: u64,
}

/// Distance-weighted 2-D accumulator over an ordered x-axis (e.g. RPM bins)
/// and y-axis (e.g. MAP bins). Axis values must be strictly increasing.
pub struct WeightedBinAccumulator {
    x_axis: Vec<f64>,
    y_axis: Vec<f64>,
    config: BinConfig,
    // Flattened row-major (x_idx * y_len + y_idx).
    weighted_sum: Vec<f64>,
    weight_sum: Vec<f64>,
    agg_value: Vec<f64>,
    hit_count: Vec<u64>,
    stats: BinStats,
}

impl WeightedBinAccumulator {
    pub fn new(x_axis: Vec<f64>, y_axis: Vec<f64>, config: BinConfig) -> Self {
        debug_assert!(x_axis.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(y_axis.windows(2).all(|w| w[0] < w[1]));
        let cells = x_axis.len() * y_axis.len();
        Self {
            x_axis,
            y_axis,
            config,
            weighted_sum: vec![0.0; cells],
            weight_sum: vec![0.0; cells],
            agg_value: vec![0.0; cells],
            hit_count: vec![0; cells],
            stats: BinStats::default(),
        }
    }

    pub fn x_len(&self) -> usize {
        self.x_axis.len()
    }

    pub fn y_len(&self) -> usize {
        self.y_axis.len()
    }

    /// Index of the axis value nearest to `v`; ties break to the lower index.
    pub fn nearest_bin(axis: &[f64], v: f64) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (i, &b) in axis.iter().enumerate() {
            let d = (v - b).abs();
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    }

    /// A sample is in-axis when it lies within the grid extended by half the
    /// edge spacing on each side.
    fn in_axis(axis: &[f64], v: f64) -> bool {
        let n = axis.len();
        if n == 1 {
            return true;
        }
        let lo = axis[0] - (axis[1] - axis[0]) / 2.0;
        let hi = axis[n - 1] + (axis[n - 1] - axis[n - 2]) / 2.0;
        v >= lo && v <= hi
    }

    /// Normalized distance from a sample to a cell center, using the axis
    /// spans as scale. Clamped to [0, 1].
    fn normalized_distance(&self, x: f64, y: f64, xi: usize, yi: usize) -> f64 {
        let x_span = (self.x_axis[self.x_axis.len() - 1] - self.x_axis[0]).max(f64::MIN_POSITIVE);
        let y_span = (self.y_axis[self.y_axis.len() - 1] - self.y_axis[0]).max(f64::MIN_POSITIVE);
        let dx = (x - self.x_axis[xi]).abs() / x_span;
        let dy = (y - self.y_axis[yi]).abs() / y_span;
        (dx * dx + dy * dy).sqrt().min(1.0)
    }

    /// Logarithmic weight for a normalized distance.
    pub fn logarithmic_weight(d: f64, saturation: f64) -> f64 {
        if d >= saturation {
            return SATURATION_WEIGHT;
        }
        let w = -(d * d).max(DISTANCE_EPSILON).log10() / (d + 1.0).powi(4);
        w.max(SATURATION_WEIGHT)
    }

    /// Add one sample. Returns false when the sample was rejected
    /// (non-finite input or outside the axes); rejected samples never touch
    /// the accumulators.
    pub fn add_sample(&mut self, x: f64, y: f64, value: f64) -> bool {
        if !x.is_finite() || !y.is_finite() || !value.is_finite() {
            self.stats.samples_rejected += 1;
            return false;
        }
        if !Self::in_axis(&self.x_axis, x) || !Self::in_axis(&self.y_axis, y) {
            self.stats.samples_rejected += 1;
            return false;
        }

        let xi = Self::nearest_bin(&self.x_axis, x);
        let yi = Self::nearest_bin(&self.y_axis, y);
        let idx = xi * self.y_axis.len() + yi;
        let first_hit = self.hit_count[idx] == 0;

        match self.config.aggregation {
            Aggregation::WeightedMean => {
                let w = match self.config.strategy {
                    WeightingStrategy::Logarithmic => {
                        let d = self.normalized_distance(x, y, xi, yi);
                        Self::logarithmic_weight(d, self.config.saturation_distance)
                    }
                    WeightingStrategy::Uniform => 1.0,
                };
                self.weighted_sum[idx] += w * value;
                self.weight_sum[idx] += w;
            }
            Aggregation::Max => {
                if first_hit || value > self.agg_value[idx] {
                    self.agg_value[idx] = value;
                }
            }
            Aggregation::Min => {
                if first_hit || value < self.agg_value[idx] {
                    self.agg_value[idx] = value;
                }
            }
            Aggregation::Sum => {
                self.agg_value[idx] += value;
            }
        }

        self.hit_count[idx] += 1;
        self.stats.samples_added += 1;
        true
    }

    /// Final value for a cell, or None below the minimum hit count.
    pub fn cell(&self, xi: usize, yi: usize) -> Option<f64> {
        let idx = xi * self.y_axis.len() + yi;
        if self.hit_count[idx] < self.config.min_samples_per_cell {
            return None;
        }
        match self.config.aggregation {
            Aggregation::WeightedMean => {
                if self.weight_sum[idx] > 0.0 {
                    Some(self.weighted_sum[idx] / self.weight_sum[idx])
                } else {
                    None
                }
            }
            _ => Some(self.agg_value[idx]),
        }
    }

    /// Full output matrix, shape (x_len, y_len).
    pub fn table(&self) -> Vec<Vec<Option<f64>>> {
        (0..self.x_axis.len())
            .map(|xi| (0..self.y_axis.len()).map(|yi| self.cell(xi, yi)).collect())
            .collect()
    }

    /// Per-cell hit counts, shape (x_len, y_len).
    pub fn hit_counts(&self) -> Vec<Vec<u64>> {
        (0..self.x_axis.len())
            .map(|xi| {
                (0..self.y_axis.len())
                    .map(|yi| self.hit_count[xi * self.y_axis.len() + yi])
                    .collect()
            })
            .collect()
    }

    pub fn stats(&self) -> BinStats {
        self.stats
    }

    pub fn x_axis(&self) -> &[f64] {
        &self.x_axis
    }

    pub fn y_axis(&self) -> &[f64] {
        &self.y_axis
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> (Vec<f64>, Vec<f64>) {
        (
            vec![1000.0, 2000.0, 3000.0, 4000.0],
            vec![20.0, 40.0, 60.0, 80.0, 100.0],
        )
    }

    #[test]
    fn center_sample_outweighs_edge_sample() {
        let w_center = WeightedBinAccumulator::logarithmic_weight(0.0, 0.95);
        let w_near = WeightedBinAccumulator::logarithmic_weight(0.05, 0.95);
        let w_far = WeightedBinAccumulator::logarithmic_weight(0.5, 0.95);
        assert!(w_center > w_near);
        assert!(w_near > w_far);
        assert!(w_far > 0.0);
    }

    #[test]
    fn saturated_distance_keeps_minimum_positive_weight() {
        let w = WeightedBinAccumulator::logarithmic_weight(0.99, 0.95);
        assert!(w > 0.0);
        assert!(w <= WeightedBinAccumulator::logarithmic_weight(0.5, 0.95));
    }

    #[test]
    fn nearest_bin_tie_breaks_to_lower_index() {
        let axis = [1000.0, 2000.0, 3000.0];
        // Exactly between 1000 and 2000.
        assert_eq!(WeightedBinAccumulator::nearest_bin(&axis, 1500.0), 0);
        assert_eq!(WeightedBinAccumulator::nearest_bin(&axis, 1501.0), 1);
        assert_eq!(WeightedBinAccumulator::nearest_bin(&axis, 2999.0), 2);
    }

    #[test]
    fn output_shape_matches_axes() {
        let (x, y) = axes();
        let acc = WeightedBinAccumulator::new(x.clone(), y.clone(), BinConfig::default());
        let table = acc.table();
        assert_eq!(table.len(), x.len());
        assert!(table.iter().all(|row| row.len() == y.len()));
    }

    #[test]
    fn single_sample_fills_only_its_cell() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(x, y, BinConfig::default());
        assert!(acc.add_sample(3000.0, 60.0, 13.2));

        let table = acc.table();
        assert!((table[2][2].unwrap() - 13.2).abs() < 1e-12);
        let filled = table
            .iter()
            .flatten()
            .filter(|c| c.is_some())
            .count();
        assert_eq!(filled, 1);
    }

    #[test]
    fn cells_below_min_hits_are_absent_not_zero() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(
            x,
            y,
            BinConfig {
                min_samples_per_cell: 3,
                ..BinConfig::default()
            },
        );
        acc.add_sample(2000.0, 40.0, 14.0);
        acc.add_sample(2000.0, 40.0, 14.0);
        assert_eq!(acc.cell(1, 1), None);

        acc.add_sample(2000.0, 40.0, 14.0);
        assert!(acc.cell(1, 1).is_some());
    }

    #[test]
    fn weighted_mean_favors_on_center_values() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(x, y, BinConfig::default());
        // Dead-center sample at 10.0, off-center sample at 20.0.
        acc.add_sample(2000.0, 40.0, 10.0);
        acc.add_sample(2300.0, 47.0, 20.0);

        let v = acc.cell(1, 1).unwrap();
        assert!(v > 10.0 && v < 15.0, "weighted mean should sit near 10, got {v}");
    }

    #[test]
    fn non_finite_samples_are_rejected() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(x, y, BinConfig::default());
        assert!(!acc.add_sample(f64::NAN, 40.0, 1.0));
        assert!(!acc.add_sample(2000.0, f64::INFINITY, 1.0));
        assert!(!acc.add_sample(2000.0, 40.0, f64::NEG_INFINITY));

        let stats = acc.stats();
        assert_eq!(stats.samples_added, 0);
        assert_eq!(stats.samples_rejected, 3);
        assert!(acc.table().iter().flatten().all(|c| c.is_none()));
    }

    #[test]
    fn out_of_axis_samples_are_rejected() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(x, y, BinConfig::default());
        assert!(!acc.add_sample(9000.0, 40.0, 1.0));
        assert!(!acc.add_sample(2000.0, 300.0, 1.0));
        // Just past the last bin but within half a spacing stays in.
        assert!(acc.add_sample(4400.0, 100.0, 1.0));
        assert_eq!(acc.stats().samples_rejected, 2);
    }

    #[test]
    fn total_samples_preserved_in_stats() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(x, y, BinConfig::default());
        for i in 0..10 {
            acc.add_sample(1000.0 + (i as f64) * 300.0, 60.0, 1.0);
        }
        let stats = acc.stats();
        assert_eq!(stats.samples_added + stats.samples_rejected, 10);
    }

    #[test]
    fn max_min_sum_variants() {
        let (x, y) = axes();
        for (agg, expected) in [
            (Aggregation::Max, 30.0),
            (Aggregation::Min, 10.0),
            (Aggregation::Sum, 60.0),
        ] {
            let mut acc = WeightedBinAccumulator::new(
                x.clone(),
                y.clone(),
                BinConfig {
                    aggregation: agg,
                    ..BinConfig::default()
                },
            );
            for v in [20.0, 10.0, 30.0] {
                acc.add_sample(2000.0, 40.0, v);
            }
            assert!((acc.cell(1, 1).unwrap() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn uniform_strategy_is_a_plain_mean() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(
            x,
            y,
            BinConfig {
                strategy: WeightingStrategy::Uniform,
                ..BinConfig::default()
            },
        );
        acc.add_sample(2000.0, 40.0, 10.0);
        acc.add_sample(2300.0, 47.0, 20.0);
        assert!((acc.cell(1, 1).unwrap() - 15.0).abs() < 1e-12);
    }

    #[test]
    fn hit_counts_track_every_accepted_sample() {
        let (x, y) = axes();
        let mut acc = WeightedBinAccumulator::new(x, y, BinConfig::default());
        for _ in 0..5 {
            acc.add_sample(1000.0, 20.0, 1.0);
        }
        let hits = acc.hit_counts();
        assert_eq!(hits[0][0], 5);
        assert_eq!(hits[1][1], 0);
    }
}
