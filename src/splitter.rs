use crate::binning::BinMapper;
use crate::histogram::{Bin, HistogramMatrix};
use crate::node::SplittableNode;
use crate::utils::{gain, weight};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Where records with a missing value are sent, when a numeric
/// feature is split.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingDirection {
    /// Try both directions, and keep the one with the highest gain.
    #[default]
    Learn,
    Left,
    Right,
}

/// The gradient statistics of one side of a split.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub grad: f64,
    pub cover: f64,
    pub count: usize,
    pub gain: f64,
    pub weight: f64,
}

impl NodeInfo {
    fn new(l2: f64, grad: f64, cover: f64, count: usize) -> Self {
        NodeInfo {
            grad,
            cover,
            count,
            gain: gain(l2, grad, cover),
            weight: weight(l2, grad, cover),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SplitType {
    /// Every bin less than or equal to `split_bin` goes left, the missing
    /// bin follows `missing_left`.
    Numeric { split_bin: u16 },
    /// Every bin in `left_bins` (sorted) goes left, everything else,
    /// including the missing bin, goes right.
    Categorical { left_bins: Vec<u16> },
}

#[derive(Debug, Clone)]
pub struct SplitInfo {
    pub split_gain: f64,
    pub split_feature: usize,
    pub split_type: SplitType,
    pub missing_left: bool,
    pub left_node: NodeInfo,
    pub right_node: NodeInfo,
}

impl SplitInfo {
    /// Does a record with this bin of the split feature go to the left child.
    #[inline]
    pub fn goes_left(&self, bin: u16) -> bool {
        match &self.split_type {
            SplitType::Numeric { split_bin } => {
                if bin == 0 {
                    self.missing_left
                } else {
                    bin <= *split_bin
                }
            }
            SplitType::Categorical { left_bins } => {
                bin != 0 && left_bins.binary_search(&bin).is_ok()
            }
        }
    }

    /// The raw threshold of a numeric split, or the sorted categories
    /// that go left for a categorical one.
    pub fn split_value(&self, mapper: &BinMapper) -> (f64, Option<Vec<i64>>) {
        match &self.split_type {
            SplitType::Numeric { split_bin } => (mapper.bin_upper_bound(*split_bin), None),
            SplitType::Categorical { left_bins } => {
                let mut categories: Vec<i64> = left_bins
                    .iter()
                    .filter_map(|b| mapper.bin_category(*b))
                    .collect();
                categories.sort_unstable();
                (f64::NAN, Some(categories))
            }
        }
    }
}

/// Running totals of a set of bins.
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    grad: f64,
    hess: f64,
    count: usize,
}

impl Totals {
    fn add(&mut self, bin: &Bin) {
        self.grad += bin.gradient_sum;
        self.hess += bin.hessian_sum;
        self.count += bin.count as usize;
    }

    fn minus(&self, other: &Totals) -> Totals {
        Totals {
            grad: self.grad - other.grad,
            hess: self.hess - other.hess,
            count: self.count - other.count,
        }
    }

    fn plus(&self, other: &Totals) -> Totals {
        Totals {
            grad: self.grad + other.grad,
            hess: self.hess + other.hess,
            count: self.count + other.count,
        }
    }
}

/// Finds the best split of a node from its histograms.
#[derive(Debug, Clone)]
pub struct HistogramSplitter {
    pub l2: f64,
    pub gamma: f64,
    pub min_data_in_leaf: usize,
    pub min_sum_hessian_in_leaf: f64,
    pub missing_direction: MissingDirection,
    pub max_cat_to_onehot: usize,
    pub max_cat_threshold: usize,
    pub cat_l2: f64,
    pub cat_smooth: f64,
    pub min_data_per_group: usize,
    pub parallel: bool,
}

impl Default for HistogramSplitter {
    fn default() -> Self {
        HistogramSplitter {
            l2: 0.0,
            gamma: 0.0,
            min_data_in_leaf: 20,
            min_sum_hessian_in_leaf: 1e-3,
            missing_direction: MissingDirection::Learn,
            max_cat_to_onehot: 4,
            max_cat_threshold: 32,
            cat_l2: 10.0,
            cat_smooth: 10.0,
            min_data_per_group: 100,
            parallel: true,
        }
    }
}

impl HistogramSplitter {
    /// Find the best possible split, considering all feature histograms.
    /// Features are evaluated in parallel, but reduced in feature order,
    /// so that on equal gain the lowest feature index wins.
    pub fn best_split(&self, node: &SplittableNode, mappers: &[BinMapper]) -> Option<SplitInfo> {
        let totals = Totals {
            grad: node.gradient_sum,
            hess: node.hessian_sum,
            count: node.count,
        };
        let evaluate = |feature: usize| {
            if mappers[feature].is_categorical() {
                self.best_categorical_split(&node.histograms, feature, &totals)
            } else {
                self.best_numeric_split(&node.histograms, feature, &totals)
            }
        };
        let candidates: Vec<Option<SplitInfo>> = if self.parallel {
            (0..mappers.len()).into_par_iter().map(evaluate).collect()
        } else {
            (0..mappers.len()).map(evaluate).collect()
        };

        let mut best_split_info: Option<SplitInfo> = None;
        for info in candidates.into_iter().flatten() {
            let better = match &best_split_info {
                Some(best) => info.split_gain > best.split_gain,
                None => true,
            };
            if better {
                best_split_info = Some(info);
            }
        }
        best_split_info
    }

    fn valid_side(&self, side: &Totals) -> bool {
        side.count > 0
            && side.count >= self.min_data_in_leaf
            && side.hess >= self.min_sum_hessian_in_leaf
    }

    /// The gain of splitting the parent into left and right. `None` if
    /// either side violates the leaf constraints.
    fn split_gain(&self, l2: f64, parent: &Totals, left: &Totals, right: &Totals) -> Option<f64> {
        if !self.valid_side(left) || !self.valid_side(right) {
            return None;
        }
        let parent_gain = gain(l2, parent.grad, parent.hess);
        let split_gain = 0.5
            * (gain(l2, left.grad, left.hess) + gain(l2, right.grad, right.hess) - parent_gain)
            - self.gamma;
        Some(split_gain)
    }

    /// Scan the thresholds of a numeric feature, from the lowest bin upwards.
    /// The threshold at bin 0 sends only the missing records left, and the
    /// threshold at the last bin sends only the missing records right, so a
    /// feature can be split on missingness alone.
    fn best_numeric_split(
        &self,
        histograms: &HistogramMatrix,
        feature: usize,
        totals: &Totals,
    ) -> Option<SplitInfo> {
        let histogram = histograms.feature(feature);
        let mut missing = Totals::default();
        missing.add(&histogram[0]);

        let mut best: Option<(f64, u16, bool, Totals)> = None;
        let mut cuml = Totals::default();
        for (bin, b) in histogram.iter().enumerate() {
            if bin > 0 {
                cuml.add(b);
            }
            let without_missing = totals.minus(&cuml).minus(&missing);
            let options: &[bool] = match self.missing_direction {
                // With nothing missing, both directions are the same split.
                MissingDirection::Learn if missing.count == 0 => &[false],
                MissingDirection::Learn => &[false, true],
                MissingDirection::Left => &[true],
                MissingDirection::Right => &[false],
            };
            for missing_left in options {
                let (left, right) = if *missing_left {
                    (cuml.plus(&missing), without_missing)
                } else {
                    (cuml, without_missing.plus(&missing))
                };
                let split_gain = match self.split_gain(self.l2, totals, &left, &right) {
                    Some(g) => g,
                    None => continue,
                };
                let better = match &best {
                    Some((best_gain, ..)) => split_gain > *best_gain,
                    None => split_gain > 0.0,
                };
                if better {
                    best = Some((split_gain, bin as u16, *missing_left, left));
                }
            }
        }

        let (split_gain, split_bin, missing_left, left) = best?;
        let right = totals.minus(&left);
        Some(SplitInfo {
            split_gain,
            split_feature: feature,
            split_type: SplitType::Numeric { split_bin },
            missing_left,
            left_node: NodeInfo::new(self.l2, left.grad, left.hess, left.count),
            right_node: NodeInfo::new(self.l2, right.grad, right.hess, right.count),
        })
    }

    /// Find a partition of the categories of a feature. Features with few
    /// categories are split one category against the rest, otherwise the
    /// categories are ordered by their gradient ratio, and prefixes of this
    /// ordering are scanned from both ends.
    fn best_categorical_split(
        &self,
        histograms: &HistogramMatrix,
        feature: usize,
        totals: &Totals,
    ) -> Option<SplitInfo> {
        let histogram = histograms.feature(feature);
        let used: Vec<usize> = (1..histogram.len())
            .filter(|b| histogram[*b].count > 0)
            .collect();
        if used.is_empty() {
            return None;
        }

        // (gain, left bins, left totals)
        let mut best: Option<(f64, Vec<u16>, Totals)> = None;
        let mut consider = |split_gain: f64, left_bins: Vec<u16>, left: Totals| {
            let better = match &best {
                Some((best_gain, ..)) => split_gain > *best_gain,
                None => split_gain > 0.0,
            };
            if better {
                best = Some((split_gain, left_bins, left));
            }
        };

        if used.len() <= self.max_cat_to_onehot {
            for bin in &used {
                let mut left = Totals::default();
                left.add(&histogram[*bin]);
                let right = totals.minus(&left);
                if let Some(g) = self.split_gain(self.l2, totals, &left, &right) {
                    consider(g, vec![*bin as u16], left);
                }
            }
        } else {
            let l2 = self.l2 + self.cat_l2;
            let mut sorted: Vec<usize> = used
                .into_iter()
                .filter(|b| histogram[*b].count as usize >= self.min_data_per_group)
                .collect();
            let ratio = |b: &usize| {
                histogram[*b].gradient_sum / (histogram[*b].hessian_sum + self.cat_smooth)
            };
            sorted.sort_by(|a, b| ratio(a).total_cmp(&ratio(b)).then(a.cmp(b)));
            let max_num_cat = self.max_cat_threshold.min((sorted.len() + 1) / 2);

            // Forward scan takes categories with the smallest ratio, the
            // backward scan those with the largest.
            let orders: [Vec<usize>; 2] = [sorted.clone(), sorted.iter().rev().copied().collect()];
            for order in orders.iter() {
                let mut left = Totals::default();
                for k in 0..max_num_cat {
                    left.add(&histogram[order[k]]);
                    let right = totals.minus(&left);
                    if let Some(g) = self.split_gain(l2, totals, &left, &right) {
                        let mut left_bins: Vec<u16> =
                            order[..=k].iter().map(|b| *b as u16).collect();
                        left_bins.sort_unstable();
                        consider(g, left_bins, left);
                    }
                }
            }
        }

        let (split_gain, left_bins, left) = best?;
        let right = totals.minus(&left);
        Some(SplitInfo {
            split_gain,
            split_feature: feature,
            split_type: SplitType::Categorical { left_bins },
            missing_left: false,
            left_node: NodeInfo::new(self.l2, left.grad, left.hess, left.count),
            right_node: NodeInfo::new(self.l2, right.grad, right.hess, right.count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::JaggedMatrix;

    fn bin(gradient_sum: f64, hessian_sum: f64, count: u32) -> Bin {
        Bin {
            gradient_sum,
            hessian_sum,
            count,
        }
    }

    fn node_from(histograms: Vec<Vec<Bin>>) -> SplittableNode {
        let first = &histograms[0];
        let grad: f64 = first.iter().map(|b| b.gradient_sum).sum();
        let hess: f64 = first.iter().map(|b| b.hessian_sum).sum();
        let count: u32 = first.iter().map(|b| b.count).sum();
        SplittableNode::new(
            0,
            HistogramMatrix(JaggedMatrix::from_vecs(histograms)),
            weight(0.0, grad, hess),
            gain(0.0, grad, hess),
            grad,
            hess,
            count as usize,
            0,
            0,
            count as usize,
        )
    }

    fn numeric_mapper(n_bins: usize) -> BinMapper {
        let mut upper_bounds: Vec<f64> = (1..(n_bins - 1)).map(|b| b as f64 + 0.5).collect();
        upper_bounds.push(f64::INFINITY);
        BinMapper::Numeric { upper_bounds }
    }

    fn splitter() -> HistogramSplitter {
        HistogramSplitter {
            min_data_in_leaf: 1,
            min_sum_hessian_in_leaf: 0.0,
            parallel: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_numeric_split() {
        // Negative gradients in the first two bins, positive in the last two.
        let hist = vec![
            bin(0.0, 0.0, 0),
            bin(-5.0, 5.0, 5),
            bin(-5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
        ];
        let node = node_from(vec![hist]);
        let s = splitter();
        let info = s.best_split(&node, &[numeric_mapper(5)]).unwrap();
        assert_eq!(info.split_type, SplitType::Numeric { split_bin: 2 });
        assert_eq!(info.left_node.count, 10);
        assert_eq!(info.right_node.count, 10);
        // 0.5 * (100/10 + 100/10 - 0) = 10
        assert!((info.split_gain - 10.0).abs() < 1e-9);
        assert!((info.left_node.weight - 1.0).abs() < 1e-9);
        assert!(!info.missing_left);
    }

    #[test]
    fn test_missing_learned_direction() {
        let hist = vec![
            bin(-4.0, 4.0, 4),
            bin(-5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
        ];
        let node = node_from(vec![hist.clone()]);
        let info = splitter().best_split(&node, &[numeric_mapper(3)]).unwrap();
        assert!(info.missing_left);
        assert_eq!(info.left_node.count, 9);
        assert!(info.goes_left(0));
        assert!(info.goes_left(1));
        assert!(!info.goes_left(2));

        let forced = HistogramSplitter {
            missing_direction: MissingDirection::Right,
            ..splitter()
        };
        let info = forced.best_split(&node, &[numeric_mapper(3)]).unwrap();
        assert!(!info.missing_left);
        assert_eq!(info.right_node.count, 9);
    }

    #[test]
    fn test_min_data_in_leaf() {
        let hist = vec![
            bin(0.0, 0.0, 0),
            bin(-5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
        ];
        let node = node_from(vec![hist]);
        let s = HistogramSplitter {
            min_data_in_leaf: 6,
            ..splitter()
        };
        assert!(s.best_split(&node, &[numeric_mapper(3)]).is_none());
    }

    #[test]
    fn test_gamma_prevents_split() {
        let hist = vec![bin(0.0, 0.0, 0), bin(-1.0, 5.0, 5), bin(1.0, 5.0, 5)];
        let node = node_from(vec![hist]);
        // The split gain is 0.5 * (0.2 + 0.2) = 0.2
        let s = HistogramSplitter {
            gamma: 0.25,
            ..splitter()
        };
        assert!(s.best_split(&node, &[numeric_mapper(3)]).is_none());
        let s = HistogramSplitter {
            gamma: 0.15,
            ..splitter()
        };
        let info = s.best_split(&node, &[numeric_mapper(3)]).unwrap();
        assert!((info.split_gain - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_feature_tie_break() {
        let hist = vec![
            bin(0.0, 0.0, 0),
            bin(-5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
        ];
        let node = node_from(vec![hist.clone(), hist.clone(), hist]);
        let mappers = vec![numeric_mapper(3), numeric_mapper(3), numeric_mapper(3)];
        let s = HistogramSplitter {
            parallel: true,
            ..splitter()
        };
        let info = s.best_split(&node, &mappers).unwrap();
        assert_eq!(info.split_feature, 0);
    }

    #[test]
    fn test_missing_only_split() {
        // The only signal is whether the value is missing.
        let hist = vec![bin(-10.0, 5.0, 5), bin(10.0, 5.0, 5)];
        let node = node_from(vec![hist]);
        let mapper = numeric_mapper(2);
        let info = splitter().best_split(&node, &[mapper.clone()]).unwrap();
        assert_eq!(info.split_type, SplitType::Numeric { split_bin: 0 });
        assert!(info.missing_left);
        assert!(info.goes_left(0));
        assert!(!info.goes_left(1));
        assert!((info.split_gain - 20.0).abs() < 1e-9);
        assert!(info.split_value(&mapper).0.is_nan());

        let forced = HistogramSplitter {
            missing_direction: MissingDirection::Right,
            ..splitter()
        };
        let info = forced.best_split(&node, &[mapper.clone()]).unwrap();
        assert_eq!(info.split_type, SplitType::Numeric { split_bin: 1 });
        assert!(!info.missing_left);
        assert!(info.goes_left(1));
        assert!(!info.goes_left(0));
        assert_eq!(info.split_value(&mapper).0, f64::INFINITY);
    }

    #[test]
    fn test_missing_against_all_values() {
        let hist = vec![bin(-10.0, 5.0, 5), bin(5.0, 5.0, 5), bin(5.0, 5.0, 5)];
        let node = node_from(vec![hist]);
        let info = splitter().best_split(&node, &[numeric_mapper(3)]).unwrap();
        assert_eq!(info.left_node.count, 5);
        assert_eq!(info.right_node.count, 10);
        assert!(info.goes_left(0));
        assert!(!info.goes_left(1));
        assert!(!info.goes_left(2));
        // 0.5 * (100/5 + 100/10 - 0) = 15
        assert!((info.split_gain - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_value_feature_skipped() {
        let hist = vec![bin(0.0, 0.0, 0), bin(-5.0, 5.0, 5), bin(5.0, 5.0, 5)];
        let flat = vec![bin(0.0, 0.0, 0), bin(0.0, 10.0, 10)];
        let node = node_from(vec![flat, hist]);
        let mappers = vec![
            BinMapper::Numeric {
                upper_bounds: vec![f64::INFINITY],
            },
            numeric_mapper(3),
        ];
        let info = splitter().best_split(&node, &mappers).unwrap();
        assert_eq!(info.split_feature, 1);
    }

    fn categorical_mapper(n: usize) -> BinMapper {
        let categories: Vec<i64> = (0..n as i64).map(|c| c * 10).collect();
        let lookup = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, (i + 1) as u16))
            .collect();
        BinMapper::Categorical { categories, lookup }
    }

    #[test]
    fn test_categorical_one_hot() {
        let hist = vec![
            bin(0.0, 0.0, 0),
            bin(1.0, 5.0, 5),
            bin(-8.0, 5.0, 5),
            bin(1.0, 5.0, 5),
        ];
        let node = node_from(vec![hist]);
        let mapper = categorical_mapper(3);
        let info = splitter().best_split(&node, &[mapper.clone()]).unwrap();
        assert_eq!(info.split_type, SplitType::Categorical { left_bins: vec![2] });
        assert!(!info.goes_left(0));
        assert!(info.goes_left(2));
        let (_, categories) = info.split_value(&mapper);
        assert_eq!(categories, Some(vec![10]));
    }

    #[test]
    fn test_categorical_many_vs_many() {
        // Categories 2, 4 and 6 have negative gradients.
        let hist = vec![
            bin(0.0, 0.0, 0),
            bin(5.0, 5.0, 5),
            bin(-5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
            bin(-5.0, 5.0, 5),
            bin(5.0, 5.0, 5),
            bin(-5.0, 5.0, 5),
        ];
        let node = node_from(vec![hist]);
        let s = HistogramSplitter {
            max_cat_to_onehot: 2,
            min_data_per_group: 1,
            cat_l2: 0.0,
            cat_smooth: 0.0,
            ..splitter()
        };
        let mapper = categorical_mapper(6);
        let info = s.best_split(&node, &[mapper.clone()]).unwrap();
        assert_eq!(
            info.split_type,
            SplitType::Categorical {
                left_bins: vec![2, 4, 6]
            }
        );
        assert_eq!(info.left_node.count, 15);
        let (_, categories) = info.split_value(&mapper);
        assert_eq!(categories, Some(vec![10, 30, 50]));
    }
}
