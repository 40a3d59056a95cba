use crate::data::{FloatData, Matrix};
use crate::errors::HistBoostError;
use crate::utils::{first_greater_than_or_equal, is_missing, midpoint};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};

// We want to be able to bin our dataset into discrete buckets.
// Every feature has its own bin mapper. The very first bin (0) is
// always reserved for missing values, the remaining bins hold either
// a quantized range of a numeric feature, or a single category.
// If we generated these upper bounds:
// [0.5, 7.9, 14.45, 31.0, inf]
// We would have a feature with bins 0 (missing), 1, 2, 3, 4, 5
// a split that is [bin <= 3] would translate to [feature <= 14.45]

/// The mapping from raw values to bins for a single feature.
#[derive(Debug, Clone, PartialEq)]
pub enum BinMapper {
    /// Bin `i + 1` holds every value `v` with
    /// `upper_bounds[i - 1] < v <= upper_bounds[i]`.
    /// The last bound is always infinite.
    Numeric { upper_bounds: Vec<f64> },
    /// Bin `i + 1` holds the category `categories[i]`. Categories
    /// are ordered by their frequency in the training data, and
    /// `lookup` is sorted by category for searching.
    Categorical {
        categories: Vec<i64>,
        lookup: Vec<(i64, u16)>,
    },
}

impl BinMapper {
    /// Generate the bins for a numeric feature.
    ///
    /// * `values` - The non missing values of the feature, with their sample weight.
    /// * `max_bin` - The maximum number of bins, including the missing bin.
    pub fn numeric(mut values: Vec<(f64, f64)>, max_bin: usize) -> Self {
        values.sort_by(|a, b| a.0.total_cmp(&b.0));
        // Merge duplicates, so that no value can ever straddle
        // a bin boundary.
        let mut distinct: Vec<f64> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for (v, w) in values {
            match distinct.last() {
                Some(last) if *last == v => {
                    if let Some(lw) = weights.last_mut() {
                        *lw += w;
                    }
                }
                _ => {
                    distinct.push(v);
                    weights.push(w);
                }
            }
        }

        let value_bins = max_bin - 1;
        let mut upper_bounds = Vec::new();
        if distinct.len() <= value_bins {
            for pair in distinct.windows(2) {
                upper_bounds.push(midpoint(pair[0], pair[1]));
            }
        } else {
            // Greedy weighted quantiles, every bin is closed once it has
            // accumulated its fair share of the weight that remains.
            let mut remaining_weight: f64 = weights.iter().sum();
            let mut remaining_bins = value_bins;
            let mut cumulative = 0.0;
            for i in 0..(distinct.len() - 1) {
                if remaining_bins <= 1 {
                    break;
                }
                cumulative += weights[i];
                let target = remaining_weight / remaining_bins as f64;
                // The number of distinct values left must be able to fill
                // the number of bins left.
                let values_left = distinct.len() - (i + 1);
                if cumulative >= target || values_left < remaining_bins {
                    upper_bounds.push(midpoint(distinct[i], distinct[i + 1]));
                    remaining_weight -= cumulative;
                    remaining_bins -= 1;
                    cumulative = 0.0;
                }
            }
        }
        upper_bounds.push(f64::INFINITY);
        BinMapper::Numeric { upper_bounds }
    }

    /// Generate the bins for a categorical feature. The values are truncated
    /// to integers, negative values are considered missing. Only the
    /// `max_bin - 1` most frequent categories receive their own bin, the rest
    /// share the missing bin.
    pub fn categorical(values: Vec<(f64, f64)>, max_bin: usize) -> Self {
        let mut counts: BTreeMap<i64, f64> = BTreeMap::new();
        for (v, w) in values {
            if v < 0.0 {
                continue;
            }
            *counts.entry(v as i64).or_insert(0.0) += w;
        }
        let mut ranked: Vec<(i64, f64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(max_bin - 1);
        let categories: Vec<i64> = ranked.iter().map(|(c, _)| *c).collect();
        let mut lookup: Vec<(i64, u16)> = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, (i + 1) as u16))
            .collect();
        lookup.sort_unstable();
        BinMapper::Categorical { categories, lookup }
    }

    /// Total number of bins, including the missing bin.
    pub fn n_bins(&self) -> usize {
        match self {
            BinMapper::Numeric { upper_bounds } => upper_bounds.len() + 1,
            BinMapper::Categorical { categories, .. } => categories.len() + 1,
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, BinMapper::Categorical { .. })
    }

    /// A feature is trivial, if there is no possible way to split on it.
    /// A single value feature can still be split on, if some of its
    /// values are missing.
    pub fn is_trivial(&self, has_missing: bool) -> bool {
        let value_bins = match self {
            BinMapper::Numeric { upper_bounds } => upper_bounds.len(),
            BinMapper::Categorical { categories, .. } => categories.len(),
        };
        value_bins + usize::from(has_missing) <= 1
    }

    /// Map a raw value to its bin.
    pub fn value_to_bin(&self, value: f64, missing: f64) -> u16 {
        if is_missing(value, missing) {
            return 0;
        }
        match self {
            BinMapper::Numeric { upper_bounds } => {
                (first_greater_than_or_equal(upper_bounds, value) + 1) as u16
            }
            BinMapper::Categorical { lookup, .. } => {
                if value < 0.0 {
                    return 0;
                }
                let cat = value as i64;
                match lookup.binary_search_by(|(c, _)| c.cmp(&cat)) {
                    Ok(i) => lookup[i].1,
                    Err(_) => 0,
                }
            }
        }
    }

    /// The raw threshold of a numeric bin, values less than or equal
    /// to this threshold fall in this bin, or a lower one.
    pub fn bin_upper_bound(&self, bin: u16) -> f64 {
        match self {
            BinMapper::Numeric { upper_bounds } => {
                if bin == 0 {
                    f64::NAN
                } else {
                    upper_bounds[(bin - 1) as usize]
                }
            }
            BinMapper::Categorical { .. } => f64::NAN,
        }
    }

    /// The category a categorical bin represents.
    pub fn bin_category(&self, bin: u16) -> Option<i64> {
        match self {
            BinMapper::Categorical { categories, .. } if bin > 0 => {
                categories.get((bin - 1) as usize).copied()
            }
            _ => None,
        }
    }
}

/// The binned representation of a training dataset. Column major,
/// so each feature's bins are contiguous.
#[derive(Debug, Clone)]
pub struct BinnedDataset {
    pub binned_data: Vec<u16>,
    pub mappers: Vec<BinMapper>,
    pub rows: usize,
    pub cols: usize,
}

impl BinnedDataset {
    /// Bin a matrix of data.
    ///
    /// * `data` - Column major data to bin.
    /// * `sample_weight` - Weight of each record, used to locate the quantiles.
    /// * `max_bin` - Maximum number of bins per feature, including the missing bin.
    /// * `missing` - Value to consider missing, in addition to NaN.
    /// * `categorical_features` - Indices of the features to treat as categorical.
    pub fn build<T: FloatData<T>>(
        data: &Matrix<T>,
        sample_weight: &[f64],
        max_bin: usize,
        missing: f64,
        categorical_features: &HashSet<usize>,
    ) -> Result<Self, HistBoostError> {
        if !(2..=(u16::MAX as usize)).contains(&max_bin) {
            return Err(HistBoostError::Configuration(format!(
                "max_bin must be between 2 and {}, found {}",
                u16::MAX,
                max_bin
            )));
        }
        if sample_weight.len() != data.rows {
            return Err(HistBoostError::MismatchedLength(
                "sample_weight".to_string(),
                data.rows,
                sample_weight.len(),
            ));
        }
        if let Some(f) = categorical_features.iter().find(|f| **f >= data.cols) {
            return Err(HistBoostError::InvalidFeatureIndex(*f, data.cols));
        }

        let columns: Vec<(BinMapper, Vec<u16>)> = (0..data.cols)
            .into_par_iter()
            .map(|col| {
                let raw: Vec<f64> = data.get_col(col).iter().map(|v| v.to_f64()).collect();
                let values: Vec<(f64, f64)> = raw
                    .iter()
                    .zip(sample_weight)
                    .filter(|(v, _)| !is_missing(**v, missing))
                    .map(|(v, w)| (*v, *w))
                    .collect();
                let mapper = if categorical_features.contains(&col) {
                    BinMapper::categorical(values, max_bin)
                } else {
                    BinMapper::numeric(values, max_bin)
                };
                let has_missing = raw.iter().any(|v| is_missing(*v, missing));
                if mapper.is_trivial(has_missing) {
                    log::info!(
                        "Feature {} has a single value bin, it will not be used for splitting.",
                        col
                    );
                }
                let bins = raw
                    .iter()
                    .map(|v| mapper.value_to_bin(*v, missing))
                    .collect();
                (mapper, bins)
            })
            .collect();

        let mut binned_data = Vec::with_capacity(data.rows * data.cols);
        let mut mappers = Vec::with_capacity(data.cols);
        for (mapper, bins) in columns {
            binned_data.extend(bins);
            mappers.push(mapper);
        }

        Ok(BinnedDataset {
            binned_data,
            mappers,
            rows: data.rows,
            cols: data.cols,
        })
    }

    /// Get the bins of a single feature.
    pub fn get_col(&self, col: usize) -> &[u16] {
        &self.binned_data[(col * self.rows)..((col + 1) * self.rows)]
    }

    /// Number of bins for each of the features.
    pub fn n_bins(&self) -> Vec<usize> {
        self.mappers.iter().map(|m| m.n_bins()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data(rows: usize, cols: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..(rows * cols))
            .map(|_| {
                // Lots of duplicated values, and some missing.
                let v: f64 = rng.gen_range(0.0..50.0);
                if rng.gen_range(0.0..1.0) < 0.05 {
                    f64::NAN
                } else {
                    v.floor()
                }
            })
            .collect()
    }

    #[test]
    fn test_bin_data_monotonic() {
        let data_vec = random_data(1000, 3, 0);
        let data = Matrix::new(&data_vec, 1000, 3);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 16, f64::NAN, &HashSet::new()).unwrap();
        for col in 0..data.cols {
            assert!(b.mappers[col].n_bins() <= 16);
            let mut pairs: Vec<(f64, u16)> = data
                .get_col(col)
                .iter()
                .zip(b.get_col(col))
                .filter(|(v, _)| !v.is_nan())
                .map(|(v, bin)| (*v, *bin))
                .collect();
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            for w in pairs.windows(2) {
                assert!(w[0].1 <= w[1].1);
                if w[0].0 == w[1].0 {
                    assert_eq!(w[0].1, w[1].1);
                }
            }
            // Missing values always land in the first bin.
            for (v, bin) in data.get_col(col).iter().zip(b.get_col(col)) {
                if v.is_nan() {
                    assert_eq!(*bin, 0);
                } else {
                    assert!(*bin > 0);
                    // Re-applying the mapper recovers the same bin.
                    assert_eq!(b.mappers[col].value_to_bin(*v, f64::NAN), *bin);
                }
            }
        }
    }

    #[test]
    fn test_bin_bounds() {
        let data_vec = random_data(500, 1, 4);
        let data = Matrix::new(&data_vec, 500, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 10, f64::NAN, &HashSet::new()).unwrap();
        let mapper = &b.mappers[0];
        for (v, bin) in data.get_col(0).iter().zip(b.get_col(0)) {
            if v.is_nan() {
                continue;
            }
            assert!(*v <= mapper.bin_upper_bound(*bin));
            if *bin > 1 {
                assert!(*v > mapper.bin_upper_bound(*bin - 1));
            }
        }
    }

    #[test]
    fn test_distinct_values_get_own_bin() {
        let data_vec = vec![1., 1., 2., 3., 3., 3., 10.];
        let data = Matrix::new(&data_vec, 7, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 255, f64::NAN, &HashSet::new()).unwrap();
        assert_eq!(b.get_col(0), &[1, 1, 2, 3, 3, 3, 4]);
        assert_eq!(
            b.mappers[0],
            BinMapper::Numeric {
                upper_bounds: vec![1.5, 2.5, 6.5, f64::INFINITY]
            }
        );
    }

    #[test]
    fn test_quantile_bins_balanced() {
        let data_vec: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let data = Matrix::new(&data_vec, 1000, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 11, f64::NAN, &HashSet::new()).unwrap();
        assert_eq!(b.mappers[0].n_bins(), 11);
        let mut counts = vec![0; 11];
        for bin in b.get_col(0) {
            counts[*bin as usize] += 1;
        }
        assert_eq!(counts[0], 0);
        for c in &counts[1..] {
            assert_eq!(*c, 100);
        }
    }

    #[test]
    fn test_zero_variance_feature() {
        let data_vec = vec![5.; 20];
        let data = Matrix::new(&data_vec, 20, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 255, f64::NAN, &HashSet::new()).unwrap();
        assert!(b.mappers[0].is_trivial(false));
        assert_eq!(b.mappers[0].n_bins(), 2);
        assert!(b.get_col(0).iter().all(|v| *v == 1));

        let data_vec = vec![5., f64::NAN, 5., f64::NAN];
        let data = Matrix::new(&data_vec, 4, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 255, f64::NAN, &HashSet::new()).unwrap();
        assert!(!b.mappers[0].is_trivial(true));
        assert_eq!(b.get_col(0), &[1, 0, 1, 0]);
    }

    #[test]
    fn test_infinite_values() {
        let data_vec = vec![f64::NEG_INFINITY, 1., 2., 3., 4., f64::INFINITY];
        let data = Matrix::new(&data_vec, 6, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 255, f64::NAN, &HashSet::new()).unwrap();
        assert_eq!(b.get_col(0), &[1, 2, 3, 4, 5, 6]);
        let mapper = &b.mappers[0];
        for bin in 1..(mapper.n_bins() as u16 - 1) {
            assert!(mapper.bin_upper_bound(bin).is_finite());
        }
        for (v, bin) in data.get_col(0).iter().zip(b.get_col(0)) {
            assert_eq!(mapper.value_to_bin(*v, f64::NAN), *bin);
        }

        // Squeezed into fewer bins, the ids stay monotonic.
        let b = BinnedDataset::build(&data, &w, 4, f64::NAN, &HashSet::new()).unwrap();
        let bins = b.get_col(0);
        assert!(bins.windows(2).all(|p| p[0] <= p[1]));
        assert!(bins.iter().all(|v| *v > 0));
    }

    #[test]
    fn test_custom_missing_value() {
        let data_vec = vec![-999., 1., 2., -999.];
        let data = Matrix::new(&data_vec, 4, 1);
        let w = vec![1.; data.rows];
        let b = BinnedDataset::build(&data, &w, 255, -999., &HashSet::new()).unwrap();
        assert_eq!(b.get_col(0), &[0, 1, 2, 0]);
    }

    #[test]
    fn test_categorical_bins() {
        let data_vec = vec![3., 3., 3., 7., 7., 1., f64::NAN, -1., 3.];
        let data = Matrix::new(&data_vec, 9, 1);
        let w = vec![1.; data.rows];
        let cats = HashSet::from([0]);
        let b = BinnedDataset::build(&data, &w, 255, f64::NAN, &cats).unwrap();
        let mapper = &b.mappers[0];
        assert!(mapper.is_categorical());
        // Most frequent category gets the first bin.
        assert_eq!(b.get_col(0), &[1, 1, 1, 2, 2, 3, 0, 0, 1]);
        assert_eq!(mapper.bin_category(1), Some(3));
        assert_eq!(mapper.bin_category(3), Some(1));
        // Unseen categories share the missing bin.
        assert_eq!(mapper.value_to_bin(42., f64::NAN), 0);
    }

    #[test]
    fn test_categorical_overflow() {
        let data_vec = vec![0., 0., 0., 1., 1., 2.];
        let data = Matrix::new(&data_vec, 6, 1);
        let w = vec![1.; data.rows];
        let cats = HashSet::from([0]);
        let b = BinnedDataset::build(&data, &w, 3, f64::NAN, &cats).unwrap();
        assert_eq!(b.get_col(0), &[1, 1, 1, 2, 2, 0]);
    }

    #[test]
    fn test_bin_errors() {
        let data_vec = vec![1., 2.];
        let data = Matrix::new(&data_vec, 2, 1);
        let w = vec![1.; data.rows];
        assert!(BinnedDataset::build(&data, &w, 1, f64::NAN, &HashSet::new()).is_err());
        assert!(BinnedDataset::build(&data, &[1.], 10, f64::NAN, &HashSet::new()).is_err());
        assert!(BinnedDataset::build(&data, &w, 10, f64::NAN, &HashSet::from([3])).is_err());
    }
}
