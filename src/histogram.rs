use crate::binning::BinnedDataset;
use crate::data::JaggedMatrix;
use crate::errors::DeviceError;
use crate::objective::GradientBuffer;
use rayon::prelude::*;

/// Number of records accumulated into a single partial histogram, before
/// the partial histograms are merged. Fixed, so the order of the floating point
/// reduction never depends on the number of threads available.
pub const ROW_CHUNK_SIZE: usize = 8192;

/// Struct to hold the information of a given bin.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bin {
    /// The sum of the gradient for this bin.
    pub gradient_sum: f64,
    /// The sum of the hessian values for this bin.
    pub hessian_sum: f64,
    /// The number of records that fell in this bin.
    pub count: u32,
}

impl Bin {
    /// Calculate a new bin, using the subtraction trick on the parent bin,
    /// and the child bin.
    pub fn from_parent_child(root_bin: &Bin, child_bin: &Bin) -> Self {
        Bin {
            gradient_sum: root_bin.gradient_sum - child_bin.gradient_sum,
            hessian_sum: root_bin.hessian_sum - child_bin.hessian_sum,
            count: root_bin.count - child_bin.count,
        }
    }

    #[inline]
    pub fn merge(&mut self, other: &Bin) {
        self.gradient_sum += other.gradient_sum;
        self.hessian_sum += other.hessian_sum;
        self.count += other.count;
    }
}

/// Histograms of every feature for a single node, implemented as a jagged matrix,
/// each column holds a feature's bins, the first of which is the missing bin.
#[derive(Debug, Clone)]
pub struct HistogramMatrix(pub JaggedMatrix<Bin>);

/// Gather the gradients and hessians into the order of the index, so that
/// histogram construction reads them sequentially.
pub fn ordered_gradients(gradients: &GradientBuffer, index: &[usize]) -> (Vec<f32>, Vec<f32>) {
    let mut n_grad = Vec::with_capacity(index.len());
    let mut n_hess = Vec::with_capacity(index.len());
    for i in index {
        n_grad.push(gradients.grad[*i]);
        n_hess.push(gradients.hess[*i]);
    }
    (n_grad, n_hess)
}

/// Accumulate the records of a single chunk into a histogram.
fn accumulate(
    histogram: &mut [Bin],
    feature: &[u16],
    sorted_grad: &[f32],
    sorted_hess: &[f32],
    index: &[usize],
) {
    index
        .iter()
        .zip(sorted_grad)
        .zip(sorted_hess)
        .for_each(|((i, g), h)| {
            let b = &mut histogram[feature[*i] as usize];
            b.gradient_sum += f64::from(*g);
            b.hessian_sum += f64::from(*h);
            b.count += 1;
        });
}

/// Create a histogram for a given feature, we use f64
/// values to accumulate, so that we don't lose precision
/// when the histograms are later subtracted from one another.
/// Large nodes are accumulated in fixed size chunks in parallel, the chunk
/// histograms are then merged in chunk order.
pub fn create_feature_histogram(
    feature: &[u16],
    n_bins: usize,
    sorted_grad: &[f32],
    sorted_hess: &[f32],
    index: &[usize],
    parallel: bool,
) -> Vec<Bin> {
    let mut histogram = vec![Bin::default(); n_bins];
    if index.len() <= ROW_CHUNK_SIZE {
        accumulate(&mut histogram, feature, sorted_grad, sorted_hess, index);
        return histogram;
    }
    let chunk = |((idx, g), h): ((&[usize], &[f32]), &[f32])| {
        let mut partial = vec![Bin::default(); n_bins];
        accumulate(&mut partial, feature, g, h, idx);
        partial
    };
    let partials: Vec<Vec<Bin>> = if parallel {
        index
            .par_chunks(ROW_CHUNK_SIZE)
            .zip(sorted_grad.par_chunks(ROW_CHUNK_SIZE))
            .zip(sorted_hess.par_chunks(ROW_CHUNK_SIZE))
            .map(chunk)
            .collect()
    } else {
        index
            .chunks(ROW_CHUNK_SIZE)
            .zip(sorted_grad.chunks(ROW_CHUNK_SIZE))
            .zip(sorted_hess.chunks(ROW_CHUNK_SIZE))
            .map(chunk)
            .collect()
    };
    for partial in partials {
        histogram
            .iter_mut()
            .zip(partial.iter())
            .for_each(|(b, p)| b.merge(p));
    }
    histogram
}

impl HistogramMatrix {
    /// Create an empty histogram matrix.
    pub fn empty() -> Self {
        HistogramMatrix(JaggedMatrix {
            data: Vec::new(),
            ends: Vec::new(),
            cols: 0,
            n_records: 0,
        })
    }

    /// Build the histograms of every feature, for the records in the index.
    pub fn new(
        data: &BinnedDataset,
        gradients: &GradientBuffer,
        index: &[usize],
        parallel: bool,
    ) -> Self {
        // Sort gradients and hessians to reduce cache misses.
        let (sorted_grad, sorted_hess) = ordered_gradients(gradients, index);
        let build = |col: usize| {
            create_feature_histogram(
                data.get_col(col),
                data.mappers[col].n_bins(),
                &sorted_grad,
                &sorted_hess,
                index,
                parallel,
            )
        };
        let histograms: Vec<Vec<Bin>> = if parallel {
            (0..data.cols).into_par_iter().map(build).collect()
        } else {
            (0..data.cols).map(build).collect()
        };
        HistogramMatrix(JaggedMatrix::from_vecs(histograms))
    }

    /// The histogram of a single feature.
    pub fn feature(&self, col: usize) -> &[Bin] {
        self.0.get_col(col)
    }

    pub fn n_features(&self) -> usize {
        self.0.cols
    }

    pub fn is_empty(&self) -> bool {
        self.0.cols == 0
    }

    /// Calculate the histogram matrix, for a child, given the parent histogram
    /// matrix, and the other child histogram matrix.
    pub fn from_parent_child(
        root_histogram: &HistogramMatrix,
        child_histogram: &HistogramMatrix,
    ) -> Self {
        let HistogramMatrix(root) = root_histogram;
        let HistogramMatrix(child) = child_histogram;
        let histograms = root
            .data
            .iter()
            .zip(child.data.iter())
            .map(|(root_bin, child_bin)| Bin::from_parent_child(root_bin, child_bin))
            .collect();
        HistogramMatrix(JaggedMatrix {
            data: histograms,
            ends: child.ends.to_owned(),
            cols: child.cols,
            n_records: child.n_records,
        })
    }

    /// Add another histogram matrix of the same shape, to this one.
    pub fn merge(&mut self, other: &HistogramMatrix) {
        self.0
            .data
            .iter_mut()
            .zip(other.0.data.iter())
            .for_each(|(b, o)| b.merge(o));
    }
}

/// A strategy for building the histograms of a node.
pub trait HistogramBuilder {
    /// Called once before training, with the dataset that will be used
    /// for every later call to `build`.
    fn begin_session(&mut self, _data: &BinnedDataset) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Called once per boosting iteration, after the gradients are calculated.
    fn begin_iteration(&mut self, _gradients: &GradientBuffer) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Build the histograms of every feature, for the records in the index.
    fn build(
        &mut self,
        data: &BinnedDataset,
        gradients: &GradientBuffer,
        index: &[usize],
    ) -> Result<HistogramMatrix, DeviceError>;
}

/// Build histograms on the host, with rayon.
#[derive(Debug, Clone)]
pub struct CpuHistogramBuilder {
    pub parallel: bool,
}

impl CpuHistogramBuilder {
    pub fn new(parallel: bool) -> Self {
        CpuHistogramBuilder { parallel }
    }
}

impl HistogramBuilder for CpuHistogramBuilder {
    fn build(
        &mut self,
        data: &BinnedDataset,
        gradients: &GradientBuffer,
        index: &[usize],
    ) -> Result<HistogramMatrix, DeviceError> {
        Ok(HistogramMatrix::new(data, gradients, index, self.parallel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::random_problem;

    fn assert_close(a: &HistogramMatrix, b: &HistogramMatrix, tol: f64) {
        assert_eq!(a.0.data.len(), b.0.data.len());
        for (x, y) in a.0.data.iter().zip(b.0.data.iter()) {
            assert_eq!(x.count, y.count);
            assert!((x.gradient_sum - y.gradient_sum).abs() <= tol * (1.0 + y.gradient_sum.abs()));
            assert!((x.hessian_sum - y.hessian_sum).abs() <= tol * (1.0 + y.hessian_sum.abs()));
        }
    }

    #[test]
    fn test_single_histogram() {
        let (b, g) = random_problem(500, 3, 0);
        let index: Vec<usize> = (0..b.rows).collect();
        let (sg, sh) = ordered_gradients(&g, &index);
        let hist = create_feature_histogram(
            b.get_col(1),
            b.mappers[1].n_bins(),
            &sg,
            &sh,
            &index,
            false,
        );
        assert_eq!(hist.len(), b.mappers[1].n_bins());
        let count: u32 = hist.iter().map(|b| b.count).sum();
        assert_eq!(count as usize, b.rows);
        let grad_sum: f64 = hist.iter().map(|b| b.gradient_sum).sum();
        let expected: f64 = g.grad.iter().map(|v| f64::from(*v)).sum();
        assert!((grad_sum - expected).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_subtraction() {
        let (b, g) = random_problem(3000, 4, 1);
        let index: Vec<usize> = (0..b.rows).collect();
        let parent = HistogramMatrix::new(&b, &g, &index, true);
        let left_index: Vec<usize> = index.iter().copied().filter(|i| i % 3 == 0).collect();
        let right_index: Vec<usize> = index.iter().copied().filter(|i| i % 3 != 0).collect();
        let left = HistogramMatrix::new(&b, &g, &left_index, true);
        let right = HistogramMatrix::new(&b, &g, &right_index, true);

        let derived_right = HistogramMatrix::from_parent_child(&parent, &left);
        assert_close(&derived_right, &right, 1e-6);

        let mut sum = left.clone();
        sum.merge(&right);
        assert_close(&sum, &parent, 1e-6);
    }

    #[test]
    fn test_chunked_matches_sequential() {
        let (b, g) = random_problem(ROW_CHUNK_SIZE * 2 + 17, 2, 2);
        let index: Vec<usize> = (0..b.rows).collect();
        let parallel = HistogramMatrix::new(&b, &g, &index, true);
        let sequential = HistogramMatrix::new(&b, &g, &index, false);
        // The same fixed reduction order is used, so the results are identical.
        assert_eq!(parallel.0.data, sequential.0.data);
    }

    #[test]
    fn test_cpu_builder() {
        let (b, g) = random_problem(200, 2, 3);
        let index: Vec<usize> = (50..150).collect();
        let mut builder = CpuHistogramBuilder::new(true);
        let h = builder.build(&b, &g, &index).unwrap();
        assert_eq!(h.n_features(), 2);
        let total: u32 = h.feature(0).iter().map(|b| b.count).sum();
        assert_eq!(total, 100);
    }
}
