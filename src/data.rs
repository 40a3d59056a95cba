use std::fmt::{self, Debug, Display};
use std::str::FromStr;

/// Data trait used throughout the package
/// to control for floating point numbers.
pub trait FloatData<T>: Copy + Debug + Display + PartialOrd + Send + Sync {
    const NAN: T;
    fn is_nan(self) -> bool;
    fn to_f64(self) -> f64;
}

impl FloatData<f64> for f64 {
    const NAN: f64 = f64::NAN;
    fn is_nan(self) -> bool {
        self.is_nan()
    }
    fn to_f64(self) -> f64 {
        self
    }
}

impl FloatData<f32> for f32 {
    const NAN: f32 = f32::NAN;
    fn is_nan(self) -> bool {
        self.is_nan()
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

/// Contigious Column major matrix data container. This is
/// used throughout the crate, to house both the user provided data
/// as well as the binned data.
pub struct Matrix<'a, T> {
    pub data: &'a [T],
    pub rows: usize,
    pub cols: usize,
    stride1: usize,
    stride2: usize,
}

impl<'a, T> Matrix<'a, T> {
    pub fn new(data: &'a [T], rows: usize, cols: usize) -> Self {
        Matrix {
            data,
            rows,
            cols,
            stride1: rows,
            stride2: 1,
        }
    }

    /// Get a single reference to an item in the matrix.
    ///
    /// * `i` - The ith row of the data to get.
    /// * `j` - the jth column of the data to get.
    pub fn get(&self, i: usize, j: usize) -> &T {
        &self.data[self.item_index(i, j)]
    }

    fn item_index(&self, i: usize, j: usize) -> usize {
        let mut idx: usize;
        idx = self.stride2 * i;
        idx += j * self.stride1;
        idx
    }

    /// Get a slice of a column in the matrix.
    ///
    /// * `col` - The index of the column to select.
    /// * `start_row` - The index of the start of the slice.
    /// * `end_row` - The index of the end of the slice of the column to select.
    pub fn get_col_slice(&self, col: usize, start_row: usize, end_row: usize) -> &[T] {
        let i = self.item_index(start_row, col);
        let j = self.item_index(end_row, col);
        &self.data[i..j]
    }

    /// Get an entire column in the matrix.
    ///
    /// * `col` - The index of the column to get.
    pub fn get_col(&self, col: usize) -> &[T] {
        self.get_col_slice(col, 0, self.rows)
    }
}

impl<'a, T> Matrix<'a, T>
where
    T: Copy,
{
    /// Copy the values of a single row out of the matrix.
    pub fn get_row(&self, row: usize) -> Vec<T> {
        (0..self.cols).map(|j| *self.get(row, j)).collect()
    }
}

impl<'a, T> fmt::Display for Matrix<'a, T>
where
    T: FromStr + std::fmt::Display,
    <T as FromStr>::Err: 'static + std::error::Error,
{
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut val = String::new();
        for i in 0..self.rows {
            for j in 0..self.cols {
                val.push_str(self.get(i, j).to_string().as_str());
                if j == (self.cols - 1) {
                    val.push('\n');
                } else {
                    val.push(' ');
                }
            }
        }
        write!(f, "{}", val)
    }
}

/// A jagged column aligned matrix, that owns its data contents.
/// Every column may have a different number of records, the
/// `ends` vector holds the exclusive end position of each column.
#[derive(Debug, Clone)]
pub struct JaggedMatrix<T> {
    /// The contents of the matrix.
    pub data: Vec<T>,
    /// The end index's of the matrix.
    pub ends: Vec<usize>,
    /// Number of columns in the matrix
    pub cols: usize,
    /// The number of elements in the matrix.
    pub n_records: usize,
}

impl<T> JaggedMatrix<T> {
    /// Generate a jagged matrix from a vector of vectors.
    pub fn from_vecs(vecs: Vec<Vec<T>>) -> Self {
        let mut data = Vec::new();
        let mut ends = Vec::with_capacity(vecs.len());
        let cols = vecs.len();
        for v in vecs {
            data.extend(v);
            ends.push(data.len());
        }
        let n_records = data.len();
        JaggedMatrix {
            data,
            ends,
            cols,
            n_records,
        }
    }

    /// Get the column of a jagged array.
    pub fn get_col(&self, col: usize) -> &[T] {
        let (start, stop) = self.col_bounds(col);
        &self.data[start..stop]
    }

    fn col_bounds(&self, col: usize) -> (usize, usize) {
        assert!(col < self.cols);
        let start = if col == 0 { 0 } else { self.ends[col - 1] };
        (start, self.ends[col])
    }
}
