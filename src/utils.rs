use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

/// Small constant added to hessian sums, so a leaf with
/// no hessian never divides by zero.
pub const HESSIAN_EPSILON: f64 = 1e-15;

/// Is this value considered missing, given the user
/// provided missing value.
#[inline]
pub fn is_missing(value: f64, missing: f64) -> bool {
    value.is_nan() || value == missing
}

/// Find the position of the first bound that is greater than, or
/// equal to the provided value. The bounds must be sorted.
/// If the value is larger than every bound, the length of the
/// bounds is returned.
#[inline]
pub fn first_greater_than_or_equal(bounds: &[f64], value: f64) -> usize {
    bounds.partition_point(|b| *b < value)
}

/// The midpoint between two sorted distinct values, that
/// is guaranteed to be strictly less than the larger value,
/// and finite unless both values are infinite.
pub fn midpoint(low: f64, high: f64) -> f64 {
    if low == f64::NEG_INFINITY {
        return if f64::MIN < high { f64::MIN } else { low };
    }
    let m = low + (high - low) / 2.0;
    if m.is_nan() || m >= high {
        low
    } else {
        m
    }
}

/// Calculate the raw (unregularized by gamma) gain contribution of
/// a node, given its gradient and hessian sums.
#[inline]
pub fn gain(l2: f64, gradient_sum: f64, hessian_sum: f64) -> f64 {
    (gradient_sum * gradient_sum) / (hessian_sum + l2 + HESSIAN_EPSILON)
}

/// Calculate the output weight of a node, given its gradient and
/// hessian sums. A zero hessian is clamped by the epsilon.
#[inline]
pub fn weight(l2: f64, gradient_sum: f64, hessian_sum: f64) -> f64 {
    -(gradient_sum / (hessian_sum + l2 + HESSIAN_EPSILON))
}

/// Stable partition of a slice of the index, every record for which
/// `goes_left` is true is moved to the front, preserving relative order
/// on both sides. The returned value is the number of records
/// that went left.
pub fn pivot_on_split<F>(index: &mut [usize], goes_left: F) -> usize
where
    F: Fn(usize) -> bool,
{
    let mut right = Vec::new();
    let mut n_left = 0;
    for i in 0..index.len() {
        let row = index[i];
        if goes_left(row) {
            index[n_left] = row;
            n_left += 1;
        } else {
            right.push(row);
        }
    }
    index[n_left..].copy_from_slice(&right);
    n_left
}

/// Round a number to a given precision.
pub fn precision_round(n: f64, precision: i32) -> f64 {
    let p = (10.0_f64).powi(precision);
    (n * p).round() / p
}

/// Naive weighted mean of a vector.
pub fn weighted_mean(y: &[f64], sample_weight: &[f64]) -> f64 {
    let (total, w_sum) = y
        .iter()
        .zip(sample_weight)
        .fold((0.0, 0.0), |(t, ws), (y_, w_)| (t + y_ * w_, ws + w_));
    if w_sum == 0.0 {
        0.0
    } else {
        total / w_sum
    }
}

/// Write a float that may not be finite. serde_json can only write
/// finite numbers, so NaN and the infinities are written as strings.
pub fn serialize_float<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.serialize_str(&value.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonFloat {
    Number(f64),
    Text(String),
}

/// Read a float written by `serialize_float`. A null is read as NaN.
pub fn deserialize_float<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonFloat>::deserialize(deserializer)? {
        None => Ok(f64::NAN),
        Some(JsonFloat::Number(v)) => Ok(v),
        Some(JsonFloat::Text(s)) => s.parse::<f64>().map_err(D::Error::custom),
    }
}
