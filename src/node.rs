use crate::histogram::HistogramMatrix;
use crate::splitter::{NodeInfo, SplitInfo, SplitType};
use crate::utils::{deserialize_float, is_missing, serialize_float};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node that is still being grown. It owns the histograms of
/// its records, and the range of the shared index it covers.
#[derive(Debug)]
pub struct SplittableNode {
    pub num: usize,
    pub histograms: HistogramMatrix,
    pub weight_value: f64,
    pub gain_value: f64,
    pub gradient_sum: f64,
    pub hessian_sum: f64,
    pub count: usize,
    pub depth: usize,
    pub start_idx: usize,
    pub stop_idx: usize,
    pub best_split: Option<SplitInfo>,
}

impl SplittableNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num: usize,
        histograms: HistogramMatrix,
        weight_value: f64,
        gain_value: f64,
        gradient_sum: f64,
        hessian_sum: f64,
        count: usize,
        depth: usize,
        start_idx: usize,
        stop_idx: usize,
    ) -> Self {
        SplittableNode {
            num,
            histograms,
            weight_value,
            gain_value,
            gradient_sum,
            hessian_sum,
            count,
            depth,
            start_idx,
            stop_idx,
            best_split: None,
        }
    }

    /// Create a child node, from the node info generated when its
    /// parent was split.
    pub fn from_node_info(
        num: usize,
        histograms: HistogramMatrix,
        depth: usize,
        start_idx: usize,
        stop_idx: usize,
        node_info: &NodeInfo,
    ) -> Self {
        SplittableNode::new(
            num,
            histograms,
            node_info.weight,
            node_info.gain,
            node_info.grad,
            node_info.cover,
            node_info.count,
            depth,
            start_idx,
            stop_idx,
        )
    }

    /// Generate a leaf node, from this splittable node.
    pub fn as_leaf_node(&self) -> Node {
        Node {
            num: self.num,
            weight_value: self.weight_value,
            hessian_sum: self.hessian_sum,
            count: self.count,
            depth: self.depth,
            split_gain: 0.0,
            split_feature: 0,
            split_value: f64::NAN,
            split_bin: 0,
            left_categories: None,
            missing_left: false,
            left_child: 0,
            right_child: 0,
            is_leaf: true,
        }
    }
}

/// A node of a fitted tree.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Node {
    pub num: usize,
    /// The output of this node, for leaves this is the leaf value.
    pub weight_value: f64,
    pub hessian_sum: f64,
    /// The number of training records that reached this node.
    pub count: usize,
    pub depth: usize,
    pub split_gain: f64,
    pub split_feature: usize,
    /// Records with a value less than or equal to this go left.
    #[serde(serialize_with = "serialize_float", deserialize_with = "deserialize_float")]
    pub split_value: f64,
    pub split_bin: u16,
    /// For categorical splits, the categories that go left.
    pub left_categories: Option<Vec<i64>>,
    pub missing_left: bool,
    pub left_child: usize,
    pub right_child: usize,
    pub is_leaf: bool,
}

impl Node {
    /// Convert a leaf into a parent node, given the split information.
    pub fn update_children(
        &mut self,
        left_child: usize,
        right_child: usize,
        split_info: &SplitInfo,
        split_value: f64,
        left_categories: Option<Vec<i64>>,
    ) {
        self.left_child = left_child;
        self.right_child = right_child;
        self.split_feature = split_info.split_feature;
        self.split_gain = split_info.split_gain;
        self.split_value = split_value;
        self.split_bin = match &split_info.split_type {
            SplitType::Numeric { split_bin } => *split_bin,
            SplitType::Categorical { .. } => 0,
        };
        self.left_categories = left_categories;
        self.missing_left = split_info.missing_left;
        self.is_leaf = false;
    }

    /// Which child should a raw value be sent to.
    pub fn get_child_idx(&self, value: f64, missing: f64) -> usize {
        if self.goes_left(value, missing) {
            self.left_child
        } else {
            self.right_child
        }
    }

    fn goes_left(&self, value: f64, missing: f64) -> bool {
        match &self.left_categories {
            Some(categories) => {
                // Missing, negative and unseen categories always go right.
                if is_missing(value, missing) || value < 0.0 {
                    false
                } else {
                    categories.binary_search(&(value as i64)).is_ok()
                }
            }
            None => {
                if is_missing(value, missing) {
                    self.missing_left
                } else {
                    value <= self.split_value
                }
            }
        }
    }
}

impl fmt::Display for Node {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_leaf {
            write!(
                f,
                "{}:leaf={},cover={},count={}",
                self.num, self.weight_value, self.hessian_sum, self.count
            )
        } else {
            let missing = if self.missing_left { "yes" } else { "no" };
            match &self.left_categories {
                Some(categories) => write!(
                    f,
                    "{}:[{} in {:?}] yes={},no={},missing={},gain={},cover={}",
                    self.num,
                    self.split_feature,
                    categories,
                    self.left_child,
                    self.right_child,
                    missing,
                    self.split_gain,
                    self.hessian_sum
                ),
                None => write!(
                    f,
                    "{}:[{} <= {}] yes={},no={},missing={},gain={},cover={}",
                    self.num,
                    self.split_feature,
                    self.split_value,
                    self.left_child,
                    self.right_child,
                    missing,
                    self.split_gain,
                    self.hessian_sum
                ),
            }
        }
    }
}
