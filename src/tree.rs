use crate::binning::BinnedDataset;
use crate::data::Matrix;
use crate::errors::DeviceError;
use crate::histogram::{HistogramBuilder, HistogramMatrix};
use crate::node::{Node, SplittableNode};
use crate::objective::GradientBuffer;
use crate::splitter::HistogramSplitter;
use crate::utils::{gain, pivot_on_split, weight};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

/// A leaf waiting in the growth queue, ordered by the gain of
/// its best split. On equal gain, the older (lower numbered) leaf
/// is split first.
#[derive(Debug)]
struct SplitCandidate {
    gain: f64,
    num: usize,
}

impl PartialEq for SplitCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SplitCandidate {}

impl PartialOrd for SplitCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SplitCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gain
            .total_cmp(&other.gain)
            .then_with(|| other.num.cmp(&self.num))
    }
}

/// Limits on the shape of a single tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_leaves: usize,
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Tree { nodes: Vec::new() }
    }

    /// Grow the tree leaf-wise, always splitting the leaf with the highest
    /// gain, until the leaf budget is used up or no leaf can be split.
    ///
    /// * `index` - The records used to fit this tree. It is partitioned
    ///   in place as nodes are split, so every node owns a contiguous range.
    pub fn fit<B: HistogramBuilder + ?Sized>(
        &mut self,
        data: &BinnedDataset,
        gradients: &GradientBuffer,
        mut index: Vec<usize>,
        builder: &mut B,
        splitter: &HistogramSplitter,
        params: &TreeParams,
    ) -> Result<(), DeviceError> {
        self.nodes.clear();
        let (grad_sum, hess_sum) = index.iter().fold((0.0, 0.0), |(g, h), i| {
            (g + f64::from(gradients.grad[*i]), h + f64::from(gradients.hess[*i]))
        });
        let splittable = |count: usize, depth: usize| {
            depth < params.max_depth && count >= 2 * splitter.min_data_in_leaf && count >= 2
        };

        let root_histograms = if splittable(index.len(), 0) && params.max_leaves > 1 {
            builder.build(data, gradients, &index)?
        } else {
            HistogramMatrix::empty()
        };
        let mut root = SplittableNode::new(
            0,
            root_histograms,
            weight(splitter.l2, grad_sum, hess_sum),
            gain(splitter.l2, grad_sum, hess_sum),
            grad_sum,
            hess_sum,
            index.len(),
            0,
            0,
            index.len(),
        );
        self.nodes.push(root.as_leaf_node());

        let mut growable: BinaryHeap<SplitCandidate> = BinaryHeap::new();
        let mut pending: HashMap<usize, SplittableNode> = HashMap::new();
        if !root.histograms.is_empty() {
            root.best_split = splitter.best_split(&root, &data.mappers);
            if let Some(info) = &root.best_split {
                growable.push(SplitCandidate {
                    gain: info.split_gain,
                    num: 0,
                });
                pending.insert(0, root);
            }
        }

        let mut n_leaves = 1;
        while let Some(candidate) = growable.pop() {
            if n_leaves >= params.max_leaves {
                break;
            }
            let mut node = match pending.remove(&candidate.num) {
                Some(n) => n,
                None => continue,
            };
            let info = match node.best_split.take() {
                Some(info) => info,
                None => continue,
            };

            let feature = data.get_col(info.split_feature);
            let n_left = pivot_on_split(&mut index[node.start_idx..node.stop_idx], |row| {
                info.goes_left(feature[row])
            });
            let split_idx = node.start_idx + n_left;
            debug_assert_eq!(n_left, info.left_node.count);

            let depth = node.depth + 1;
            let left_splittable = splittable(info.left_node.count, depth);
            let right_splittable = splittable(info.right_node.count, depth);

            // Only the smaller child is built, the larger is derived from
            // the parent, by subtraction.
            let (left_histograms, right_histograms) = if left_splittable || right_splittable {
                let left_smaller = info.left_node.count <= info.right_node.count;
                let small_index = if left_smaller {
                    &index[node.start_idx..split_idx]
                } else {
                    &index[split_idx..node.stop_idx]
                };
                let small = builder.build(data, gradients, small_index)?;
                let large = HistogramMatrix::from_parent_child(&node.histograms, &small);
                if left_smaller {
                    (small, large)
                } else {
                    (large, small)
                }
            } else {
                (HistogramMatrix::empty(), HistogramMatrix::empty())
            };
            // The parent's histograms are no longer needed.
            node.histograms = HistogramMatrix::empty();

            let left_num = self.nodes.len();
            let right_num = left_num + 1;
            let (split_value, left_categories) =
                info.split_value(&data.mappers[info.split_feature]);
            self.nodes[node.num].update_children(
                left_num,
                right_num,
                &info,
                split_value,
                left_categories,
            );

            let children = [
                (
                    SplittableNode::from_node_info(
                        left_num,
                        left_histograms,
                        depth,
                        node.start_idx,
                        split_idx,
                        &info.left_node,
                    ),
                    left_splittable,
                ),
                (
                    SplittableNode::from_node_info(
                        right_num,
                        right_histograms,
                        depth,
                        split_idx,
                        node.stop_idx,
                        &info.right_node,
                    ),
                    right_splittable,
                ),
            ];
            n_leaves += 1;
            for (mut child, can_split) in children {
                self.nodes.push(child.as_leaf_node());
                if !can_split {
                    continue;
                }
                child.best_split = splitter.best_split(&child, &data.mappers);
                if let Some(child_info) = &child.best_split {
                    growable.push(SplitCandidate {
                        gain: child_info.split_gain,
                        num: child.num,
                    });
                    pending.insert(child.num, child);
                }
            }
        }
        log::trace!("Tree grown with {} leaves.", n_leaves);
        Ok(())
    }

    /// Scale every node value by the learning rate.
    pub fn shrink(&mut self, learning_rate: f64) {
        self.nodes
            .iter_mut()
            .for_each(|n| n.weight_value *= learning_rate);
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf).count()
    }

    /// The depth of the deepest leaf, the root is at depth 0.
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// The node number of the leaf a record falls into.
    pub fn predict_leaf(&self, data: &Matrix<f64>, row: usize, missing: f64) -> usize {
        let mut node_idx = 0;
        loop {
            let node = &self.nodes[node_idx];
            if node.is_leaf {
                return node_idx;
            }
            node_idx = node.get_child_idx(*data.get(row, node.split_feature), missing);
        }
    }

    pub fn predict_row(&self, data: &Matrix<f64>, row: usize, missing: f64) -> f64 {
        self.nodes[self.predict_leaf(data, row, missing)].weight_value
    }

    pub fn predict(&self, data: &Matrix<f64>, parallel: bool, missing: f64) -> Vec<f64> {
        if parallel {
            (0..data.rows)
                .into_par_iter()
                .map(|i| self.predict_row(data, i, missing))
                .collect()
        } else {
            (0..data.rows)
                .map(|i| self.predict_row(data, i, missing))
                .collect()
        }
    }

    pub fn predict_leaf_indices(
        &self,
        data: &Matrix<f64>,
        parallel: bool,
        missing: f64,
    ) -> Vec<usize> {
        if parallel {
            (0..data.rows)
                .into_par_iter()
                .map(|i| self.predict_leaf(data, i, missing))
                .collect()
        } else {
            (0..data.rows)
                .map(|i| self.predict_leaf(data, i, missing))
                .collect()
        }
    }
}

impl fmt::Display for Tree {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut print_buffer: Vec<usize> = vec![0];
        let mut r = String::new();
        while let Some(idx) = print_buffer.pop() {
            let n = &self.nodes[idx];
            r += format!("{}{}\n", "      ".repeat(n.depth).as_str(), n).as_str();
            if !n.is_leaf {
                print_buffer.push(n.right_child);
                print_buffer.push(n.left_child);
            }
        }
        write!(f, "{}", r)
    }
}
