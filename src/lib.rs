pub mod binning;
pub mod callback;
pub mod data;
pub mod errors;
pub mod gpu;
pub mod gradientbooster;
pub mod histogram;
pub mod metric;
pub mod node;
pub mod objective;
pub mod sampler;
pub mod session;
pub mod splitter;
pub mod tree;
pub mod utils;

#[cfg(test)]
mod testing;

pub use data::Matrix;
pub use gradientbooster::GradientBooster;
