pub mod geometry_ops;
pub mod vector_io;

pub use vector_io::{FeatureTable, VectorFeature};
