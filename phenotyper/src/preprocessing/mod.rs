pub mod merge;
pub mod normalize;
