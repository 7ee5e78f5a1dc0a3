pub mod ks;
pub mod well_significance;
