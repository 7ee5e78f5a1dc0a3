pub mod cellpose;
pub mod correspondence;
pub mod geometry;
pub mod mask;
pub mod overlay;
pub mod stage;
