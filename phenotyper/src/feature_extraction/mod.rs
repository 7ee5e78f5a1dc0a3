pub mod cellprofiler;
pub mod deepprofiler;
