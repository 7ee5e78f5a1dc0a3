pub mod annotations;
pub mod manifest;
pub mod plate_manifest;
