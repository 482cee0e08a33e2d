pub mod database;
pub mod fingerprint;
pub mod space;

pub use database::{AssignPolicy, IdDatabase, ImageRecord, ListQuery, UploadRow, UploadState};
pub use fingerprint::{instance_fingerprint, source_fingerprint, Fingerprint, FormatParams};
pub use space::{CellColour, IdSpace, IdSubspace};
