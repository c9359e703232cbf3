pub mod filesystem;

pub use filesystem::{OutputStore, UploadStore};
