pub mod presign;

pub use presign::{PresignFileError, PresignFileQuery};
