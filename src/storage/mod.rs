mod parts;
mod s3;
mod store;

#[cfg(test)]
pub use parts::PartReader;
pub use s3::S3Store;
pub use store::{ObjectStore, ProgressFn, UploadOptions, UploadProgress, UploadSummary};
