pub mod compression;
pub mod job;
pub mod key;
pub mod pipe;
pub mod run;
pub mod scheduler;

pub use run::run;
