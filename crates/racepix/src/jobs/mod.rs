//! Durable upload jobs: record, status graph, store and change feed.

pub mod error;
pub mod feed;
pub mod model;
pub mod store;

pub use error::JobError;
pub use feed::{JobChangeFeed, JobWatch, Subscription};
pub use model::{ItemError, JobStatus, UploadJob};
pub use store::{JobStore, NewJob, TransitionOutcome};
