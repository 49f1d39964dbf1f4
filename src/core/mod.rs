pub mod engine;
pub mod frame;
pub mod output;
pub mod processor;
pub mod rate_limit;
pub mod retry;
pub mod stats;

pub use crate::domain::model::{FetchOutcome, FetchRequest, ProcessedDataset, Record, RunReport};
pub use crate::domain::ports::{Fetcher, Processor, Storage};
pub use crate::utils::error::Result;
