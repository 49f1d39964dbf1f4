use crate::domain::model::{FetchBatch, FetchRequest, ProcessedDataset, Record};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Data fetching side of the ingestion run. Implementations own network
/// concerns (rate limits, retries, decoding) and report one batch per request.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch>;
}

/// Data processing side. Never touches the network.
pub trait Processor: Send + Sync {
    fn process(&self, records: Vec<Record>) -> Result<ProcessedDataset>;
}
