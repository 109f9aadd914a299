mod http;
mod openai;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::BatchObject;
use crate::Result;

pub use openai::{OpenAiUpstream, DEFAULT_BASE_URL};

/// The slice of the upstream file and batch APIs the engine drives. The
/// caller credential is threaded through every call so that each batch is
/// created under the key of the requests it carries.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn upload_file(&self, credential: &str, payload: Vec<u8>) -> Result<String>;

    async fn create_batch(
        &self,
        credential: &str,
        input_file_id: &str,
        endpoint: &str,
    ) -> Result<String>;

    async fn batch_status(&self, credential: &str, batch_id: &str) -> Result<BatchObject>;

    async fn cancel_batch(&self, credential: &str, batch_id: &str) -> Result<()>;

    async fn file_content(&self, credential: &str, file_id: &str) -> Result<Bytes>;

    async fn delete_file(&self, credential: &str, file_id: &str) -> Result<()>;
}
