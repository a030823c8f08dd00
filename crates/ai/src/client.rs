use std::sync::Arc;

use async_trait::async_trait;

use crate::request::GenerationRequest;
use crate::result::{Generation, GenerationError};

/// A text-generation backend.
///
/// Implementations must be safe to call from many worker tasks at once. A call
/// may be repeated when a job attempt is retried; callers only persist the
/// output of the attempt that commits.
#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;
}

#[async_trait]
impl<T: TextGenerator + ?Sized> TextGenerator for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        (**self).generate(request).await
    }
}
