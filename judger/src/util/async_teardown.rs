use async_trait::async_trait;

/// Data structure that needs to be teared down asynchronously.
///
/// This trait is used in the place of `AsyncDrop`, which is unfortunately
/// not available for now. Types implementing it release their resources in
/// `teardown()`; their `Drop` only hands whatever is left to a background
/// sweep, since nothing asynchronous can run there.
#[async_trait]
pub trait AsyncTeardown: Sync + Send {
    async fn teardown(&mut self);
}
