use futures::prelude::*;

mod dyn_error;
mod read_buffer;

#[doc(inline)]
pub use dyn_error::DynError;
#[doc(inline)]
pub use read_buffer::ReadBuffer;

/// Convert [AsyncRead] into a [Stream] of chunks of at most 4096 bytes.
///
/// The stream ends when the reader is exhausted or after the first read error.
pub fn read_to_stream<R>(read: R) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>>
where
    R: AsyncRead + Unpin,
{
    const CHUNK_LEN: usize = 4096;
    futures::stream::unfold(Some(read), |read| async move {
        let mut read = read?;
        let mut chunk = vec![0u8; CHUNK_LEN];
        match read.read(&mut chunk).await {
            Ok(0) => None,
            Ok(len) => {
                chunk.truncate(len);
                Some((Ok(chunk), Some(read)))
            }
            Err(error) => Some((Err(error), None)),
        }
    })
}

/// Spawn `future` as a task named `name` that runs in the current tracing span.
pub(crate) fn spawn_named<F>(name: &str, future: F) -> async_std::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    use tracing_futures::Instrument as _;
    async_std::task::Builder::new()
        .name(name.to_string())
        .spawn(future.in_current_span())
        // Spawning only fails if the runtime cannot be started.
        .expect("failed to spawn task")
}
