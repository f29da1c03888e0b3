//! Provides [MessageStream] for parsing [Message]s from a byte stream.

use futures::prelude::*;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::message::{Message, MessageParseError, MessageReader, MAX_PAYLOAD_LEN};

#[derive(Debug, thiserror::Error)]
/// Error receiving a [Message].
pub enum NextMessageError {
    #[error("Failed to read bytes")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Failed to parse message")]
    Parse(
        #[source]
        #[from]
        MessageParseError,
    ),
    #[error("Unexpected end of stream while parsing message")]
    UnexpectedEndOfStream,
}

#[pin_project::pin_project]
#[derive(Debug)]
/// [Stream] of [Message]s parsed from underlying [Stream] of bytes.
///
/// The stream ends when the underlying stream ends between two messages. A
/// source that ends in the middle of a message yields
/// [NextMessageError::UnexpectedEndOfStream]. Partial messages are never
/// returned.
pub struct MessageStream<Stream> {
    #[pin]
    stream: Stream,
    reader: MessageReader,
    buffer: bytes::Bytes,
}

impl<Stream> MessageStream<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self::with_max_payload_len(stream, MAX_PAYLOAD_LEN)
    }

    /// Create a stream that rejects messages with payloads larger than `max_payload_len`.
    pub fn with_max_payload_len(stream: Stream, max_payload_len: u32) -> Self {
        Self {
            stream,
            reader: MessageReader::new(max_payload_len),
            buffer: bytes::Bytes::new(),
        }
    }
}

impl<Stream_> Stream for MessageStream<Stream_>
where
    Stream_: TryStream<Ok = Vec<u8>>,
    Stream_::Error: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<Message, NextMessageError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        loop {
            let mut this = self.as_mut().project();

            if this.buffer.is_empty() {
                match futures::ready!(this.stream.try_poll_next(cx)) {
                    Some(Ok(data)) => *this.buffer = bytes::Bytes::from(data),
                    Some(Err(err)) => {
                        return Poll::Ready(Some(Err(NextMessageError::Source(Box::new(err)))))
                    }
                    None => {
                        if this.reader.is_empty() {
                            return Poll::Ready(None);
                        } else {
                            return Poll::Ready(Some(Err(
                                NextMessageError::UnexpectedEndOfStream,
                            )));
                        }
                    }
                };
            }

            if let Some(result) = this.reader.put(&mut this.buffer) {
                return Poll::Ready(Some(result.map_err(NextMessageError::from)));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::test::arb_message;
    use proptest::prelude::*;

    #[test_strategy::proptest]
    fn read_messages(
        #[strategy(proptest::collection::vec(arb_message(), 0..10))] messages: Vec<Message>,
        chunks: proptest::sample::Index,
    ) {
        async_std::task::block_on(async move {
            use std::convert::Infallible;
            let messages2 = messages.clone();
            let data = messages
                .iter()
                .map(Message::build)
                .collect::<Vec<Vec<u8>>>()
                .concat();
            prop_assume!(!data.is_empty());
            let chunks = chunks.index(data.len()) + 1;
            let chunk_size = std::cmp::max(data.len() / chunks, 1);
            let source = futures::stream::iter(data.chunks(chunk_size))
                .map(|chunk| -> Result<Vec<u8>, Infallible> { Ok(chunk.to_vec()) });
            let received = MessageStream::new(source)
                .map(|result| result.unwrap())
                .collect::<Vec<_>>()
                .await;
            prop_assert_eq!(received, messages2);
            Ok(())
        })?;
    }

    #[async_std::test]
    async fn unexpected_end_of_stream() {
        let data = Message::one_way(1, b"hello".to_vec()).build();
        let source = futures::stream::once(async move { data[..7].to_vec() })
            .map(Result::<_, std::convert::Infallible>::Ok);
        let result = MessageStream::new(source)
            .try_for_each(|_| async { Ok(()) })
            .await;
        match result.unwrap_err() {
            NextMessageError::UnexpectedEndOfStream => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[async_std::test]
    async fn invalid_type_ends_stream() {
        let source =
            futures::stream::iter(vec![Ok::<_, std::convert::Infallible>(vec![0u8, 0u8, 9u8])]);
        let mut stream = MessageStream::new(source);
        assert_eq!(stream.next().await.unwrap().unwrap(), Message::keep());
        assert_eq!(stream.next().await.unwrap().unwrap(), Message::keep());
        match stream.next().await.unwrap().unwrap_err() {
            NextMessageError::Parse(MessageParseError::InvalidType { value: 9 }) => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[async_std::test]
    async fn oversized_header_is_rejected_by_default() {
        let header = vec![3u8, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 1];
        let source = futures::stream::iter(vec![Ok::<_, std::convert::Infallible>(header)]);
        match MessageStream::new(source).next().await.unwrap().unwrap_err() {
            NextMessageError::Parse(MessageParseError::PayloadTooLarge { len, max }) => {
                assert_eq!(len, u32::MAX);
                assert_eq!(max, MAX_PAYLOAD_LEN);
            }
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[async_std::test]
    async fn source_error() {
        let source = futures::stream::iter(vec![Err::<Vec<u8>, _>(std::io::Error::from(
            std::io::ErrorKind::TimedOut,
        ))]);
        let result = MessageStream::new(source).next().await.unwrap();
        assert!(matches!(result, Err(NextMessageError::Source(_))));
    }
}
