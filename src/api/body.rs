use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt as _;
use tokio_util::io::ReaderStream;

/// The response body type used by all handlers: empty, buffered, or streamed
/// from an `AsyncRead` (blob downloads, replication tees).
pub type Body = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn empty() -> Body {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn fixed(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn from_reader<R>(reader: R) -> Body
where
    R: AsyncRead + Send + 'static,
{
    let stream = ReaderStream::new(reader).map(|result| result.map(Frame::data));
    StreamBody::new(stream).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_fixed_body_round_trip() {
        let body = fixed("hello");
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_reader_body_streams_everything() {
        let body = from_reader(std::io::Cursor::new(b"streamed content".to_vec()));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("streamed content"));
    }
}
