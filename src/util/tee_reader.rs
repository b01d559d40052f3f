use bytes::Bytes;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    task,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// Converts an MPSC receiver of byte chunks into an `AsyncRead`.
pub struct ChannelReader {
    inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        let stream = ReceiverStream::new(rx);
        Self { inner: StreamReader::new(stream) }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Tees the given `AsyncRead` into two `AsyncRead` handles.
///
/// A background task reads from the source and sends copies of each chunk
/// into two bounded channels. The pump keeps running as long as at least one
/// consumer is alive: during blob replication, one side is the client
/// response and the other is the storage upload, and neither side's failure
/// may cut off the other. A source error is forwarded to both consumers.
pub fn tee_reader<R>(mut reader: R, buffer_size: usize, channel_capacity: usize) -> (ChannelReader, ChannelReader)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx1, rx1) = mpsc::channel::<io::Result<Bytes>>(channel_capacity);
    let (tx2, rx2) = mpsc::channel::<io::Result<Bytes>>(channel_capacity);

    task::spawn(async move {
        let mut txs = [Some(tx1), Some(tx2)];
        let mut buf = vec![0u8; buffer_size];
        loop {
            let item = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(err) => Err(err),
            };
            let is_err = item.is_err();

            for tx_slot in &mut txs {
                if let Some(tx) = tx_slot {
                    let chunk = match &item {
                        Ok(bytes) => Ok(bytes.clone()),
                        Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
                    };
                    if tx.send(chunk).await.is_err() {
                        // this consumer is gone; keep feeding the other one
                        *tx_slot = None;
                    }
                }
            }

            if is_err || txs.iter().all(Option::is_none) {
                break;
            }
        }
        // dropping the senders signals EOF to the receivers
    });

    (ChannelReader::new(rx1), ChannelReader::new(rx2))
}
