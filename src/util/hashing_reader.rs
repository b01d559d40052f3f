use sha2::digest::common::hazmat::{DeserializeStateError, SerializableState};
use sha2::{Digest as Sha256Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::oci::Digest;

/// A wrapper around an `AsyncRead` that computes a SHA-256 hash on the fly.
/// The hasher state can be serialized between requests, which is how chunked
/// uploads keep their running digest across API instances.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        HashingReader { inner, hasher: Sha256::new() }
    }

    /// Resumes from a previously serialized hash state (hex-encoded).
    pub fn with_hash_state(inner: R, hash_state: &str) -> Result<Self, DeserializeStateError> {
        if hash_state.is_empty() {
            return Ok(Self::new(inner));
        }
        let bytes = hex::decode(hash_state).map_err(|_| DeserializeStateError)?;
        let state = bytes.as_slice().try_into().map_err(|_| DeserializeStateError)?;
        let hasher = Sha256::deserialize(&state)?;
        Ok(HashingReader { inner, hasher })
    }

    /// The current hash state, reflecting all bytes read so far (hex-encoded).
    pub fn hash_state(&self) -> String {
        hex::encode(self.hasher.serialize())
    }

    /// Finalizes the hash into a digest.
    pub fn digest(self) -> Digest {
        Digest::Sha256(hex::encode(self.hasher.finalize()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let pre_len = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let post_len = buf.filled().len();
            if post_len > pre_len {
                let this = self.get_mut();
                this.hasher.update(&buf.filled()[pre_len..post_len]);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_digest_matches_direct_hash() {
        let data = b"hello world";
        let mut reader = HashingReader::new(&data[..]);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(reader.digest(), Digest::of_bytes(data));
    }

    #[tokio::test]
    async fn test_state_round_trip_across_chunks() {
        let mut first = HashingReader::new(&b"hello "[..]);
        let mut buf = Vec::new();
        first.read_to_end(&mut buf).await.unwrap();
        let state = first.hash_state();

        let mut second = HashingReader::with_hash_state(&b"world"[..], &state).unwrap();
        buf.clear();
        second.read_to_end(&mut buf).await.unwrap();

        assert_eq!(second.digest(), Digest::of_bytes(b"hello world"));
    }

    #[tokio::test]
    async fn test_empty_state_starts_fresh() {
        let reader = HashingReader::with_hash_state(&b""[..], "").unwrap();
        assert_eq!(reader.digest(), Digest::of_bytes(b""));
    }

    #[tokio::test]
    async fn test_garbage_state_rejected() {
        assert!(HashingReader::with_hash_state(&b""[..], "zz-not-hex").is_err());
    }
}
