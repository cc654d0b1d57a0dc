//! Streaming decrypt reader: XORs an encrypted prefix of an upstream byte
//! stream against the ISAAC-64 keystream, with support for starting at an
//! arbitrary byte offset (HTTP Range responses).

use crate::keystream::Isaac64;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Wraps an `AsyncRead` upstream, transparently XOR-ing the first `limit`
/// bytes of the *logical* (offset-relative) stream with the keystream
/// derived from `seed`. Bytes beyond `limit` pass through unchanged.
///
/// Not `Send`-shareable across concurrent readers — a single consumer owns
/// the keystream cursor.
pub struct DecryptReader<R> {
    upstream: R,
    gen: Isaac64,
    limit: u64,
    consumed: u64,
    ks: [u8; 8],
    ks_pos: usize,
}

impl<R> DecryptReader<R> {
    /// `offset` is the absolute position of the first byte `upstream` will
    /// yield; `limit` is the length of the encrypted prefix of the full
    /// object (not of this reader's view).
    pub fn new(upstream: R, seed: u64, offset: u64, limit: u64) -> Self {
        let mut gen = Isaac64::new(seed);
        let (consumed, ks, ks_pos) = if limit == 0 || offset >= limit {
            (limit.min(offset.max(limit)), [0u8; 8], 8)
        } else {
            gen.skip(offset / 8);
            let word = gen.next();
            let mut ks = [0u8; 8];
            ks.copy_from_slice(&word.to_be_bytes());
            (offset, ks, (offset % 8) as usize)
        };

        Self {
            upstream,
            gen,
            limit,
            consumed,
            ks,
            ks_pos,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let upstream = Pin::new(&mut this.upstream);
        match upstream.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 && this.consumed < this.limit {
                    let remaining = this.limit - this.consumed;
                    let to_decrypt = (n as u64).min(remaining) as usize;
                    let filled = buf.filled_mut();
                    let region = &mut filled[before..before + to_decrypt];
                    for byte in region.iter_mut() {
                        if this.ks_pos >= 8 {
                            let word = this.gen.next();
                            this.ks.copy_from_slice(&word.to_be_bytes());
                            this.ks_pos = 0;
                        }
                        *byte ^= this.ks[this.ks_pos];
                        this.ks_pos += 1;
                    }
                    this.consumed += to_decrypt as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Applies the same XOR transform in memory, for building test fixtures
    /// and for asserting the invariant described in §4.B/§8.2 directly.
    fn xor_encrypt(plaintext: &[u8], seed: u64, limit: u64) -> Vec<u8> {
        let mut gen = Isaac64::new(seed);
        let mut out = plaintext.to_vec();
        let mut ks = [0u8; 8];
        let mut pos = 8usize;
        for (i, byte) in out.iter_mut().enumerate() {
            if (i as u64) >= limit {
                break;
            }
            if pos >= 8 {
                ks.copy_from_slice(&gen.next().to_be_bytes());
                pos = 0;
            }
            *byte ^= ks[pos];
            pos += 1;
        }
        out
    }

    async fn decrypt_slice(seed: u64, ciphertext: &[u8], offset: u64, limit: u64) -> Vec<u8> {
        let cursor = std::io::Cursor::new(ciphertext.to_vec());
        let mut reader = DecryptReader::new(cursor, seed, offset, limit);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn range_invariant_holds_across_offsets() {
        let seed = 0xDEAD_BEEFu64;
        let limit = 131_072u64;
        let plaintext: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let ciphertext = xor_encrypt(&plaintext, seed, limit);

        for &(offset, len) in &[(0u64, 100usize), (100_000, 31_072), (131_000, 200), (150_000, 500)] {
            let slice = &ciphertext[offset as usize..offset as usize + len];
            let got = decrypt_slice(seed, slice, offset, limit).await;
            let want = &plaintext[offset as usize..offset as usize + len];
            assert_eq!(got, want, "mismatch at offset {offset}");
        }
    }

    #[tokio::test]
    async fn bytes_beyond_limit_pass_through_unchanged() {
        let seed = 1;
        let limit = 16u64;
        let ciphertext = vec![0xAAu8; 32];
        let got = decrypt_slice(seed, &ciphertext, 0, limit).await;
        assert_eq!(&got[16..], &ciphertext[16..]);
    }

    #[tokio::test]
    async fn offset_past_limit_is_a_no_op() {
        let seed = 9;
        let limit = 8u64;
        let ciphertext = vec![0x55u8; 10];
        let got = decrypt_slice(seed, &ciphertext, 20, limit).await;
        assert_eq!(got, ciphertext);
    }

    #[tokio::test]
    async fn two_constructions_agree_on_overlapping_byte() {
        let seed = 123;
        let limit = 64u64;
        let plaintext = vec![0u8; 64];
        let ciphertext = xor_encrypt(&plaintext, seed, limit);

        let whole = decrypt_slice(seed, &ciphertext, 0, limit).await;
        let tail = decrypt_slice(seed, &ciphertext[10..], 10, limit).await;
        assert_eq!(whole[10..], tail[..]);
    }
}
