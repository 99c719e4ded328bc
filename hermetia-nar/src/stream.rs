// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Chunked streaming of a NAR encoding.
//!
//! The encoder walks the filesystem on a blocking thread and sends
//! [`Bytes`] chunks through a bounded channel, so the consumer (hasher,
//! reference scanner, cache upload) gets back-pressure instead of an
//! unbounded buffer.

use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{NarError, writer};

/// Default chunk size for yielded Bytes (64 KiB).
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered in the channel.
const CHANNEL_CAPACITY: usize = 4;

/// A stream of [`Bytes`] chunks containing NAR-encoded data.
pub struct NarByteStream {
    rx: mpsc::Receiver<Result<Bytes, NarError>>,
}

impl NarByteStream {
    pub fn new(path: PathBuf) -> Self {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: PathBuf, chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut sink = ChannelWriter {
                tx: &tx,
                buffer: Vec::with_capacity(chunk_size),
                chunk_size,
            };
            match writer::dump_path(&path, &mut sink) {
                Ok(()) => {
                    if !sink.buffer.is_empty() {
                        let chunk = Bytes::from(std::mem::take(&mut sink.buffer));
                        let _ = tx.blocking_send(Ok(chunk));
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        Self { rx }
    }

    /// Receive the next chunk; `None` when the archive is complete.
    pub async fn next(&mut self) -> Option<Result<Bytes, NarError>> {
        self.rx.recv().await
    }
}

struct ChannelWriter<'a> {
    tx: &'a mpsc::Sender<Result<Bytes, NarError>>,
    buffer: Vec<u8>,
    chunk_size: usize,
}

impl Write for ChannelWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= self.chunk_size {
            let rest = self.buffer.split_off(self.chunk_size);
            let chunk = Bytes::from(std::mem::replace(&mut self.buffer, rest));
            self.tx
                .blocking_send(Ok(chunk))
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream closed"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
