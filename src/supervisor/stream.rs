//! Stream pumping for run output.
//!
//! One producer task per child stream reads raw chunks and decodes them;
//! a single consumer appends to the sink in arrival order. Stream-local
//! order is preserved because each producer sends sequentially into the
//! same FIFO channel.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::output::{OutputSink, OutputSource};

const READ_CHUNK: usize = 8 * 1024;
pub(crate) const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamChunk {
    pub source: OutputSource,
    pub text: String,
}

/// Incremental UTF-8 decoder. Code points split across reads are held
/// back until complete; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let tail = rest.to_vec();
        self.pending = tail;
        out
    }

    /// Flush whatever is left at EOF.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Read `reader` until EOF, forwarding decoded chunks to `tx`.
pub(crate) fn spawn_reader<R>(
    reader: R,
    source: OutputSource,
    tx: mpsc::Sender<StreamChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Read error on {:?}: {}", source, e);
                    break;
                }
            };
            let text = decoder.decode(&buf[..n]);
            if text.is_empty() {
                continue;
            }
            if tx.send(StreamChunk { source, text }).await.is_err() {
                // consumer gone
                return;
            }
        }
        let text = decoder.finish();
        if !text.is_empty() {
            let _ = tx.send(StreamChunk { source, text }).await;
        }
    })
}

/// Drain `rx` into `sink` until every producer has finished.
/// Returns whether the sink is positioned at the start of a line.
pub(crate) fn spawn_forwarder(
    mut rx: mpsc::Receiver<StreamChunk>,
    sink: Arc<dyn OutputSink>,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let mut at_line_start = true;
        while let Some(chunk) = rx.recv().await {
            tracing::trace!("{:?}: {} bytes", chunk.source, chunk.text.len());
            sink.append(&chunk.text);
            at_line_start = chunk.text.ends_with('\n');
        }
        at_line_start
    })
}
