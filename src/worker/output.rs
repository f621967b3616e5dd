//! Serialized line output.
//!
//! Responses and informational diagnostics share the worker's stdout. Every
//! line goes through one writer task so concurrent producers never interleave
//! bytes within a line.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum SinkItem {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle feeding the output writer task.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<SinkItem>,
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl OutputSink {
    /// Start the writer task over `writer`.
    ///
    /// The task ends when every sink handle is dropped or a write fails.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut writer = BufWriter::new(writer);
            while let Some(item) = rx.recv().await {
                match item {
                    SinkItem::Line(line) => {
                        writer.write_all(line.as_bytes()).await?;
                        writer.flush().await?;
                    }
                    SinkItem::Flush(ack) => {
                        writer.flush().await?;
                        let _ = ack.send(());
                    }
                }
            }
            writer.flush().await
        });
        (Self { tx }, task)
    }

    /// Queue one line. A missing trailing newline is added.
    ///
    /// Returns `false` once the writer task has stopped.
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.tx.send(SinkItem::Line(line)).is_ok()
    }

    /// Wait until every line queued so far has been written.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(SinkItem::Flush(ack)).is_err() {
            return false;
        }
        done.await.is_ok()
    }
}
