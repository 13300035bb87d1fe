use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// A raw decoded read from one pipe. Not aligned to line boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

/// One non-blank output line tagged with the process that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub process: Arc<str>,
    pub stream: StreamKind,
    pub text: String,
}

/// Split a chunk into the entries stored in a log buffer.
///
/// No reassembly across chunks: a line cut by a chunk boundary becomes two
/// entries.
pub fn chunk_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
}

/// Forward everything readable from `reader` as lossy UTF-8 chunks.
///
/// Stops at EOF, on a read error, or once the receiving side is gone.
pub(crate) fn spawn_reader<R>(
    mut reader: R,
    stream: StreamKind,
    tx: mpsc::Sender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(OutputChunk { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(%stream, error = %e, "pipe read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_lines_skips_blank_and_strips_cr() {
        let lines: Vec<_> = chunk_lines("one\r\n\n  \ntwo").collect();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_chunk_lines_partial_line_kept_as_is() {
        let lines: Vec<_> = chunk_lines("database system is rea").collect();
        assert_eq!(lines, vec!["database system is rea"]);
    }

    #[tokio::test]
    async fn test_reader_forwards_until_eof() {
        let (tx, mut rx) = mpsc::channel(4);
        let data: &[u8] = b"hello\nworld\n";
        spawn_reader(data, StreamKind::Stderr, tx).await.unwrap();

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            assert_eq!(chunk.stream, StreamKind::Stderr);
            collected.push_str(&chunk.text);
        }
        assert_eq!(collected, "hello\nworld\n");
    }
}
