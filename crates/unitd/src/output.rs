use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::debug;
use unitd_unix::UnixProcessHandle;

/// Longest line relayed as-is; the rest of a longer line is dropped
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Forwards a child's stdout and stderr to the log, one event per line
pub struct OutputRelay {
    tasks: Vec<JoinHandle<()>>,
}

impl OutputRelay {
    pub fn attach(handle: &mut UnixProcessHandle, tag: &str) -> Self {
        let (stdout, stderr) = handle.take_output();
        let mut tasks = Vec::new();
        if let Some(stdout) = stdout {
            tasks.push(tokio::spawn(relay(stdout, tag.to_string(), "stdout")));
        }
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(relay(stderr, tag.to_string(), "stderr")));
        }
        Self { tasks }
    }

    /// Wait until both streams reach end of file
    pub async fn finish(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for OutputRelay {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OutputLine {
    Text(String),
    Overlong,
}

/// Newline-delimited decoder that accepts any bytes.
///
/// Invalid UTF-8 is replaced rather than rejected, and an over-long line is
/// reported once and skipped, so the pipe keeps draining until end of file.
struct LossyLines {
    inner: AnyDelimiterCodec,
}

impl LossyLines {
    fn new(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_length),
        }
    }

    fn convert(
        chunk: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<OutputLine>, std::io::Error> {
        match chunk {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                Ok(Some(OutputLine::Text(line.trim_end_matches('\r').to_string())))
            }
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(OutputLine::Overlong)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LossyLines {
    type Item = OutputLine;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<OutputLine>, std::io::Error> {
        Self::convert(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<OutputLine>, std::io::Error> {
        Self::convert(self.inner.decode_eof(buf))
    }
}

async fn relay<R>(reader: R, tag: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(reader, LossyLines::new(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(OutputLine::Text(line)) => debug!(target: "unitd::output", stream, "{}: {}", tag, line),
            Ok(OutputLine::Overlong) => debug!(
                target: "unitd::output",
                stream,
                "{}: line longer than {} bytes skipped",
                tag,
                MAX_LINE_LENGTH
            ),
            Err(e) => {
                debug!("{}: {} closed: {}", tag, stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut LossyLines, input: &[u8]) -> Vec<OutputLine> {
        let mut buf = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = decoder.decode(&mut buf).unwrap() {
            lines.push(line);
        }
        while let Some(line) = decoder.decode_eof(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut decoder = LossyLines::new(MAX_LINE_LENGTH);
        let lines = decode_all(&mut decoder, b"caf\xe9\r\nnext\n");
        assert_eq!(
            lines,
            vec![
                OutputLine::Text("caf\u{fffd}".to_string()),
                OutputLine::Text("next".to_string()),
            ]
        );
    }

    #[test]
    fn test_overlong_line_is_skipped() {
        let mut decoder = LossyLines::new(8);
        let lines = decode_all(&mut decoder, b"0123456789abcdef\nshort\ntail");
        assert_eq!(
            lines,
            vec![
                OutputLine::Overlong,
                OutputLine::Text("short".to_string()),
                OutputLine::Text("tail".to_string()),
            ]
        );
    }
}
