// SPDX-License-Identifier: MIT
//
// Minimal incremental parser for Server-Sent-Events response bodies. All
// three vendor streaming endpoints speak `data:` lines; event names, ids and
// retry hints are ignored.

use futures::Stream;
use futures::StreamExt;

/// Sentinel used by OpenAI-style endpoints to mark the end of a stream.
const DONE_SENTINEL: &str = "[DONE]";

pub(crate) struct SseStream<S> {
    stream: S,
    line_buffer: String,
    finished: bool,
}

impl<S> SseStream<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            line_buffer: String::new(),
            finished: false,
        }
    }
}

impl<S, B, E> SseStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    /// Return the payload of the next `data:` line, or `None` once the body
    /// is exhausted or the `[DONE]` sentinel was seen. After the sentinel no
    /// further bytes are requested from the underlying stream.
    pub(crate) async fn next_event(&mut self) -> Option<Result<String, E>> {
        if self.finished {
            return None;
        }

        loop {
            while let Some(newline_pos) = self.line_buffer.find('\n') {
                let line = self.line_buffer[..newline_pos]
                    .trim_end_matches('\r')
                    .to_string();
                self.line_buffer = self.line_buffer[newline_pos + 1..].to_string();

                let data = match line.strip_prefix("data:") {
                    Some(d) => d.trim_start(),
                    None => continue,
                };

                if data == DONE_SENTINEL {
                    self.finished = true;
                    return None;
                }

                if data.is_empty() {
                    continue;
                }

                return Some(Ok(data.to_string()));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    let chunk_str = String::from_utf8_lossy(chunk.as_ref());
                    self.line_buffer.push_str(&chunk_str);
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<&'static [u8], std::io::Error>> + Unpin {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(c.as_bytes())))
    }

    #[tokio::test]
    async fn test_data_lines_across_chunk_boundaries() {
        let mut sse = SseStream::new(byte_stream(vec!["data: {\"a\":", "1}\n\ndata: {\"b\":2}\n"]));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "{\"b\":2}");
        assert!(sse.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_done_sentinel_terminates() {
        let mut sse = SseStream::new(byte_stream(vec![
            "data: one\n\ndata: [DONE]\n\ndata: after\n\n",
        ]));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "one");
        assert!(sse.next_event().await.is_none());
        // Terminal state is sticky: nothing after the sentinel is surfaced.
        assert!(sse.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_crlf_and_non_data_lines_ignored() {
        let mut sse = SseStream::new(byte_stream(vec![
            "event: message_start\r\ndata: payload\r\n\r\n: comment\n",
        ]));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "payload");
        assert!(sse.next_event().await.is_none());
    }
}
