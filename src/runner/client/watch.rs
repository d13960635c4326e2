//! Decoding of watch responses. The api server writes one json `WatchEvent` per line, and a line
//! may be split across any number of body chunks.
use super::{ApiError, Error};

use bytes::BytesMut;
use hyper::Body;
use lazy_static::lazy_static;
use regex::bytes::Regex;
use serde_json::Value;
use tokio_stream::StreamExt;

lazy_static! {
    static ref NEWLINE_REGEX: Regex = Regex::new("[\\r\\n]+").expect("invalid newline regex");
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Error(ApiError),
}

pub struct WatchStream {
    body: Body,
    buffer: BytesMut,
    finished: bool,
}

impl WatchStream {
    pub(super) fn new(body: Body) -> WatchStream {
        WatchStream {
            body,
            buffer: BytesMut::new(),
            finished: false,
        }
    }

    /// Returns `None` once the server has closed the watch
    pub async fn next(&mut self) -> Option<Result<WatchEvent, Error>> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(serde_json::from_slice(&line).map_err(Error::from));
            }
            if self.finished {
                return None;
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    log::error!("Error reading watch response: {}", err);
                    self.finished = true;
                    return Some(Err(err.into()));
                }
                None => self.finished = true,
            }
        }
    }

    /// Splits the next non-empty line off the buffer. An unterminated line is only returned after
    /// the body has ended.
    fn take_line(&mut self) -> Option<BytesMut> {
        loop {
            let found = NEWLINE_REGEX
                .find(&self.buffer[..])
                .map(|newline| (newline.start(), newline.end()));
            let line = match found {
                Some((start, end)) => {
                    let mut line = self.buffer.split_to(end);
                    line.truncate(start);
                    line
                }
                None if self.finished && !self.buffer.is_empty() => self.buffer.split(),
                None => return None,
            };
            if !line.is_empty() {
                return Some(line);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn stream_of(chunks: Vec<&'static [u8]>) -> WatchStream {
        let chunks = chunks
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk)));
        WatchStream::new(Body::wrap_stream(tokio_stream::iter(chunks)))
    }

    fn collect(mut stream: WatchStream) -> Vec<WatchEvent> {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed to build runtime")
            .block_on(async move {
                let mut events = Vec::new();
                while let Some(event) = stream.next().await {
                    events.push(event.expect("watch event error"));
                }
                events
            })
    }

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let stream = stream_of(vec![
            &b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"a\"}}}\n{\"type\":\"MODI"[..],
            &b"FIED\",\"object\":{\"metadata\":"[..],
            &b"{\"name\":\"b\"}}}\r\n\r\n"[..],
            &b"{\"type\":\"DELETED\",\"object\":{}}"[..],
        ]);
        let expected = vec![
            WatchEvent::Added(json!({"metadata": {"name": "a"}})),
            WatchEvent::Modified(json!({"metadata": {"name": "b"}})),
            WatchEvent::Deleted(json!({})),
        ];
        assert_eq!(expected, collect(stream));
    }

    #[test]
    fn error_events_carry_the_status() {
        let stream = stream_of(vec![
            &b"{\"type\":\"ERROR\",\"object\":{\"kind\":\"Status\",\"status\":\"Failure\",\"reason\":\"Expired\",\"code\":410}}\n"[..],
        ]);
        match collect(stream).as_slice() {
            [WatchEvent::Error(err)] => {
                assert_eq!(410, err.code);
                assert_eq!("Expired", err.reason);
            }
            other => panic!("expected an error event, got: {:?}", other),
        }
    }

    #[test]
    fn malformed_line_is_an_error() {
        let mut stream = stream_of(vec![&b"not json\n"[..]]);
        let result = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed to build runtime")
            .block_on(async move { stream.next().await });
        match result {
            Some(Err(Error::Serde(_))) => {}
            other => panic!("expected a serde error, got: {:?}", other.map(|r| r.is_ok())),
        }
    }
}
