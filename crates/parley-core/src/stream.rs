//! Provider-agnostic streaming normalizer.
//!
//! Upstream streaming transports are event-per-line encodings: each line is
//! either a JSON delta payload behind a fixed prefix, a terminal marker, or
//! protocol noise (keep-alives, event-name lines). [`StreamNormalizer`]
//! turns raw byte chunks into [`DeltaEvent`]s, buffering the trailing
//! partial line between chunks and stopping at the first terminal marker.
//!
//! The per-provider knowledge — which lines are fragments and which line is
//! the terminal — lives in a decoder closure supplied by the adapter, so
//! the buffering and termination rules here are written once.

use tracing::trace;

use crate::message::{DeltaEvent, TokenUsage};
use crate::provider::ProviderError;

/// Classification of one complete line of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// A text delta to forward to the consumer.
    Fragment(String),
    /// The stream's terminal marker. Not forwarded as text.
    Terminal { usage: Option<TokenUsage> },
    /// Keep-alive, event-name line, or malformed payload. Skipped.
    Noise,
}

/// Incremental line buffer + decoder driver for one streaming response.
///
/// Feed raw transport chunks with [`feed`](Self::feed); call
/// [`finish`](Self::finish) when the transport closes to distinguish a
/// clean termination from a connection drop.
pub struct StreamNormalizer<D> {
    buf: Vec<u8>,
    terminated: bool,
    decode: D,
}

impl<D> StreamNormalizer<D>
where
    D: FnMut(&str) -> LineEvent,
{
    pub fn new(decode: D) -> Self {
        Self {
            buf: Vec::new(),
            terminated: false,
            decode,
        }
    }

    /// Consume one transport chunk and return the delta events completed by
    /// it, in upstream order.
    ///
    /// Only complete lines are processed; the trailing partial line stays
    /// buffered for the next chunk. Chunks arriving after the terminal
    /// marker are ignored. Lines the decoder cannot make sense of are
    /// skipped, since occasional non-JSON keep-alive lines are valid
    /// protocol noise for some providers.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DeltaEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.terminated {
                continue;
            }
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']).trim();
            if line.is_empty() {
                continue;
            }
            match (self.decode)(line) {
                LineEvent::Fragment(text) => events.push(DeltaEvent::Fragment(text)),
                LineEvent::Terminal { usage } => {
                    self.terminated = true;
                    events.push(DeltaEvent::Done { usage });
                }
                LineEvent::Noise => {
                    trace!(line, "skipping non-delta stream line");
                }
            }
        }
        events
    }

    /// Whether the terminal marker has been seen.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Signal that the transport closed.
    ///
    /// A close before the terminal marker is a failed generation, never a
    /// successful empty completion.
    pub fn finish(self) -> Result<(), ProviderError> {
        if self.terminated {
            Ok(())
        } else {
            Err(ProviderError::MissingTerminal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy decoder: `d:<text>` is a fragment, `end` is terminal, anything
    /// else is noise.
    fn toy_decoder(line: &str) -> LineEvent {
        if let Some(text) = line.strip_prefix("d:") {
            LineEvent::Fragment(text.to_string())
        } else if line == "end" {
            LineEvent::Terminal { usage: None }
        } else {
            LineEvent::Noise
        }
    }

    #[test]
    fn test_complete_lines_in_order() {
        let mut norm = StreamNormalizer::new(toy_decoder);
        let events = norm.feed(b"d:Hel\nd:lo\nend\n");
        assert_eq!(
            events,
            vec![
                DeltaEvent::Fragment("Hel".to_string()),
                DeltaEvent::Fragment("lo".to_string()),
                DeltaEvent::Done { usage: None },
            ]
        );
        assert!(norm.is_terminated());
        assert!(norm.finish().is_ok());
    }

    #[test]
    fn test_partial_line_retained_across_chunks() {
        let mut norm = StreamNormalizer::new(toy_decoder);
        assert_eq!(norm.feed(b"d:Hel"), vec![]);
        assert_eq!(
            norm.feed(b"lo\n"),
            vec![DeltaEvent::Fragment("Hello".to_string())]
        );
        assert_eq!(norm.feed(b"en"), vec![]);
        assert_eq!(norm.feed(b"d\n"), vec![DeltaEvent::Done { usage: None }]);
    }

    #[test]
    fn test_noise_lines_skipped() {
        let mut norm = StreamNormalizer::new(toy_decoder);
        let events = norm.feed(b": keep-alive\n\nd:x\ngarbage\nend\n");
        assert_eq!(
            events,
            vec![
                DeltaEvent::Fragment("x".to_string()),
                DeltaEvent::Done { usage: None },
            ]
        );
    }

    #[test]
    fn test_lines_after_terminal_ignored() {
        let mut norm = StreamNormalizer::new(toy_decoder);
        let events = norm.feed(b"end\nd:late\n");
        assert_eq!(events, vec![DeltaEvent::Done { usage: None }]);
        assert_eq!(norm.feed(b"d:more\n"), vec![]);
    }

    #[test]
    fn test_close_without_terminal_is_error() {
        let mut norm = StreamNormalizer::new(toy_decoder);
        let events = norm.feed(b"d:partial\n");
        assert_eq!(events, vec![DeltaEvent::Fragment("partial".to_string())]);
        assert!(matches!(
            norm.finish(),
            Err(ProviderError::MissingTerminal)
        ));
    }

    #[test]
    fn test_crlf_lines() {
        let mut norm = StreamNormalizer::new(toy_decoder);
        let events = norm.feed(b"d:a\r\nend\r\n");
        assert_eq!(
            events,
            vec![
                DeltaEvent::Fragment("a".to_string()),
                DeltaEvent::Done { usage: None },
            ]
        );
    }

    #[test]
    fn test_multibyte_utf8_split_across_chunks() {
        // "é" is 0xC3 0xA9; split it between two chunks inside one line.
        let mut norm = StreamNormalizer::new(toy_decoder);
        assert_eq!(norm.feed(b"d:caf\xc3"), vec![]);
        let events = norm.feed(b"\xa9\nend\n");
        assert_eq!(
            events,
            vec![
                DeltaEvent::Fragment("café".to_string()),
                DeltaEvent::Done { usage: None },
            ]
        );
    }

    #[test]
    fn test_terminal_usage_carried() {
        let usage = TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
        };
        let mut norm = StreamNormalizer::new(move |line: &str| {
            if line == "end" {
                LineEvent::Terminal { usage: Some(usage) }
            } else {
                LineEvent::Noise
            }
        });
        assert_eq!(
            norm.feed(b"end\n"),
            vec![DeltaEvent::Done { usage: Some(usage) }]
        );
    }
}
