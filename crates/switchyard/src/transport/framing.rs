//! JSON-lines framing: one serialised [`Message`] per newline-terminated
//! line.

use crate::message::Message;

use super::TransportError;

/// Longest accepted frame, newline included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Serialises `message` into a newline-terminated frame.
pub(crate) fn encode(message: &Message) -> Result<Vec<u8>, TransportError> {
    let mut frame =
        serde_json::to_vec(message).map_err(|source| TransportError::Encode { source })?;
    frame.push(b'\n');
    if frame.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(frame)
}

/// Incremental decoder for a byte stream of frames.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Appends `bytes` and returns every message completed by them.
    ///
    /// Blank lines are skipped. Any error leaves the decoder unusable; the
    /// caller is expected to drop the connection.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<Message>, TransportError> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        let mut consumed = 0;
        while let Some(line) = self.buffer.get(consumed..).and_then(next_line) {
            consumed += line.len() + 1;
            enforce_frame_limit(line.len() + 1)?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let message =
                serde_json::from_slice(line).map_err(|source| TransportError::Decode { source })?;
            messages.push(message);
        }
        self.buffer.drain(..consumed);
        enforce_frame_limit(self.buffer.len())?;
        Ok(messages)
    }

    /// Bytes of an incomplete trailing frame.
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn next_line(bytes: &[u8]) -> Option<&[u8]> {
    bytes
        .iter()
        .position(|byte| *byte == b'\n')
        .and_then(|end| bytes.get(..end))
}

const fn enforce_frame_limit(size: usize) -> Result<(), TransportError> {
    if size > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn decodes_frames_split_across_reads() {
        let signal = Message::signal("/a", "org.example.A", "Changed").with_body(json!([1, 2]));
        let frame = encode(&signal).expect("encode");
        let (head, tail) = frame.split_at(7);

        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(head).expect("partial frame").is_empty());
        assert_eq!(decoder.buffered(), 7);
        let decoded = decoder.push(tail).expect("complete frame");
        assert_eq!(decoded, vec![signal]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[rstest]
    fn decodes_several_frames_in_one_read() {
        let first = Message::signal("/a", "org.example.A", "One");
        let second = Message::signal("/a", "org.example.A", "Two");
        let mut bytes = encode(&first).expect("encode");
        bytes.extend_from_slice(b"\n");
        bytes.extend(encode(&second).expect("encode"));

        let decoded = FrameDecoder::default().push(&bytes).expect("frames");
        assert_eq!(decoded, vec![first, second]);
    }

    #[rstest]
    fn rejects_garbage() {
        let error = FrameDecoder::default()
            .push(b"not json\n")
            .expect_err("garbage should fail");
        assert!(matches!(error, TransportError::Decode { .. }));
    }

    #[rstest]
    fn rejects_oversized_partial_frames() {
        let mut decoder = FrameDecoder::default();
        let chunk = vec![b'x'; MAX_FRAME_BYTES + 1];
        let error = decoder.push(&chunk).expect_err("oversized frame");
        assert!(matches!(error, TransportError::FrameTooLarge { .. }));
    }
}
