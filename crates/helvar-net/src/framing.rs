/*!
 * Splits the inbound byte stream into protocol lines.
 *
 * Routers terminate messages with `#` and telnet-style sessions may add
 * CR/LF, so both act as delimiters. The `#` stays attached to its frame;
 * blank frames are dropped.
 */
use bytes::{Buf, BytesMut};

/// Initial capacity of the receive buffer
pub const READ_BUFFER_SIZE: usize = 8192;

/// Incremental line splitter over a [`BytesMut`] buffer
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Buffer to read into (`AsyncReadExt::read_buf`)
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete, non-blank frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let index = self
                .buffer
                .iter()
                .position(|b| matches!(b, b'#' | b'\r' | b'\n'))?;

            let frame = if self.buffer[index] == b'#' {
                self.buffer.split_to(index + 1)
            } else {
                let frame = self.buffer.split_to(index);
                self.buffer.advance(1);
                frame
            };

            let text = String::from_utf8_lossy(&frame);
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    /// Drain whatever is left as a final frame (used at end of stream)
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_hash_and_newlines() {
        let mut framer = LineFramer::new();
        framer.extend(b"?V:2,C:152,@1.1.1.5=42#?V:2,C:110,@1.1.1.5=0#\r\n\r\n>V:2,C:11,G:1,S:1\n");

        assert_eq!(framer.next_frame().as_deref(), Some("?V:2,C:152,@1.1.1.5=42#"));
        assert_eq!(framer.next_frame().as_deref(), Some("?V:2,C:110,@1.1.1.5=0#"));
        assert_eq!(framer.next_frame().as_deref(), Some(">V:2,C:11,G:1,S:1"));
        assert_eq!(framer.next_frame(), None);
    }

    #[test]
    fn test_holds_partial_frames() {
        let mut framer = LineFramer::new();
        framer.extend(b"?V:2,C:18");
        assert_eq!(framer.next_frame(), None);

        framer.extend(b"5=1700000000#");
        assert_eq!(framer.next_frame().as_deref(), Some("?V:2,C:185=1700000000#"));
    }

    #[test]
    fn test_finish_returns_unterminated_tail() {
        let mut framer = LineFramer::new();
        framer.extend(b"  \r\n?V:2,C:185=1");
        assert_eq!(framer.next_frame(), None);
        assert_eq!(framer.finish().as_deref(), Some("?V:2,C:185=1"));
        assert_eq!(framer.finish(), None);
    }
}
