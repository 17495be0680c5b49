//! Multi-part message payloads.

use bytes::Bytes;

/// An ordered sequence of opaque byte ranges ("parts").
///
/// Parts are reference counted; cloning a message or handing it to the
/// transport never copies payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    parts: Vec<Bytes>,
}

impl Message {
    /// Create an empty message (zero parts).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message from its parts.
    pub fn from_parts(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    /// Create a single-part message.
    pub fn single(part: impl Into<Bytes>) -> Self {
        Self {
            parts: vec![part.into()],
        }
    }

    /// Append a part.
    pub fn push(&mut self, part: impl Into<Bytes>) {
        self.parts.push(part.into());
    }

    /// Builder-style [`push`](Self::push).
    pub fn with_part(mut self, part: impl Into<Bytes>) -> Self {
        self.push(part);
        self
    }

    /// The parts, in order.
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Take ownership of the parts.
    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }

    /// Number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Whether the message has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total number of payload bytes across all parts.
    pub fn payload_size(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }
}

impl From<Vec<Bytes>> for Message {
    fn from(parts: Vec<Bytes>) -> Self {
        Self::from_parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_size() {
        let message = Message::new()
            .with_part(vec![0u8; 10])
            .with_part(Bytes::new())
            .with_part(Bytes::from_static(b"hello"));
        assert_eq!(message.part_count(), 3);
        assert_eq!(message.payload_size(), 15);
    }

    #[test]
    fn test_empty_message() {
        let message = Message::new();
        assert!(message.is_empty());
        assert_eq!(message.payload_size(), 0);
    }

    #[test]
    fn test_clone_shares_parts() {
        let message = Message::single(vec![7u8; 64]);
        let copy = message.clone();
        assert_eq!(
            message.parts()[0].as_ptr(),
            copy.parts()[0].as_ptr(),
            "parts must be shared, not copied"
        );
    }
}
