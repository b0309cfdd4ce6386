use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("declared frame length {declared} exceeds maximum of {max} bytes")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("payload too large: {0} bytes (max {max})", max = u16::MAX)]
    PayloadTooLarge(usize),

    #[error("checksum mismatch: frame carries 0x{expected:02x}, payload sums to 0x{actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("missing end marker: found 0x{0:02x}")]
    MissingEndMarker(u8),

    #[error("reassembly buffer full, dropped head byte to resynchronise")]
    BufferOverflow,

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown command code: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("unknown status code: 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("empty payload for {0} frame")]
    EmptyPayload(&'static str),

    #[error("protocol version mismatch: peer={peer}, local={local}")]
    VersionMismatch { peer: u8, local: u8 },

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl ProtocolError {
    /// Errors after which the stream can no longer be trusted.
    ///
    /// Everything else is line noise: the codec has already resynchronised and
    /// the caller only needs to count it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::VersionMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_display() {
        let e = ProtocolError::FrameTooLarge { declared: 9000, max: 4096 };
        let msg = e.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn unknown_frame_type_display() {
        let e = ProtocolError::UnknownFrameType(0xAB);
        assert!(e.to_string().contains("0xab"));
    }

    #[test]
    fn checksum_mismatch_display() {
        let e = ProtocolError::ChecksumMismatch { expected: 0x10, actual: 0x0f };
        let msg = e.to_string();
        assert!(msg.contains("0x10"));
        assert!(msg.contains("0x0f"));
    }

    #[test]
    fn fatal_classification() {
        assert!(!ProtocolError::FrameTooLarge { declared: 2, max: 1 }.is_fatal());
        assert!(ProtocolError::VersionMismatch { peer: 2, local: 1 }.is_fatal());
        assert!(!ProtocolError::ChecksumMismatch { expected: 0, actual: 1 }.is_fatal());
        assert!(!ProtocolError::MissingEndMarker(0).is_fatal());
        assert!(!ProtocolError::BufferOverflow.is_fatal());
        assert!(!ProtocolError::UnknownFrameType(0x7f).is_fatal());
    }
}
