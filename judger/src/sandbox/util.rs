use bytes::BytesMut;

/// Errors from the docker stream that only spoil a single frame.
pub fn is_recoverable_error(e: &bollard::errors::Error) -> bool {
    matches!(
        &e,
        bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. }
            | bollard::errors::Error::StrParseError { .. }
            | bollard::errors::Error::StrFmtError { .. }
            | bollard::errors::Error::URLEncodedError { .. }
    )
}

/// A byte buffer that silently drops everything beyond `size_limit`.
#[derive(Debug)]
pub struct SizeConstraintBytesMut {
    size_limit: usize,
    bytes: BytesMut,
    truncated: bool,
}

impl SizeConstraintBytesMut {
    pub fn new(size_limit: usize) -> Self {
        SizeConstraintBytesMut {
            size_limit,
            bytes: BytesMut::new(),
            truncated: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let room = self.size_limit.saturating_sub(self.bytes.len());
        if bytes.len() > room {
            self.bytes.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(bytes);
        }
    }

    /// True once any byte has been dropped.
    pub fn is_oversized(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}
