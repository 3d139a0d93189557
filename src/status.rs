//! Error carrier shared by every fallible codec operation.
//!
//! A [`Status`] is one [`ErrorCode`] plus a short human readable message kept
//! in a fixed inline buffer, so reporting an error never allocates.

use core::fmt;

use thiserror::Error;

/// Longest message a [`Status`] retains. Longer text is cut on a char boundary.
pub const MAX_MESSAGE_LEN: usize = 127;

/// Coarse classification of failures, as seen by callers of the entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The input bytes (or a mini-descriptor) do not follow the format.
    Malformed,
    /// A required field was absent after a complete parse.
    MissingRequired,
    /// The arena's block allocator returned null, or a sub-message could not
    /// be tied to its parent's arena.
    OutOfMemory,
    /// A sub-message was met whose mini-table is still a placeholder.
    UnlinkedSubMessage,
    /// Serialization into a caller-sized buffer could not fit.
    InsufficientBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    /// Varint ran past its input or beyond ten bytes.
    #[error("truncated or overlong varint")]
    TruncatedVarint,
    /// A fixed-width value or tag ran past the end of its input.
    #[error("unexpected end of input")]
    TruncatedInput,
    /// A length prefix points past the end of the enclosing range.
    #[error("length prefix out of bounds")]
    LengthOutOfBounds,
    /// END_GROUP did not match the open group, or a group was left open.
    #[error("mismatched end group")]
    MismatchedEndGroup,
    /// Nesting exceeded the configured recursion cap.
    #[error("maximum nesting depth exceeded")]
    MaxDepthExceeded,
    /// A validating string field held invalid UTF-8.
    #[error("invalid UTF-8 in string field")]
    BadUtf8,
    /// Field number zero, or one above 2^29-1.
    #[error("invalid field number")]
    InvalidFieldNumber,
    /// Wire types 6 and 7 are not defined.
    #[error("invalid wire type")]
    InvalidWireType,
    #[error("missing required field")]
    MissingRequired,
    #[error("out of memory")]
    OutOfMemory,
    /// Two arenas could not be fused: one has a caller-supplied initial
    /// block, or their block allocators differ.
    #[error("arenas cannot be fused")]
    ArenaFuseRefused,
    #[error("unlinked sub-message")]
    UnlinkedSubMessage,
    #[error("output buffer too small")]
    InsufficientBuffer,
    /// A mini-descriptor failed validation.
    #[error("invalid mini-descriptor")]
    InvalidDescriptor,
    /// A message body is larger than the 2 GiB wire limit.
    #[error("message too large")]
    MessageTooLarge,
}

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::MissingRequired => ErrorKind::MissingRequired,
            ErrorCode::OutOfMemory | ErrorCode::ArenaFuseRefused => ErrorKind::OutOfMemory,
            ErrorCode::UnlinkedSubMessage => ErrorKind::UnlinkedSubMessage,
            ErrorCode::InsufficientBuffer => ErrorKind::InsufficientBuffer,
            ErrorCode::TruncatedVarint
            | ErrorCode::TruncatedInput
            | ErrorCode::LengthOutOfBounds
            | ErrorCode::MismatchedEndGroup
            | ErrorCode::MaxDepthExceeded
            | ErrorCode::BadUtf8
            | ErrorCode::InvalidFieldNumber
            | ErrorCode::InvalidWireType
            | ErrorCode::InvalidDescriptor
            | ErrorCode::MessageTooLarge => ErrorKind::Malformed,
        }
    }
}

/// Inline, bounded message text.
#[derive(Clone, Copy)]
pub struct StatusMessage {
    buf: [u8; MAX_MESSAGE_LEN],
    len: u8,
}

impl StatusMessage {
    const fn new() -> Self {
        StatusMessage {
            buf: [0; MAX_MESSAGE_LEN],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only whole chars are ever copied in.
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or_default()
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Write for StatusMessage {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let start = self.len as usize;
        let room = MAX_MESSAGE_LEN - start;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[start..start + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len = (start + take) as u8;
        Ok(())
    }
}

impl PartialEq for StatusMessage {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for StatusMessage {}

impl fmt::Debug for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Error)]
pub struct Status {
    code: ErrorCode,
    message: StatusMessage,
}

impl Status {
    #[inline]
    pub const fn new(code: ErrorCode) -> Self {
        Status {
            code,
            message: StatusMessage::new(),
        }
    }

    /// Creates a status whose message is rendered from `args`.
    pub fn with_message(code: ErrorCode, args: fmt::Arguments<'_>) -> Self {
        let mut status = Status::new(code);
        status.set_message(args);
        status
    }

    pub fn set_message(&mut self, args: fmt::Arguments<'_>) {
        self.message.clear();
        let _ = fmt::write(&mut self.message, args);
    }

    /// Appends to the current message, truncating at the inline capacity.
    pub fn append_message(&mut self, args: fmt::Arguments<'_>) {
        let _ = fmt::write(&mut self.message, args);
    }

    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    #[inline]
    pub(crate) const fn out_of_memory() -> Self {
        Status::new(ErrorCode::OutOfMemory)
    }
}

impl From<ErrorCode> for Status {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        Status::new(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message().is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message())
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

pub type Result<T> = core::result::Result<T, Status>;

/// Builds a [`Status`] with a formatted message.
#[macro_export]
macro_rules! status {
    ($code:expr) => {
        $crate::status::Status::new($code)
    };
    ($code:expr, $($arg:tt)+) => {
        $crate::status::Status::with_message($code, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_grouped() {
        assert_eq!(ErrorCode::BadUtf8.kind(), ErrorKind::Malformed);
        assert_eq!(ErrorCode::MaxDepthExceeded.kind(), ErrorKind::Malformed);
        assert_eq!(ErrorCode::MissingRequired.kind(), ErrorKind::MissingRequired);
        assert_eq!(ErrorCode::OutOfMemory.kind(), ErrorKind::OutOfMemory);
        assert_eq!(ErrorCode::ArenaFuseRefused.kind(), ErrorKind::OutOfMemory);
        assert_eq!(
            ErrorCode::InsufficientBuffer.kind(),
            ErrorKind::InsufficientBuffer
        );
    }

    #[test]
    fn message_is_bounded() {
        let long = "é".repeat(200);
        let status = Status::with_message(ErrorCode::InvalidDescriptor, format_args!("{long}"));
        assert!(status.message().len() <= MAX_MESSAGE_LEN);
        assert!(status.message().chars().all(|c| c == 'é'));
    }

    #[test]
    fn display_includes_message() {
        let status = crate::status!(ErrorCode::InvalidDescriptor, "bad char {:?}", 'x');
        assert_eq!(status.to_string(), "invalid mini-descriptor: bad char 'x'");
        assert_eq!(Status::new(ErrorCode::BadUtf8).to_string(), "invalid UTF-8 in string field");
    }

    #[test]
    fn append_keeps_prefix() {
        let mut status = Status::new(ErrorCode::LengthOutOfBounds);
        status.set_message(format_args!("field {}", 7));
        status.append_message(format_args!(" at {}", 12));
        assert_eq!(status.message(), "field 7 at 12");
    }
}
