use thiserror::Error;

/// Errors that can occur while decoding a wire buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireErr {
    /// The reader ran out of bytes mid-value
    #[error("Buffer exhausted: needed {needed} more bytes, {available} available")]
    Exhausted { needed: usize, available: usize },

    /// A discriminant byte did not match any variant of the target type
    #[error("Invalid discriminant {value} for {type_name}")]
    BadDiscriminant { value: u64, type_name: &'static str },

    /// A declared length exceeds what the buffer could possibly hold
    #[error("Declared length {declared} exceeds remaining buffer of {available} bytes")]
    BadLength { declared: usize, available: usize },

    /// A string field held invalid utf-8
    #[error("Invalid utf-8 in string field")]
    BadUtf8,

    /// The buffer held more bytes than the decoded value consumed
    #[error("Trailing bytes after decode: {remaining} left over")]
    TrailingBytes { remaining: usize },
}
