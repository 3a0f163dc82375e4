use crate::platform::{MaybeSend, MaybeSync, SharedError, SharedPtr};
use std::{borrow::Cow, error::Error, fmt};

pub type StreamResult<T> = Result<T, StreamError>;

/// Error values carried by streams.
///
/// A stream keeps the first error it sees as its stored error and hands out clones of it
/// to every pending and future request, so the type is cheap to clone.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// Misuse of a stream: locked, released, closing or closed.
    TypeError(Cow<'static, str>),
    /// Invalid numeric input such as a negative high water mark or an uncountable chunk.
    RangeError(Cow<'static, str>),
    /// Writable stream aborted with an optional reason.
    Aborted(Option<String>),
    /// Readable stream canceled with an optional reason.
    Canceled(Option<String>),
    /// The driver task owning the source or sink was dropped before answering.
    TaskDropped,
    Other(SharedError),
}

impl StreamError {
    pub fn type_error(msg: impl Into<Cow<'static, str>>) -> Self {
        StreamError::TypeError(msg.into())
    }

    pub fn range_error(msg: impl Into<Cow<'static, str>>) -> Self {
        StreamError::RangeError(msg.into())
    }

    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + MaybeSend + MaybeSync + 'static,
    {
        StreamError::Other(SharedPtr::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        let shared: SharedPtr<dyn Error + Send + Sync> = SharedPtr::from(e);
        StreamError::Other(shared)
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, StreamError::TypeError(_))
    }

    pub fn is_range_error(&self) -> bool {
        matches!(self, StreamError::RangeError(_))
    }

    pub(crate) fn released() -> Self {
        StreamError::type_error("Reader or writer was released")
    }

    /// Every handle to the stream was dropped.
    pub(crate) fn detached() -> Self {
        StreamError::type_error("The stream no longer exists")
    }

    pub(crate) fn reason(&self) -> Option<String> {
        match self {
            StreamError::Aborted(reason) | StreamError::Canceled(reason) => reason.clone(),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::other(SimpleError(s.to_string()))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::other(SimpleError(s))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::other(e)
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::other_boxed(e)
    }
}

/// Adds direct `From` implementations for user error types so `?` works inside
/// sources, sinks and transformers without `.map_err(StreamError::other)`.
///
/// ```ignore
/// impl_stream_error_from!(serde_json::Error, my_crate::ParseError);
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::other(e)
                }
            }
        )*
    };
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::TypeError(msg) => write!(f, "TypeError: {}", msg),
            StreamError::RangeError(msg) => write!(f, "RangeError: {}", msg),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::Canceled(Some(reason)) => write!(f, "Stream was canceled: {}", reason),
            StreamError::Canceled(None) => write!(f, "Stream was canceled"),
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_produce_other_errors() {
        let from_str: StreamError = "error message".into();
        assert_eq!(from_str.to_string(), "error message");

        let from_string: StreamError = String::from("error").into();
        assert!(matches!(from_string, StreamError::Other(_)));

        let io_err = std::io::Error::other("io error");
        let converted: StreamError = io_err.into();
        assert!(converted.source().is_some());
    }

    #[test]
    fn question_mark_works_for_boxed_errors() -> Result<(), StreamError> {
        fn parse() -> Result<u8, Box<dyn Error + Send + Sync>> {
            Ok("7".parse::<u8>()?)
        }

        assert_eq!(parse()?, 7);
        Ok(())
    }

    #[test]
    fn macro_adds_from_impls() {
        #[derive(Debug)]
        struct UserError;
        impl fmt::Display for UserError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "user error")
            }
        }
        impl Error for UserError {}

        impl_stream_error_from!(UserError);

        fn fails() -> Result<(), StreamError> {
            Err(UserError)?;
            Ok(())
        }

        assert_eq!(fails().unwrap_err().to_string(), "user error");
    }

    #[test]
    fn classifies_type_and_range_errors() {
        let type_error = StreamError::type_error("locked");
        assert!(type_error.is_type_error());
        assert_eq!(type_error.to_string(), "TypeError: locked");

        let range_error = StreamError::range_error("negative");
        assert!(range_error.is_range_error());
        assert!(!range_error.is_type_error());
    }

    #[test]
    fn reason_round_trips_abort_and_cancel() {
        assert_eq!(
            StreamError::Aborted(Some("stop".into())).reason(),
            Some("stop".to_string())
        );
        assert_eq!(StreamError::Canceled(None).reason(), None);
        assert_eq!(
            StreamError::from("boom").reason(),
            Some("boom".to_string())
        );
    }
}
