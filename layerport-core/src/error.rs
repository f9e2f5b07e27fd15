use std::fmt::Display;

/// The class of a compilation failure.
///
/// Callers use this to tell "the file is broken" apart from "the importer is
/// incomplete" without matching on the wrapped variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Malformed,
    Unsupported,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The graph descriptor violates the format's structural rules.
    #[error("malformed graph: {op_type} '{node}': {message}")]
    Malformed {
        op_type: String,
        node: String,
        message: String,
    },

    /// The graph is well-formed but uses something the importer does not implement.
    #[error("unsupported: {op_type} '{node}': {message}")]
    Unsupported {
        op_type: String,
        node: String,
        message: String,
    },

    /// An invariant the importer itself guarantees was violated.
    #[error("internal inconsistency: {op_type} '{node}': {message}")]
    Internal {
        op_type: String,
        node: String,
        message: String,
    },

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Something an error can be attributed to: an operator node, a graph input,
/// or a sink.
pub trait ErrorSite {
    fn op_type(&self) -> &str;
    fn node_name(&self) -> &str;
}

impl ErrorSite for (&str, &str) {
    fn op_type(&self) -> &str {
        self.0
    }

    fn node_name(&self) -> &str {
        self.1
    }
}

impl<S: ErrorSite + ?Sized> ErrorSite for &S {
    fn op_type(&self) -> &str {
        (**self).op_type()
    }

    fn node_name(&self) -> &str {
        (**self).node_name()
    }
}

impl Error {
    pub fn malformed<S: ErrorSite + ?Sized, M: Display>(site: &S, message: M) -> Self {
        Self::Malformed {
            op_type: site.op_type().to_string(),
            node: site.node_name().to_string(),
            message: message.to_string(),
        }
        .bt()
    }

    pub fn unsupported<S: ErrorSite + ?Sized, M: Display>(site: &S, message: M) -> Self {
        Self::Unsupported {
            op_type: site.op_type().to_string(),
            node: site.node_name().to_string(),
            message: message.to_string(),
        }
        .bt()
    }

    pub fn internal<S: ErrorSite + ?Sized, M: Display>(site: &S, message: M) -> Self {
        Self::Internal {
            op_type: site.op_type().to_string(),
            node: site.node_name().to_string(),
            message: message.to_string(),
        }
        .bt()
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The class of this error, looking through backtrace wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed { .. } => ErrorKind::Malformed,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::WithBacktrace { inner, .. } => inner.kind(),
        }
    }

    /// The op type of the node this error was attributed to, if any.
    pub fn op_type(&self) -> Option<&str> {
        match self {
            Self::Malformed { op_type, .. }
            | Self::Unsupported { op_type, .. }
            | Self::Internal { op_type, .. } => Some(op_type),
            Self::WithBacktrace { inner, .. } => inner.op_type(),
        }
    }
}

/// Return early with an error of the given kind unless `cond` holds.
///
/// ```ignore
/// check!(axis < rank, malformed, self.header, "axis {axis} out of range");
/// ```
#[macro_export]
macro_rules! check {
    ($cond:expr, $kind:ident, $site:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::Error::$kind(&$site, format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_backtrace_wrapper() {
        let err = Error::WithBacktrace {
            inner: Box::new(Error::unsupported(&("Foo", "n0"), "operator Foo")),
            backtrace: Box::new(std::backtrace::Backtrace::disabled()),
        };
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(err.op_type(), Some("Foo"));
    }

    #[test]
    fn check_macro_returns_early() {
        fn inner(ok: bool) -> Result<u32> {
            check!(ok, malformed, ("Conv", "conv0"), "missing attribute '{}'", "kernel_shape");
            Ok(1)
        }
        assert_eq!(inner(true).unwrap(), 1);
        let err = inner(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(err.to_string().contains("kernel_shape"));
        assert!(err.to_string().contains("Conv"));
    }
}
