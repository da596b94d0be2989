//! Snapvault uses `Result`s with a simple error type, and relies on
//! tracing / logging to track information about provenance and to map
//! low-level errors to higher-level operations.
//!
//! The level at which an error is traced is its severity.  On top of
//! that, every error is classified as transient (worth retrying at
//! the point of failure, e.g., a socket error or a 5xx response) or
//! permanent (retrying the same operation won't help).
pub use tracing::Level;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Emit a backtrace whenever we capture an errors at least as severe
/// as BACKTRACE_SEVERITY.
const BACKTRACE_SEVERITY: Level = Level::ERROR;

/// An `Error` is a lightweight struct that relies on the `tracing` crate
/// to stitch up context together after an error.
#[derive(Debug)]
pub struct Error {
    // The uuid for the initial ("root") error.
    initial_id: Uuid,
    pub message: &'static str,
    transient: bool,
}

impl Error {
    /// Creates a new `Error` struct; this constructor should only
    /// be called via the macros.
    #[inline(always)]
    pub fn new(initial_id: Uuid, message: &'static str, transient: bool) -> Self {
        Error {
            initial_id,
            message,
            transient,
        }
    }

    /// Returns whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Marks `self` as a transient failure.
    pub fn into_transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Marks `self` as a permanent failure.
    pub fn into_permanent(mut self) -> Self {
        self.transient = false;
        self
    }

    /// Converts `self` to a `std::io::Error`.
    #[allow(dead_code)]
    #[inline(always)]
    pub fn to_io(&self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, self.message)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// Only exported for macro use
///
/// Computes a backtrace if `level` is severe enough.
#[inline(always)]
pub fn __maybe_compute_backtrace(level: Level) -> Option<backtrace::Backtrace> {
    if level > BACKTRACE_SEVERITY {
        return None;
    }

    Some(backtrace::Backtrace::new())
}

/// Only exported for macro use.
///
/// If `T == Error`, returns `x`'s `initial_id`, its transient flag,
/// and `(None, None)`.  Otherwise, returns a fresh uuid, `false`,
/// `x`, and potentially a backtrace.
#[inline(always)]
pub fn __extract_cause_info<T: std::any::Any>(
    x: T,
    level: Level,
) -> (Uuid, bool, Option<T>, Option<backtrace::Backtrace>) {
    use std::any::Any;

    match (&x as &dyn Any).downcast_ref::<Error>() {
        Some(as_error) => (as_error.initial_id, as_error.transient, None, None),
        None => (
            Uuid::new_v4(),
            false,
            Some(x),
            __maybe_compute_backtrace(level),
        ),
    }
}

/// If `value` evaluates to `Err`, matches the error payload against
/// the patterns, evaluates the corresponding handling expression, and
/// drops the result.
#[macro_export]
macro_rules! drop_result {
    ($value:expr, $($($pattern:pat_param)|+ $(if $guard:expr)? => $handler:expr),+) => {
        if let Err(name) = $value {
            match name {
                $($($pattern)|+ $(if $guard)? => { let _ = $handler; }),+
            }
        }
    };
}

/// Returns a fresh `Error` struct, after tracing it at level `level`,
/// with `message` and additional fields passed as a `tracing::event`.
#[macro_export]
macro_rules! fresh {
    ($level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message, false);

        tracing::event!(LEVEL, %root_id, ?bt, $message);
        ret
    }};
    ($level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message, false);

        tracing::event!(LEVEL, $($fields)+, %root_id, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! fresh_error {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_warn {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_info {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::INFO, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_debug {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::DEBUG, $($message_and_fields)+) };
}

/// Returns a fresh transient `Error`, traced at WARN level.
#[macro_export]
macro_rules! fresh_transient {
    ($($message_and_fields:tt)+) => {
        $crate::fresh!(tracing::Level::WARN, $($message_and_fields)+).into_transient()
    };
}

/// Returns an `Error` struct derived from `initial`, after tracing it
/// at level `level`, with `message` and additional fields passed as a
/// `tracing::event`.
///
/// The new error inherits `initial`'s transient flag when `initial`
/// is itself an `Error`.
#[macro_export]
macro_rules! chain {
    ($initial:expr, $level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, transient, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message, transient);

        tracing::event!(LEVEL, %root_id, transient, ?cause, ?bt, $message);
        ret
    }};
    ($initial:expr, $level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, transient, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message, transient);

        tracing::event!(LEVEL, $($fields)+, %root_id, transient, ?cause, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! chain_error {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_warn {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_info {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::INFO, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_debug {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::DEBUG, $($message_and_fields)+) };
}

/// Chains `initial` into a transient `Error`, traced at WARN level.
#[macro_export]
macro_rules! chain_transient {
    ($initial:expr, $($message_and_fields:tt)+) => {
        $crate::chain!($initial, tracing::Level::WARN, $($message_and_fields)+).into_transient()
    };
}

/// Creates a fresh `Error` struct from the `std::io::Error` `error`,
/// and logs it at a dynamic level: if the error's kind matches
/// the pattern, the level is `benign_level`, otherwise it's `ERROR`.
#[macro_export]
macro_rules! filtered_io_error {
    ($error:expr, $($benign_kind:pat_param)|+ $(if $guard:expr)? => $benign_level:expr, $($message_and_fields:tt)+) => {{
        let err = $error;
        match err.kind() {
            $($benign_kind)|+ $(if $guard)? => $crate::chain!(err, $benign_level, $($message_and_fields)+),
            _ => $crate::chain!(err, tracing::Level::ERROR, $($message_and_fields)+),
        }
    }};
}

#[test]
fn chain_preserves_transient_flag() {
    let root = crate::fresh_transient!("socket reset");
    assert!(root.is_transient());

    let chained = crate::chain_info!(root, "upload failed", path = "a/b");
    assert!(chained.is_transient());
    assert_eq!(chained.message, "upload failed");
}

#[test]
fn chain_foreign_error_is_permanent() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let chained = crate::chain_debug!(io, "failed to open");
    assert!(!chained.is_transient());
    assert!(chained.into_transient().is_transient());
}
