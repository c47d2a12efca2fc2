use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an asynchronous operation, as delivered through completion
/// callbacks. `Ok(())` is a successful completion.
pub type Status = std::result::Result<(), Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    Inval,
    #[error("opcode 0x{0:x} not registered")]
    Unreg(u32),
    #[error("out of memory")]
    NoMem,
    #[error("timed out")]
    TimedOut,
    #[error("canceled")]
    Canceled,
    /// Passthrough from the transport layer; carries the transport's own
    /// return code.
    #[error("transport failure (rc: {0})")]
    Transport(i32),
    /// Stack growth past the kernel limit. Observed as a fault, never
    /// recoverable at this layer; only reported where it is detectable.
    #[error("stack overflow")]
    Overflow,
    /// Failure reported by the host ULT runtime.
    #[error("ULT runtime failure (rc: {0})")]
    Ult(i32),
}

impl Error {
    /// Stable negative code for embedding a status in a reply message.
    /// Transport and ULT errors keep their foreign return code.
    pub fn code(&self) -> i32 {
        match self {
            Error::Inval => -1,
            Error::Unreg(_) => -2,
            Error::NoMem => -3,
            Error::TimedOut => -4,
            Error::Canceled => -5,
            Error::Transport(rc) => *rc,
            Error::Overflow => -7,
            Error::Ult(rc) => *rc,
        }
    }
}
