use snafu::Snafu;
use snafu_utils::{Located, Location, Report};

/// Fault reported by a memory manager.
///
/// None of these are transient. An allocator never retries or hands out a
/// smaller block than asked for; the caller either has a fallback or treats
/// the error as fatal (see [`report`]).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("out of memory: no room for {size} bytes aligned to {alignment}"))]
    OutOfMemory {
        size: usize,
        alignment: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {address:#x} is outside of {start:#x}..={end:#x}"))]
    OutOfBounds {
        address: usize,
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("illegal state: {reason}"))]
    IllegalState {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum ErrorKind {
    OutOfMemory,
    OutOfBounds,
    IllegalState,
}

impl AllocError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Self::IllegalState { .. } => ErrorKind::IllegalState,
        }
    }
}

impl Located for AllocError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::OutOfMemory { location, .. }
            | Self::OutOfBounds { location, .. }
            | Self::IllegalState { location, .. } => Some(*location),
        }
    }
}

/// Terminates the current context with a rendering of `err`.
///
/// This is where a process whose heap is exhausted, or a kernel whose frame
/// pool is, stops.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: core::error::Error + Located,
{
    let report = Report::new(err);
    log::error!("memory manager failure\n{report}");
    panic!("Critical error occurred\n\n{report}");
}
