use std::rc::Rc;

use parse_display::Display;
use thiserror::Error;

/// Why a handler invocation stopped before completing normally.
///
/// The first four variants are *abort* faults: they mean some part of the
/// engine cancelled the invocation on purpose. Only [`Fault::Errored`]
/// represents a failure raised by handler code itself.
#[derive(Clone, Debug, Error)]
pub enum Fault {
    #[error("handler timed out")]
    Timedout,
    #[error("superseded by a newer dispatch")]
    Superseded,
    #[error("dispatch disallowed by policy")]
    Disallowed,
    #[error("owning engine unmounted")]
    Unmounted,
    #[error("{0}")]
    Errored(Rc<dyn std::error::Error>),
}

impl Fault {
    /// Wraps an arbitrary error as a generic fault.
    pub fn other(err: impl std::error::Error + 'static) -> Self {
        Self::Errored(Rc::new(err))
    }

    /// Creates a generic fault from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Errored(Rc::new(Adhoc(message.into())))
    }

    /// Classification of this fault, independent of its message text.
    pub fn reason(&self) -> Reason {
        match self {
            Self::Timedout => Reason::Timedout,
            Self::Superseded => Reason::Superseded,
            Self::Disallowed => Reason::Disallowed,
            Self::Unmounted => Reason::Unmounted,
            Self::Errored(_) => Reason::Errored,
        }
    }

    /// `true` if this fault came from cancellation rather than handler failure.
    pub fn is_abort(&self) -> bool {
        self.reason() != Reason::Errored
    }
}

impl From<Reason> for Fault {
    fn from(reason: Reason) -> Self {
        match reason {
            Reason::Timedout => Self::Timedout,
            Reason::Superseded => Self::Superseded,
            Reason::Disallowed => Self::Disallowed,
            Reason::Unmounted => Self::Unmounted,
            Reason::Errored => Self::msg("handler failed"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Adhoc(String);

/// Coarse classification of a [`Fault`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum Reason {
    #[display("timed out")]
    Timedout,
    #[display("superseded")]
    Superseded,
    #[display("disallowed")]
    Disallowed,
    #[display("unmounted")]
    Unmounted,
    #[display("errored")]
    Errored,
}

impl Reason {
    pub fn is_abort(&self) -> bool {
        *self != Self::Errored
    }
}

/// Record delivered to the registry fault sink whenever an invocation settles
/// with a fault.
#[derive(Clone, Debug)]
pub struct FaultReport {
    /// Diagnostic name of the action whose handler faulted.
    pub action: Rc<str>,
    pub fault: Fault,
    pub reason: Reason,
    /// `false` when no sink was installed and the report only went to the log.
    pub handled: bool,
}
