use crate::engine::EngineState;
use crate::wire::packet::Command;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error("config file parsing error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("rpc payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --------------------------------- transport errors ------------------------------------------
    #[error("no transport registered with name `{0}`")]
    TransportNotFound(String),
    #[error("no reply for command {0} within the total timeout")]
    CommunicationFailure(Command),
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    // --------------------------------- state machine violations ----------------------------------
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("invalid engine state transition: {from} -> {to}")]
    InvalidStateTransition { from: EngineState, to: EngineState },
    #[error("engine is not started")]
    NotStarted,
    #[error("engine already started")]
    AlreadyStarted,
    #[error("device not connected")]
    NotConnected,
    #[error("process is not stopped")]
    ProcessNotStopped,
    #[error("process exited")]
    ProcessExited,
    #[error("evaluation already in progress on thread {0}")]
    EvaluationInProgress(u32),

    // --------------------------------- mirrored entity not found ---------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(u32),
    #[error("frame with depth {0} not found")]
    FrameNotFound(u32),
    #[error("assembly with index {0} not found")]
    AssemblyNotFound(u32),
    #[error("app-domain {0} not found")]
    AppDomainNotFound(u32),
    #[error("token {0:#010X} can not be translated")]
    TokenNotFound(u32),
    #[error("scratch pad slot {0} is stale or out of range")]
    StaleScratchSlot(u32),

    // --------------------------------- rpc errors ------------------------------------------------
    #[error("endpoint ({0}, {1}) not found")]
    EndpointNotFound(u32, u32),
    #[error("endpoint ({0}, {1}) already registered")]
    EndpointAlreadyRegistered(u32, u32),
    #[error("remote side rejects endpoint ({0}, {1})")]
    EndpointRejected(u32, u32),
    #[error("remote fault {type_name}: {message}")]
    RemoteFault { type_name: String, message: String },
    #[error("rpc call timed out")]
    RpcTimeout,

    // --------------------------------- device command failures ----------------------------------
    #[error("device rejects command {0}")]
    Rejected(Command),
    #[error("evaluation not completed within timeout")]
    EvaluationTimeout,
    #[error("device did not stop within timeout")]
    StopTimeout,
    #[error("no free breakpoint id, {0} breakpoints are set")]
    BreakpointLimit(usize),
    #[error("device breakpoint queue not exhausted after {0} hits")]
    BreakpointQueueOverflow(usize),

    // --------------------------------- attach / deploy fatal errors ------------------------------
    #[error("device does not reconnect after reboot ({attempts} attempts)")]
    Reconnect { attempts: u32 },
    #[error("device does not reach initialize state after {attempts} attempts")]
    DeviceNotInitialized { attempts: u32 },
    #[error("deployment image needs {required} bytes but only {available} available")]
    InsufficientStorage { required: usize, available: usize },
    #[error("device has no deployment storage")]
    NoDeploymentStorage,
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::FromUtf8(_) => false,
            Error::Config(_) => false,
            Error::Serialization(_) => false,
            Error::TransportNotFound(_) => false,
            Error::CommunicationFailure(_) => false,
            Error::MalformedPayload(_) => false,
            Error::ShuttingDown => false,
            Error::InvalidStateTransition { .. } => false,
            Error::NotStarted => false,
            Error::AlreadyStarted => false,
            Error::NotConnected => false,
            Error::ProcessNotStopped => false,
            Error::ProcessExited => false,
            Error::EvaluationInProgress(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::FrameNotFound(_) => false,
            Error::AssemblyNotFound(_) => false,
            Error::AppDomainNotFound(_) => false,
            Error::TokenNotFound(_) => false,
            Error::StaleScratchSlot(_) => false,
            Error::EndpointNotFound(_, _) => false,
            Error::EndpointAlreadyRegistered(_, _) => false,
            Error::EndpointRejected(_, _) => false,
            Error::RemoteFault { .. } => false,
            Error::RpcTimeout => false,
            Error::Rejected(_) => false,
            Error::EvaluationTimeout => false,
            Error::StopTimeout => false,
            Error::BreakpointLimit(_) => false,
            Error::BreakpointQueueOverflow(_) => false,

            // attach can not continue after these
            Error::Reconnect { .. } => true,
            Error::DeviceNotInitialized { .. } => true,
            Error::InsufficientStorage { .. } => true,
            Error::NoDeploymentStorage => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "mfdbg", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "mfdbg", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

/// Check an internal invariant. Violation is logged with context and never used for control flow.
#[macro_export]
macro_rules! consistency_check {
    ($cond: expr, $($arg:tt)+) => {
        if !$cond {
            log::error!(target: "mfdbg", "consistency check `{}` failed: {}", stringify!($cond), format_args!($($arg)+));
        }
    };
}
