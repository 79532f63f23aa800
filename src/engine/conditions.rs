use bitflags::bitflags;
use strum_macros::Display;

/// Who answers a ping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ConnectionSource {
    /// Full runtime.
    TinyClr,
    /// Boot loader.
    TinyBooter,
    Host,
    Unknown(u32),
}

impl ConnectionSource {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ConnectionSource::TinyClr,
            1 => ConnectionSource::TinyBooter,
            2 => ConnectionSource::Host,
            other => ConnectionSource::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            ConnectionSource::TinyClr => 0,
            ConnectionSource::TinyBooter => 1,
            ConnectionSource::Host => 2,
            ConnectionSource::Unknown(raw) => raw,
        }
    }
}

bitflags! {
    /// Flags of a ping reply.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PingFlags: u32 {
        const STOPPED = 0x0001;
        const BIG_ENDIAN = 0x0002;
        const APP_EXIT = 0x0004;
    }
}

bitflags! {
    /// Device execution conditions, changed with `EXECUTION_CHANGE_CONDITIONS`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ExecutionConditions: u32 {
        const SOURCE_LEVEL_DEBUGGING = 0x0000_0001;
        const STOPPED = 0x0000_0002;
        const PROGRAM_EXITED = 0x0000_0004;
        const BREAKPOINTS_DISABLED = 0x0000_0008;
        const PAUSE_TIMERS = 0x0000_0010;
        const NO_COMPACTION = 0x0000_0020;

        const STATE_INITIALIZE = 0x0001_0000;
        const STATE_WAITING_FOR_DEBUGGER = 0x0002_0000;
        const STATE_PROGRAM_RUNNING = 0x0004_0000;
        const STATE_PROGRAM_EXITED = 0x0008_0000;
        const STATE_MASK = 0x00FF_0000;
    }
}

/// Coarse device state, the high part of [`ExecutionConditions`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum DeviceState {
    Initialize,
    WaitingForDebugger,
    ProgramRunning,
    ProgramExited,
    Unknown,
}

impl ExecutionConditions {
    pub fn device_state(self) -> DeviceState {
        let state = self & ExecutionConditions::STATE_MASK;
        if state == ExecutionConditions::STATE_INITIALIZE {
            DeviceState::Initialize
        } else if state == ExecutionConditions::STATE_WAITING_FOR_DEBUGGER {
            DeviceState::WaitingForDebugger
        } else if state == ExecutionConditions::STATE_PROGRAM_RUNNING {
            DeviceState::ProgramRunning
        } else if state == ExecutionConditions::STATE_PROGRAM_EXITED {
            DeviceState::ProgramExited
        } else {
            DeviceState::Unknown
        }
    }
}

/// Kind of device reboot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RebootKind {
    /// Full power-on restart.
    Hard,
    /// Restart of CLR only.
    ClrOnly,
    /// Restart into boot loader.
    EnterBootloader,
}

impl RebootKind {
    pub(crate) fn raw(self) -> u32 {
        match self {
            RebootKind::Hard => 0x0,
            RebootKind::EnterBootloader => 0x1,
            RebootKind::ClrOnly => 0x2,
        }
    }
}
