use common::dma::DmaError;
use thiserror::Error;

use crate::xhci::TrbCompletionCode;

pub type Result<T, E = XhciError> = std::result::Result<T, E>;

// errno values of the host adapter boundary.
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const EPIPE: i32 = 32;
pub const ENOSYS: i32 = 38;
pub const EPROTO: i32 = 71;
pub const ETIMEDOUT: i32 = 110;
pub const ECANCELED: i32 = 125;

/// The semantic outcome of a non-successful completion code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CompletionError {
    /// The device rejected the request (a STALL handshake).
    Stall,
    /// The device did not answer correctly, or at all.
    Transaction,
    /// The controller ran out of memory, slots or bandwidth.
    Resource,
    /// Software asked for a transition the slot or endpoint state does not allow.
    ContextState,
    /// The device is incompatible, or the controller reported something unintelligible.
    Device,
    /// The command or transfer was stopped or aborted before it completed.
    Aborted,
}

impl CompletionError {
    /// Classifies a raw completion code. `None` means the code reports success, which includes
    /// short packets.
    pub fn from_code(code: u8) -> Option<Self> {
        use TrbCompletionCode::*;

        let code = match TrbCompletionCode::from_raw(code) {
            Some(code) => code,
            None => return Some(CompletionError::Device),
        };
        Some(match code {
            Success | ShortPacket => return None,
            Stall => CompletionError::Stall,
            DataBuffer | BabbleDetected | UsbTransaction | SplitTransaction | NoPingResponse
            | MissedService | IsochBuffer | RingUnderrun | RingOverrun => {
                CompletionError::Transaction
            }
            Resource | Bandwidth | NoSlotsAvailable | BandwidthOverrun | SecondaryBandwidth
            | EventRingFull | VfEventRingFull | EventLost => CompletionError::Resource,
            ContextState | SlotNotEnabled | EndpointNotEnabled | Parameter | Trb
            | InvalidStreamType | InvalidStreamId | MaxExitLatencyTooLarge => {
                CompletionError::ContextState
            }
            CommandRingStopped | CommandAborted | Stopped | StoppedLengthInvalid
            | StoppedShortPacket => CompletionError::Aborted,
            Invalid | IncompatibleDevice | Rsv30 | Undefined => CompletionError::Device,
        })
    }

    pub fn errno(self) -> i32 {
        match self {
            CompletionError::Stall => -EPIPE,
            CompletionError::Transaction => -EPROTO,
            CompletionError::Resource => -ENOMEM,
            CompletionError::ContextState => -EINVAL,
            CompletionError::Device => -ENODEV,
            CompletionError::Aborted => -ECANCELED,
        }
    }
}

#[derive(Debug, Error)]
pub enum XhciError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("completion code {code:#04x} ({kind:?})")]
    Completion { code: u8, kind: CompletionError },
    #[error("DMA error: {0}")]
    Dma(#[from] DmaError),
    #[error("controller bring-up failed: {0}")]
    Init(&'static str),
    #[error("controller is not responding")]
    NoDevice,
    #[error("no device in slot {0}")]
    NoSuchDevice(u8),
    #[error("slot {0} is already in use")]
    SlotInUse(u8),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("a command is already outstanding")]
    CommandPending,
    #[error("ring is full")]
    RingFull,
    #[error("operation not supported")]
    Unsupported,
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl XhciError {
    /// Turns a completion code into `Ok` for success and short packets, or the matching error.
    pub fn check_completion(code: u8) -> Result<()> {
        match CompletionError::from_code(code) {
            None => Ok(()),
            Some(kind) => Err(XhciError::Completion { code, kind }),
        }
    }

    /// The error a request gets when the addressed function refuses it.
    pub fn stall() -> Self {
        XhciError::Completion {
            code: TrbCompletionCode::Stall as u8,
            kind: CompletionError::Stall,
        }
    }

    pub fn completion_kind(&self) -> Option<CompletionError> {
        match self {
            XhciError::Completion { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_stall(&self) -> bool {
        self.completion_kind() == Some(CompletionError::Stall)
    }

    /// The negative errno handed across the host adapter boundary.
    pub fn errno(&self) -> i32 {
        match self {
            XhciError::Timeout(_) => -ETIMEDOUT,
            XhciError::Completion { kind, .. } => kind.errno(),
            XhciError::Dma(_) => -ENOMEM,
            XhciError::NoDevice | XhciError::NoSuchDevice(_) => -ENODEV,
            XhciError::InvalidState(_) => -EINVAL,
            XhciError::SlotInUse(_) | XhciError::CommandPending | XhciError::RingFull => -EBUSY,
            XhciError::Unsupported => -ENOSYS,
            XhciError::Init(_) | XhciError::Config(_) | XhciError::InvalidConfig(_) => -EIO,
        }
    }
}
