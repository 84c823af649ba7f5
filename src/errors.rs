use iced_x86::{Mnemonic, OpKind};
use thiserror::Error;

/// Opaque failure propagated out of a host callback.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can terminate an execution unit. All faults propagate to
/// the host; none are retried inside the core.
#[derive(Debug, Error)]
pub enum CpuFault {
    #[error("cannot decode instruction at {segment:04X}:{offset:04X} (bytes {bytes:02X?})")]
    DecodeFailure {
        segment: u16,
        offset: u16,
        bytes: [u8; 8],
    },

    #[error("mnemonic {0:?} is not implemented")]
    UnsupportedMnemonic(Mnemonic),

    #[error("{mnemonic:?} does not support operand shape {kinds:?}")]
    UnsupportedOperandShape {
        mnemonic: Mnemonic,
        kinds: (OpKind, OpKind),
    },

    #[error("integer divide error")]
    DivideError,

    #[error("unmasked x87 exception: {0:?}")]
    FpuException(FpuExceptionKind),

    #[error("stack access outside segment bounds at {segment:04X}:{sp:04X}")]
    StackFault { segment: u16, sp: u16 },

    #[error("relocation sentinel at {segment:04X}:{offset:04X} has no registered record")]
    RelocationMissing { segment: u16, offset: u16 },

    #[error("no segment registered for selector {0:04X}")]
    SegmentMissing(u16),

    #[error("host function {import}:{ordinal} failed")]
    HostInvokeFailure {
        import: u16,
        ordinal: u16,
        #[source]
        cause: HostError,
    },

    #[error("interrupt {0:#04X} has no host handler")]
    UnhandledInterrupt(u8),

    #[error("variable segment space exhausted")]
    OutOfVariableSpace,

    #[error("execution cancelled by host")]
    Cancelled,
}

/// x87 exception classes, mirroring the status-word sticky bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuExceptionKind {
    InvalidOperation,
    DenormalOperand,
    ZeroDivide,
    Overflow,
    Underflow,
    Precision,
}
