//! Error codes shared by every write-side API of the library.
//!
//! All emitters follow the same discipline: the first failure is latched
//! into the emitter's last-error slot and every subsequent write-API call
//! short-circuits, returning the latched error, until the caller explicitly
//! resets it. See [`crate::emitter::EmitterState`].

use thiserror::Error;

/// A convenient alias for a `Result` that uses [`Error`].
pub type CodeResult<T> = Result<T, Error>;

/// Errors produced while building or finalizing code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// An arena or code buffer could not allocate the requested memory.
    #[error("no heap memory available for allocation")]
    NoHeapMemory,

    /// A label id does not refer to a label registered with the holder.
    #[error("invalid label")]
    InvalidLabel,

    /// The holder's architecture cannot be driven by this emitter.
    #[error("invalid or unsupported architecture")]
    InvalidArch,

    /// An operation was called in a state that does not permit it, for
    /// example `end_func` with no open function.
    #[error("invalid state")]
    InvalidState,

    /// A register operand refers to a virtual register that was not created
    /// by the compiler it is used with.
    #[error("invalid virtual register id")]
    InvalidVirtId,

    /// The label passed to `bind` already has an offset.
    #[error("label is already bound")]
    LabelAlreadyBound,

    /// The generated code does not fit the destination buffer.
    #[error("code too large")]
    CodeTooLarge,

    /// A section owns a fixed-size buffer that cannot satisfy the request.
    #[error("fixed buffer too small")]
    FixedBufferTooSmall,

    /// A section id does not refer to a section of the holder, or a section
    /// name exceeds the maximum length.
    #[error("invalid section")]
    InvalidSection,

    /// The instruction id is not valid for the target architecture.
    #[error("invalid instruction")]
    InvalidInstruction,

    /// An operand combination is not encodable for the instruction.
    #[error("invalid operand")]
    InvalidOperand,

    /// A relative displacement does not fit its field and no trampoline is
    /// allowed for this relocation kind.
    #[error("displacement out of range")]
    DisplacementOverflow,

    /// A second direct encoder was attached while one is already active.
    #[error("direct encoder slot already taken")]
    SlotAlreadyTaken,
}
