//! The write-side emitter abstraction.
//!
//! Every emitter, whether the direct encoder or a deferred builder, exposes
//! the same facade: emit an instruction, bind a label, align, embed data or
//! a constant pool, attach a comment. The facade is an object-safe trait so
//! a builder can be serialized into any sink without knowing whether bytes
//! or nodes come out the other end.
//!
//! Alongside the facade every emitter carries an [`EmitterState`]: the
//! latched last error and the *next-instruction sidecar*: options, the
//! fifth/sixth operands, the op-mask, and an inline comment. Sidecar fields
//! affect exactly one instruction; `_emit` consumes and clears them whether
//! it succeeds or fails.

use crate::const_pool::ConstPool;
use crate::error::{CodeResult, Error};
use crate::inst::{AlignMode, ExtraOps, Hints, InstId, InstOptions};
use crate::operand::{Label, Operand};

/// Which concrete emitter a state belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EmitterKind {
    /// Direct streaming encoder.
    Assembler,
    /// Deferred node-list builder.
    Builder,
    /// Builder specialization with virtual registers and register
    /// allocation.
    Compiler,
}

/// Per-emitter state: error latch, propagated globals, and the
/// next-instruction sidecar.
#[derive(Debug)]
pub struct EmitterState {
    kind: EmitterKind,
    /// First non-OK result of a write-API call; short-circuits all further
    /// writes until reset.
    pub(crate) last_error: Option<Error>,
    /// Hints snapshotted from the holder at attach time.
    pub(crate) hints: Hints,
    /// Options merged into every instruction, snapshotted at attach time.
    pub(crate) global_options: InstOptions,
    /// Options of the next instruction only.
    pub(crate) options: InstOptions,
    /// Inline comment of the next instruction only.
    pub(crate) inline_comment: Option<String>,
    /// Fifth operand of the next instruction (indexed from zero).
    pub(crate) op4: Operand,
    /// Sixth operand of the next instruction (indexed from zero).
    pub(crate) op5: Operand,
    /// Op-mask operand of the next instruction.
    pub(crate) op_mask: Operand,
}

impl EmitterState {
    /// Fresh state for an emitter of the given kind.
    pub fn new(kind: EmitterKind) -> Self {
        Self {
            kind,
            last_error: None,
            hints: Hints::empty(),
            global_options: InstOptions::empty(),
            options: InstOptions::empty(),
            inline_comment: None,
            op4: Operand::None,
            op5: Operand::None,
            op_mask: Operand::None,
        }
    }

    /// The emitter kind this state belongs to.
    pub fn kind(&self) -> EmitterKind {
        self.kind
    }

    /// The latched error, if the emitter is in the error state.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    /// Leave the error state. The caller is responsible for reverting any
    /// partially-applied work that preceded the error.
    pub fn reset_last_error(&mut self) {
        self.last_error = None;
    }

    /// Options that will be merged into the next instruction.
    pub fn options(&self) -> InstOptions {
        self.options
    }

    /// Replace the next-instruction options.
    pub fn set_options(&mut self, options: InstOptions) {
        self.options = options;
    }

    /// Add to the next-instruction options.
    pub fn add_options(&mut self, options: InstOptions) {
        self.options |= options;
    }

    /// Set the fifth operand of the next instruction.
    pub fn set_op4(&mut self, op: Operand) {
        self.options |= InstOptions::HAS_OP4;
        self.op4 = op;
    }

    /// Set the sixth operand of the next instruction.
    pub fn set_op5(&mut self, op: Operand) {
        self.options |= InstOptions::HAS_OP5;
        self.op5 = op;
    }

    /// Set the op-mask operand of the next instruction.
    pub fn set_op_mask(&mut self, op: Operand) {
        self.options |= InstOptions::HAS_OP_MASK;
        self.op_mask = op;
    }

    /// Attach an inline comment to the next instruction.
    pub fn set_inline_comment(&mut self, comment: &str) {
        self.inline_comment = Some(comment.to_string());
    }

    /// The pending inline comment, if any.
    pub fn inline_comment(&self) -> Option<&str> {
        self.inline_comment.as_deref()
    }

    /// Take the whole sidecar, leaving it cleared. Every `_emit`
    /// implementation calls this exactly once, first thing.
    pub(crate) fn take_sidecar(&mut self) -> Sidecar {
        let options = self.options | self.global_options;
        self.options = InstOptions::empty();
        Sidecar {
            options,
            comment: self.inline_comment.take(),
            extra: ExtraOps {
                op4: std::mem::take(&mut self.op4),
                op5: std::mem::take(&mut self.op5),
                op_mask: std::mem::take(&mut self.op_mask),
            },
        }
    }
}

/// Sidecar contents captured for one instruction.
pub(crate) struct Sidecar {
    pub options: InstOptions,
    pub comment: Option<String>,
    pub extra: ExtraOps,
}

/// The write-side facade shared by the direct encoder and the deferred
/// builders. Object-safe: serialization drives a `&mut dyn Emitter`.
pub trait Emitter {
    /// Shared emitter state.
    fn state(&self) -> &EmitterState;

    /// Shared emitter state, mutably.
    fn state_mut(&mut self) -> &mut EmitterState;

    /// Emit one instruction in canonical form: four explicit operands plus
    /// whatever the sidecar carries. Prefer [`Emitter::emit`].
    fn _emit(
        &mut self,
        inst: InstId,
        o0: Operand,
        o1: Operand,
        o2: Operand,
        o3: Operand,
    ) -> CodeResult<()>;

    /// Create a new label registered with the holder. On failure the error
    /// is latched and an invalid label is returned.
    fn new_label(&mut self) -> Label;

    /// Bind `label` to the current position. Binding twice is an error.
    fn bind(&mut self, label: Label) -> CodeResult<()>;

    /// Align the current position to `alignment` bytes.
    fn align(&mut self, mode: AlignMode, alignment: u32) -> CodeResult<()>;

    /// Embed raw bytes.
    fn embed(&mut self, data: &[u8]) -> CodeResult<()>;

    /// Embed the absolute, relocated address of `label` (pointer-sized).
    fn embed_label(&mut self, label: Label) -> CodeResult<()>;

    /// Embed a constant pool: align to the pool's alignment, bind `label`,
    /// then embed the pool bytes.
    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> CodeResult<()>;

    /// Emit a standalone comment.
    fn comment(&mut self, text: &str) -> CodeResult<()>;

    /// Finish emission. Builders run their passes and serialize; the direct
    /// encoder flushes.
    fn finalize(&mut self) -> CodeResult<()>;

    /// Emit an instruction with any number of operands; operands beyond the
    /// fourth are routed through the sidecar slots.
    fn emit(&mut self, inst: InstId, operands: &[Operand]) -> CodeResult<()>
    where
        Self: Sized,
    {
        let get = |i: usize| operands.get(i).copied().unwrap_or(Operand::None);
        if operands.len() > 4 {
            self.state_mut().set_op4(operands[4]);
        }
        if operands.len() > 5 {
            self.state_mut().set_op5(operands[5]);
        }
        self._emit(inst, get(0), get(1), get(2), get(3))
    }

    /// Emit an instruction with no operands.
    fn emit0(&mut self, inst: InstId) -> CodeResult<()>
    where
        Self: Sized,
    {
        self._emit(inst, Operand::None, Operand::None, Operand::None, Operand::None)
    }

    /// Emit an instruction with one operand. Integers become immediates.
    fn emit1(&mut self, inst: InstId, o0: impl Into<Operand>) -> CodeResult<()>
    where
        Self: Sized,
    {
        self._emit(inst, o0.into(), Operand::None, Operand::None, Operand::None)
    }

    /// Emit an instruction with two operands. Integers become immediates.
    fn emit2(
        &mut self,
        inst: InstId,
        o0: impl Into<Operand>,
        o1: impl Into<Operand>,
    ) -> CodeResult<()>
    where
        Self: Sized,
    {
        self._emit(inst, o0.into(), o1.into(), Operand::None, Operand::None)
    }

    /// Emit an instruction with three operands. Integers become immediates.
    fn emit3(
        &mut self,
        inst: InstId,
        o0: impl Into<Operand>,
        o1: impl Into<Operand>,
        o2: impl Into<Operand>,
    ) -> CodeResult<()>
    where
        Self: Sized,
    {
        self._emit(inst, o0.into(), o1.into(), o2.into(), Operand::None)
    }

    /// Emit a formatted comment.
    fn comment_fmt(&mut self, args: core::fmt::Arguments<'_>) -> CodeResult<()>
    where
        Self: Sized,
    {
        self.comment(&args.to_string())
    }
}

/// Count the leading non-`None` operands, then widen to five or six when
/// the sidecar flags say so.
pub(crate) fn count_operands(
    options: InstOptions,
    o0: &Operand,
    o1: &Operand,
    o2: &Operand,
    o3: &Operand,
) -> usize {
    let mut count = 0;
    for op in [o0, o1, o2, o3] {
        if op.is_none() {
            break;
        }
        count += 1;
    }
    if options.contains(InstOptions::HAS_OP5) {
        6
    } else if options.contains(InstOptions::HAS_OP4) {
        5
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_is_consumed_once() {
        let mut state = EmitterState::new(EmitterKind::Builder);
        state.set_options(InstOptions::OVERWRITE);
        state.set_op4(Operand::Imm(1));
        state.set_inline_comment("hot path");

        let sidecar = state.take_sidecar();
        assert!(sidecar.options.contains(InstOptions::OVERWRITE));
        assert!(sidecar.options.contains(InstOptions::HAS_OP4));
        assert_eq!(sidecar.extra.op4, Operand::Imm(1));
        assert_eq!(sidecar.comment.as_deref(), Some("hot path"));

        let empty = state.take_sidecar();
        assert!(empty.options.is_empty());
        assert!(empty.comment.is_none());
        assert!(empty.extra.op4.is_none());
    }

    #[test]
    fn operand_counting_honors_sidecar_flags() {
        let r = Operand::Imm(0);
        let n = Operand::None;
        assert_eq!(count_operands(InstOptions::empty(), &r, &r, &n, &n), 2);
        assert_eq!(count_operands(InstOptions::empty(), &n, &n, &n, &n), 0);
        assert_eq!(count_operands(InstOptions::HAS_OP4, &r, &r, &r, &r), 5);
        assert_eq!(
            count_operands(InstOptions::HAS_OP4 | InstOptions::HAS_OP5, &r, &r, &r, &r),
            6
        );
    }
}
