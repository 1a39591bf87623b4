//! Instruction ids, per-instruction options, emitter hints, and the operand
//! validator.
//!
//! The id space keeps all conditional jumps in one contiguous range,
//! followed immediately by the unconditional jump, so that "is this a
//! jump?" is a single range check during node construction. The order of
//! the conditional ids matches the x86 condition-code encoding, which lets
//! the encoder derive the `0F 8x` opcode from the id alone.

use bitflags::bitflags;

use crate::error::{CodeResult, Error};
use crate::holder::ArchType;
use crate::operand::Operand;

/// Instruction identifiers for the supported x86/x64 subset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum InstId {
    /// No operation.
    Nop = 0,
    /// Move register/memory/immediate.
    Mov,
    /// Add.
    Add,
    /// Subtract.
    Sub,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Compare.
    Cmp,
    /// Logical compare.
    Test,
    /// Load effective address.
    Lea,
    /// Push onto the stack.
    Push,
    /// Pop from the stack.
    Pop,
    /// Increment.
    Inc,
    /// Decrement.
    Dec,
    /// Two's complement negation.
    Neg,
    /// One's complement negation.
    Not,
    /// Return from procedure.
    Ret,
    /// Call procedure.
    Call,
    /// Jump if overflow.
    Jo,
    /// Jump if not overflow.
    Jno,
    /// Jump if below (unsigned).
    Jb,
    /// Jump if above or equal (unsigned).
    Jae,
    /// Jump if equal.
    Je,
    /// Jump if not equal.
    Jne,
    /// Jump if below or equal (unsigned).
    Jbe,
    /// Jump if above (unsigned).
    Ja,
    /// Jump if sign.
    Js,
    /// Jump if not sign.
    Jns,
    /// Jump if parity.
    Jp,
    /// Jump if not parity.
    Jnp,
    /// Jump if less (signed).
    Jl,
    /// Jump if greater or equal (signed).
    Jge,
    /// Jump if less or equal (signed).
    Jle,
    /// Jump if greater (signed).
    Jg,
    /// Unconditional jump. Last id of the jump range.
    Jmp,
}

impl InstId {
    /// Whether the id lies in the jump range (conditional or not).
    pub fn is_jump(self) -> bool {
        (InstId::Jo as u16..=InstId::Jmp as u16).contains(&(self as u16))
    }

    /// Whether the id is a conditional jump.
    pub fn is_jcc(self) -> bool {
        self.is_jump() && self != InstId::Jmp
    }

    /// The x86 condition code of a conditional jump (0..=15).
    pub fn cond_code(self) -> u8 {
        debug_assert!(self.is_jcc());
        (self as u16 - InstId::Jo as u16) as u8
    }
}

bitflags! {
    /// Options merged into each emitted instruction.
    ///
    /// The low bits instrument the emitters themselves (validation, sidecar
    /// operand presence); they are consumed before an instruction reaches a
    /// node or the encoder. The remaining bits travel with the instruction.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct InstOptions: u32 {
        /// Validate operands before emitting; cleared before the
        /// instruction is recorded so it does not propagate to the
        /// serialized form.
        const STRICT_VALIDATION = 0x0000_0002;
        /// The sidecar `op4` slot is populated.
        const HAS_OP4 = 0x0000_0020;
        /// The sidecar `op5` slot is populated.
        const HAS_OP5 = 0x0000_0040;
        /// The sidecar op-mask slot is populated.
        const HAS_OP_MASK = 0x0000_0080;
        /// Do not follow the jump target when building the node graph.
        const UNFOLLOW = 0x0000_0100;
        /// The destination operand is fully overwritten; liveness hint for
        /// the register allocator.
        const OVERWRITE = 0x0000_0200;
        /// Predict the branch as taken.
        const TAKEN = 0x0000_0400;
        /// Predict the branch as not taken.
        const NOT_TAKEN = 0x0000_0800;
        /// Force the short (rel8) branch form.
        const SHORT_FORM = 0x0000_1000;
        /// Force the long (rel32) branch form.
        const LONG_FORM = 0x0000_2000;
    }
}

impl InstOptions {
    /// Mask of the bits that never outlive the emit call that set them.
    pub const INTERNAL: InstOptions = InstOptions::STRICT_VALIDATION;
}

bitflags! {
    /// Global hints propagated from the holder to every attached emitter.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct Hints: u32 {
        /// Fill code alignment gaps with multi-byte NOP sequences instead
        /// of runs of `0x90`.
        const OPTIMIZED_ALIGN = 0x0000_0001;
        /// Emit branch prediction prefixes when a Jcc carries a
        /// taken/not-taken option.
        const PREDICTED_JUMPS = 0x0000_0002;
    }
}

/// Code/data alignment mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AlignMode {
    /// Align executable code; the gap is filled with NOPs.
    Code,
    /// Align data; the gap is filled with zeros.
    Data,
    /// Align with an explicit zero fill.
    Zero,
}

/// Extra operands captured by the emitter sidecar, passed to [`validate`]
/// alongside the canonical four.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExtraOps {
    /// Fifth operand (indexed from zero).
    pub op4: Operand,
    /// Sixth operand (indexed from zero).
    pub op5: Operand,
    /// Op-mask operand.
    pub op_mask: Operand,
}

/// Validate an instruction against the target architecture.
///
/// This is the ISA-side contract consumed by the strict-validation path of
/// the deferred emitters and, on request, by the direct encoder. The checks
/// are structural: operand counts and kind combinations, not sizes of every
/// immediate.
pub fn validate(
    arch: ArchType,
    inst: InstId,
    _options: InstOptions,
    _extra: &ExtraOps,
    operands: &[Operand],
    op_count: usize,
) -> CodeResult<()> {
    use Operand as Op;

    let ops = &operands[..op_count.min(operands.len())];

    // 64-bit registers are not addressable in 32-bit mode.
    if arch == ArchType::X86 {
        for op in ops {
            if let Op::Reg(r) = op {
                if r.size == 8 {
                    return Err(Error::InvalidOperand);
                }
            }
        }
    }
    let kind_ok = |op: &Operand, reg: bool, mem: bool, imm: bool, label: bool| match op {
        Op::Reg(_) => reg,
        Op::Mem(_) => mem,
        Op::Imm(_) => imm,
        Op::Label(_) => label,
        Op::None => false,
    };

    match inst {
        InstId::Nop | InstId::Ret => {
            // `ret imm16` takes one immediate; everything else must be empty.
            match (inst, ops) {
                (_, []) => Ok(()),
                (InstId::Ret, [Op::Imm(_)]) => Ok(()),
                _ => Err(Error::InvalidOperand),
            }
        }
        InstId::Mov => match ops {
            [a, b] => {
                let ok = (kind_ok(a, true, true, false, false)
                    && kind_ok(b, true, false, true, false))
                    || (kind_ok(a, true, false, false, false) && kind_ok(b, false, true, false, false));
                if ok {
                    Ok(())
                } else {
                    Err(Error::InvalidOperand)
                }
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Add | InstId::Sub | InstId::And | InstId::Or | InstId::Xor | InstId::Cmp
        | InstId::Test => match ops {
            [a, b]
                if kind_ok(a, true, true, false, false)
                    && kind_ok(b, true, false, true, false) =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Lea => match ops {
            [a, b]
                if kind_ok(a, true, false, false, false)
                    && kind_ok(b, false, true, true, true) =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        },
        InstId::Push | InstId::Pop => match ops {
            [a] if kind_ok(a, true, false, inst == InstId::Push, false) => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Inc | InstId::Dec | InstId::Neg | InstId::Not => match ops {
            [a] if kind_ok(a, true, true, false, false) => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        InstId::Call => match ops {
            [a] if kind_ok(a, true, true, true, true) => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        _ if inst.is_jump() => match ops {
            [a] if kind_ok(a, true, false, true, true) => Ok(()),
            _ => Err(Error::InvalidOperand),
        },
        _ => Err(Error::InvalidInstruction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{Label, Reg};

    #[test]
    fn jump_range_is_contiguous() {
        assert!(!InstId::Call.is_jump());
        assert!(InstId::Jo.is_jump());
        assert!(InstId::Jg.is_jump());
        assert!(InstId::Jmp.is_jump());
        assert!(InstId::Jmp.is_jump() && !InstId::Jmp.is_jcc());
        assert_eq!(InstId::Jo.cond_code(), 0x0);
        assert_eq!(InstId::Jne.cond_code(), 0x5);
        assert_eq!(InstId::Jg.cond_code(), 0xF);
    }

    #[test]
    fn validate_accepts_common_forms() {
        let r = Operand::Reg(Reg::gp64(0));
        let imm = Operand::Imm(7);
        let extra = ExtraOps::default();
        assert!(validate(ArchType::X64, InstId::Add, InstOptions::empty(), &extra, &[r, r], 2).is_ok());
        assert!(validate(ArchType::X64, InstId::Mov, InstOptions::empty(), &extra, &[r, imm], 2).is_ok());
        assert!(
            validate(ArchType::X64, InstId::Jmp, InstOptions::empty(), &extra,
                &[Operand::Label(Label::from_id(0x100))], 1)
            .is_ok()
        );
    }

    #[test]
    fn validate_rejects_bad_forms() {
        let r = Operand::Reg(Reg::gp64(0));
        let imm = Operand::Imm(7);
        let extra = ExtraOps::default();
        assert_eq!(
            validate(ArchType::X64, InstId::Add, InstOptions::empty(), &extra, &[imm, r], 2),
            Err(Error::InvalidOperand)
        );
        assert_eq!(
            validate(ArchType::X64, InstId::Ret, InstOptions::empty(), &extra, &[r], 1),
            Err(Error::InvalidOperand)
        );
    }
}
