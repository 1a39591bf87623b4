//! The direct streaming encoder.
//!
//! An `Assembler` borrows a [`CodeHolder`] for the duration of its
//! attachment and turns every write-API call straight into bytes of the
//! active section. Bytes accumulate in a pending chunk and reach the
//! section buffer on [`Assembler::sync`], on a section switch, or on
//! detach; until then `CodeHolder::code_size` reports only the flushed
//! prefix. Binding a label patches all of its pending link sites, whether
//! they live in the flushed bytes or in the pending chunk.
//!
//! Encoding covers the x86/x64 subset the rest of the library needs:
//! moves, the common ALU group, stack operations, `lea`, calls and the
//! full jump range, plus data embedding and alignment fills. References to
//! 64-bit absolute targets are recorded as `Trampoline` relocations and
//! resolved (or routed through a stub) at `relocate` time.

use log::trace;

use crate::const_pool::ConstPool;
use crate::emitter::{count_operands, Emitter, EmitterKind, EmitterState};
use crate::error::{CodeResult, Error};
use crate::holder::{
    ArchType, CodeHolder, RelocEntry, RelocKind, Section,
};
use crate::inst::{validate, AlignMode, Hints, InstId, InstOptions};
use crate::operand::{Label, Mem, Operand, Reg, INVALID_ID};

/// Multi-byte NOP sequences indexed by length - 1, used for optimized code
/// alignment.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Direct encoder writing machine code into a holder's sections.
pub struct Assembler<'a> {
    code: &'a mut CodeHolder,
    section: Section,
    /// Bytes emitted since the last flush into the section buffer.
    pending: Vec<u8>,
    state: EmitterState,
}

impl<'a> Assembler<'a> {
    /// Attach a direct encoder to `code`. Fails with
    /// [`Error::SlotAlreadyTaken`] when another one is active.
    pub fn new(code: &'a mut CodeHolder) -> CodeResult<Self> {
        if code.asm_attached {
            return Err(Error::SlotAlreadyTaken);
        }
        code.asm_attached = true;
        let mut state = EmitterState::new(EmitterKind::Assembler);
        state.hints = code.global_hints();
        state.global_options = code.global_options();
        let section = code.text_section();
        trace!("Assembler: attached");
        Ok(Self {
            code,
            section,
            pending: Vec::new(),
            state,
        })
    }

    /// The holder this encoder writes into.
    pub fn code(&self) -> &CodeHolder {
        self.code
    }

    /// The active section.
    pub fn section(&self) -> Section {
        self.section
    }

    /// Switch the active section, flushing pending bytes first.
    pub fn set_section(&mut self, section: Section) -> CodeResult<()> {
        self.code.section(section)?;
        self.flush()?;
        self.section = section;
        Ok(())
    }

    /// Current offset from the start of the active section.
    pub fn offset(&self) -> u32 {
        (self.flushed_len() + self.pending.len()) as u32
    }

    /// Flush pending bytes into the owning section so that holder-side
    /// queries see them.
    pub fn sync(&mut self) -> CodeResult<()> {
        self.flush()
    }

    fn flushed_len(&self) -> usize {
        self.code
            .section(self.section)
            .map(|s| s.buffer.data.len())
            .unwrap_or(0)
    }

    fn flush(&mut self) -> CodeResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.code.grow_buffer(self.section, self.pending.len())?;
        let entry = self.code.section_mut(self.section)?;
        entry.buffer.data.extend_from_slice(&self.pending);
        trace!(
            "Assembler: flushed {} bytes into {:?}",
            self.pending.len(),
            self.section
        );
        self.pending.clear();
        Ok(())
    }

    /// Check that `n` more bytes fit a fixed-size buffer before emitting
    /// them; growable buffers always accept.
    fn ensure(&mut self, n: usize) -> CodeResult<()> {
        let entry = self.code.section(self.section)?;
        if entry.buffer.is_fixed_size || entry.buffer.is_external {
            let capacity = entry.buffer.data.capacity();
            if self.offset() as usize + n > capacity {
                return Err(Error::CodeTooLarge);
            }
        }
        Ok(())
    }

    fn raise(&mut self, err: Error) -> Error {
        if self.code.consult_error_handler(err, "assembler") {
            return err;
        }
        if self.state.last_error.is_none() {
            self.state.last_error = Some(err);
        }
        err
    }

    fn check_ok(&self) -> CodeResult<()> {
        match self.state.last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Raw byte emission.
    // ------------------------------------------------------------------

    fn put1(&mut self, value: u8) {
        self.pending.push(value);
    }

    fn put4(&mut self, value: u32) {
        self.pending.extend_from_slice(&value.to_le_bytes());
    }

    fn put8(&mut self, value: u64) {
        self.pending.extend_from_slice(&value.to_le_bytes());
    }

    fn put_data(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Overwrite four bytes at a section offset, in the flushed region or
    /// the pending chunk.
    fn patch4(&mut self, offset: u32, value: u32) -> CodeResult<()> {
        let flushed = self.flushed_len();
        let at = offset as usize;
        let bytes = value.to_le_bytes();
        if at + 4 <= flushed {
            let entry = self.code.section_mut(self.section)?;
            entry.buffer.data[at..at + 4].copy_from_slice(&bytes);
        } else if at >= flushed {
            let at = at - flushed;
            self.pending[at..at + 4].copy_from_slice(&bytes);
        } else {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruction encoding helpers.
    // ------------------------------------------------------------------

    fn is_x64(&self) -> bool {
        self.code.code_info().arch == ArchType::X64
    }

    fn check_reg(&self, r: Reg) -> CodeResult<Reg> {
        if r.is_virt() {
            return Err(Error::InvalidVirtId);
        }
        if r.id >= self.code.code_info().gp_count() as u32 {
            return Err(Error::InvalidOperand);
        }
        if !self.is_x64() && r.size == 8 {
            return Err(Error::InvalidOperand);
        }
        if r.size != 4 && r.size != 8 {
            return Err(Error::InvalidOperand);
        }
        Ok(r)
    }

    /// Emit REX as required by the operand combination (x64 only).
    fn put_rex(&mut self, w: bool, r_ext: bool, x_ext: bool, b_ext: bool) {
        if self.is_x64() && (w || r_ext || x_ext || b_ext) {
            self.put1(
                0x40 | ((w as u8) << 3) | ((r_ext as u8) << 2) | ((x_ext as u8) << 1)
                    | (b_ext as u8),
            );
        }
    }

    fn put_modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.put1((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// `opcode reg, rm` with both operands in registers (mod = 11).
    fn emit_rr(&mut self, opcode: u8, reg: Reg, rm: Reg) -> CodeResult<()> {
        let reg = self.check_reg(reg)?;
        let rm = self.check_reg(rm)?;
        self.put_rex(rm.size == 8, reg.needs_rex_ext(), false, rm.needs_rex_ext());
        self.put1(opcode);
        self.put_modrm(0b11, reg.low_bits(), rm.low_bits());
        Ok(())
    }

    /// `opcode /ext rm` with an opcode extension in the reg field.
    fn emit_ext_r(&mut self, opcode: u8, ext: u8, rm: Reg) -> CodeResult<()> {
        let rm = self.check_reg(rm)?;
        self.put_rex(rm.size == 8, false, false, rm.needs_rex_ext());
        self.put1(opcode);
        self.put_modrm(0b11, ext, rm.low_bits());
        Ok(())
    }

    /// `opcode reg, [mem]`; `reg` may also be an opcode extension passed as
    /// a physical register id below 8.
    fn emit_rm(&mut self, opcode: u8, reg_field: u8, reg_ext: bool, size: u8, mem: Mem) -> CodeResult<()> {
        let base = if mem.has_base() {
            let r = Reg::gp(mem.base, 8);
            if r.is_virt() {
                return Err(Error::InvalidVirtId);
            }
            Some(r)
        } else {
            None
        };
        let index = if mem.has_index() {
            let r = Reg::gp(mem.index, 8);
            if r.is_virt() {
                return Err(Error::InvalidVirtId);
            }
            if r.low_bits() == 4 && !r.needs_rex_ext() {
                // rsp cannot be an index.
                return Err(Error::InvalidOperand);
            }
            Some(r)
        } else {
            None
        };

        self.put_rex(
            size == 8,
            reg_ext,
            index.map_or(false, Reg::needs_rex_ext),
            base.map_or(false, Reg::needs_rex_ext),
        );
        self.put1(opcode);

        match (base, index) {
            (Some(b), None) if b.low_bits() != 4 => {
                // Plain base; rbp/r13 need an explicit displacement.
                let mode = disp_mode(mem.disp, b.low_bits() == 5);
                self.put_modrm(mode, reg_field, b.low_bits());
                self.put_disp(mode, mem.disp);
            }
            (Some(b), maybe_index) => {
                // SIB form, also taken for rsp/r12 bases.
                let mode = disp_mode(mem.disp, b.low_bits() == 5);
                self.put_modrm(mode, reg_field, 0b100);
                let index_bits = maybe_index.map_or(0b100, Reg::low_bits);
                self.put1((mem.shift << 6) | (index_bits << 3) | b.low_bits());
                self.put_disp(mode, mem.disp);
            }
            (None, Some(i)) => {
                // Index without base: SIB with base = 101 and disp32.
                self.put_modrm(0b00, reg_field, 0b100);
                self.put1((mem.shift << 6) | (i.low_bits() << 3) | 0b101);
                self.put4(mem.disp as u32);
            }
            (None, None) => {
                if self.is_x64() {
                    // Absolute addressing without RIP: SIB, base 101.
                    self.put_modrm(0b00, reg_field, 0b100);
                    self.put1(0x25);
                    self.put4(mem.disp as u32);
                } else {
                    self.put_modrm(0b00, reg_field, 0b101);
                    self.put4(mem.disp as u32);
                }
            }
        }
        Ok(())
    }

    fn put_disp(&mut self, mode: u8, disp: i32) {
        match mode {
            0b01 => self.put1(disp as u8),
            0b10 => self.put4(disp as u32),
            _ => {}
        }
    }

    /// Emit the rel32 field of a label reference: patched immediately for
    /// a bound label, linked for later patching otherwise.
    fn put_label_rel32(&mut self, label: Label) -> CodeResult<()> {
        if !self.code.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        let site = self.offset();
        match self.code.label_offset(label) {
            Some(target) => {
                let rel = target as i64 - (site as i64 + 4);
                let rel = i32::try_from(rel).map_err(|_| Error::DisplacementOverflow)?;
                self.put4(rel as u32);
            }
            None => {
                self.put4(0);
                self.code.new_label_link(label, site, 0, INVALID_ID)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruction dispatch.
    // ------------------------------------------------------------------

    fn encode(
        &mut self,
        inst: InstId,
        o0: Operand,
        o1: Operand,
        options: InstOptions,
    ) -> CodeResult<()> {
        use Operand as Op;
        match inst {
            InstId::Nop => {
                self.put1(0x90);
                Ok(())
            }
            InstId::Ret => match o0 {
                Op::None => {
                    self.put1(0xC3);
                    Ok(())
                }
                Op::Imm(n) => {
                    let n = u16::try_from(n).map_err(|_| Error::InvalidOperand)?;
                    self.put1(0xC2);
                    self.put_data(&n.to_le_bytes());
                    Ok(())
                }
                _ => Err(Error::InvalidOperand),
            },
            InstId::Mov => self.encode_mov(o0, o1),
            InstId::Add => self.encode_alu(0x01, 0, o0, o1),
            InstId::Or => self.encode_alu(0x09, 1, o0, o1),
            InstId::And => self.encode_alu(0x21, 4, o0, o1),
            InstId::Sub => self.encode_alu(0x29, 5, o0, o1),
            InstId::Xor => self.encode_alu(0x31, 6, o0, o1),
            InstId::Cmp => self.encode_alu(0x39, 7, o0, o1),
            InstId::Test => match (o0, o1) {
                (Op::Reg(a), Op::Reg(b)) => self.emit_rr(0x85, b, a),
                (Op::Reg(a), Op::Imm(imm)) => {
                    let imm = i32::try_from(imm).map_err(|_| Error::InvalidOperand)?;
                    self.emit_ext_r(0xF7, 0, a)?;
                    self.put4(imm as u32);
                    Ok(())
                }
                _ => Err(Error::InvalidOperand),
            },
            InstId::Lea => self.encode_lea(o0, o1),
            InstId::Push => match o0 {
                Op::Reg(r) => {
                    let r = self.check_reg_any_size(r)?;
                    self.put_rex(false, false, false, r.needs_rex_ext());
                    self.put1(0x50 + r.low_bits());
                    Ok(())
                }
                Op::Imm(n) => {
                    let n = i32::try_from(n).map_err(|_| Error::InvalidOperand)?;
                    self.put1(0x68);
                    self.put4(n as u32);
                    Ok(())
                }
                _ => Err(Error::InvalidOperand),
            },
            InstId::Pop => match o0 {
                Op::Reg(r) => {
                    let r = self.check_reg_any_size(r)?;
                    self.put_rex(false, false, false, r.needs_rex_ext());
                    self.put1(0x58 + r.low_bits());
                    Ok(())
                }
                _ => Err(Error::InvalidOperand),
            },
            InstId::Inc => self.encode_unary(0xFF, 0, o0),
            InstId::Dec => self.encode_unary(0xFF, 1, o0),
            InstId::Not => self.encode_unary(0xF7, 2, o0),
            InstId::Neg => self.encode_unary(0xF7, 3, o0),
            InstId::Call => self.encode_call(o0),
            _ if inst.is_jump() => self.encode_jump(inst, o0, options),
            _ => Err(Error::InvalidInstruction),
        }
    }

    /// Stack operations take the operand-size-agnostic forms; accept any
    /// GP size but reject virtual ids.
    fn check_reg_any_size(&self, r: Reg) -> CodeResult<Reg> {
        if r.is_virt() {
            return Err(Error::InvalidVirtId);
        }
        if r.id >= self.code.code_info().gp_count() as u32 {
            return Err(Error::InvalidOperand);
        }
        Ok(r)
    }

    fn encode_mov(&mut self, o0: Operand, o1: Operand) -> CodeResult<()> {
        use Operand as Op;
        match (o0, o1) {
            (Op::Reg(dst), Op::Reg(src)) => self.emit_rr(0x89, src, dst),
            (Op::Reg(dst), Op::Imm(imm)) => {
                let dst = self.check_reg(dst)?;
                if dst.size == 8 {
                    if let Ok(imm32) = i32::try_from(imm) {
                        self.put_rex(true, false, false, dst.needs_rex_ext());
                        self.put1(0xC7);
                        self.put_modrm(0b11, 0, dst.low_bits());
                        self.put4(imm32 as u32);
                    } else {
                        self.put_rex(true, false, false, dst.needs_rex_ext());
                        self.put1(0xB8 + dst.low_bits());
                        self.put8(imm as u64);
                    }
                } else {
                    // Accept both signed and unsigned 32-bit immediates.
                    let imm32 = u32::try_from(imm)
                        .or_else(|_| i32::try_from(imm).map(|v| v as u32))
                        .map_err(|_| Error::InvalidOperand)?;
                    self.put_rex(false, false, false, dst.needs_rex_ext());
                    self.put1(0xB8 + dst.low_bits());
                    self.put4(imm32);
                }
                Ok(())
            }
            (Op::Reg(dst), Op::Mem(mem)) => {
                let dst = self.check_reg(dst)?;
                self.emit_rm(0x8B, dst.low_bits(), dst.needs_rex_ext(), dst.size, mem)
            }
            (Op::Mem(mem), Op::Reg(src)) => {
                let src = self.check_reg(src)?;
                self.emit_rm(0x89, src.low_bits(), src.needs_rex_ext(), src.size, mem)
            }
            _ => Err(Error::InvalidOperand),
        }
    }

    fn encode_alu(&mut self, opcode_mr: u8, imm_ext: u8, o0: Operand, o1: Operand) -> CodeResult<()> {
        use Operand as Op;
        match (o0, o1) {
            (Op::Reg(dst), Op::Reg(src)) => self.emit_rr(opcode_mr, src, dst),
            (Op::Reg(dst), Op::Imm(imm)) => {
                let imm = i32::try_from(imm).map_err(|_| Error::InvalidOperand)?;
                self.emit_ext_r(0x81, imm_ext, dst)?;
                self.put4(imm as u32);
                Ok(())
            }
            (Op::Mem(mem), Op::Reg(src)) => {
                let src = self.check_reg(src)?;
                self.emit_rm(opcode_mr, src.low_bits(), src.needs_rex_ext(), src.size, mem)
            }
            _ => Err(Error::InvalidOperand),
        }
    }

    fn encode_unary(&mut self, opcode: u8, ext: u8, o0: Operand) -> CodeResult<()> {
        match o0 {
            Operand::Reg(r) => self.emit_ext_r(opcode, ext, r),
            Operand::Mem(mem) => self.emit_rm(opcode, ext, false, mem.size.max(4), mem),
            _ => Err(Error::InvalidOperand),
        }
    }

    fn encode_lea(&mut self, o0: Operand, o1: Operand) -> CodeResult<()> {
        use Operand as Op;
        let dst = match o0 {
            Op::Reg(r) => self.check_reg(r)?,
            _ => return Err(Error::InvalidOperand),
        };
        match o1 {
            Op::Mem(mem) => {
                self.emit_rm(0x8D, dst.low_bits(), dst.needs_rex_ext(), dst.size, mem)
            }
            Op::Label(label) => {
                if !self.code.is_label_valid(label) {
                    return Err(Error::InvalidLabel);
                }
                // RIP-relative form; the disp32 is resolved like a branch.
                self.put_rex(dst.size == 8, dst.needs_rex_ext(), false, false);
                self.put1(0x8D);
                self.put_modrm(0b00, dst.low_bits(), 0b101);
                self.put_label_rel32(label)
            }
            Op::Imm(target) => {
                // Absolute target through a RIP-relative encoding, patched
                // at relocate time. x64 only.
                if !self.is_x64() {
                    return Err(Error::InvalidOperand);
                }
                self.put_rex(dst.size == 8, dst.needs_rex_ext(), false, false);
                self.put1(0x8D);
                self.put_modrm(0b00, dst.low_bits(), 0b101);
                let from = self.offset() as u64;
                self.code.add_reloc(RelocEntry {
                    kind: RelocKind::AbsToRel,
                    size: 4,
                    from,
                    data: target as u64,
                });
                self.put4(0);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        }
    }

    fn encode_call(&mut self, o0: Operand) -> CodeResult<()> {
        use Operand as Op;
        match o0 {
            Op::Label(label) => {
                self.put1(0xE8);
                self.put_label_rel32(label)
            }
            Op::Reg(r) => {
                let r = self.check_reg_any_size(r)?;
                self.put_rex(false, false, false, r.needs_rex_ext());
                self.put1(0xFF);
                self.put_modrm(0b11, 2, r.low_bits());
                Ok(())
            }
            Op::Imm(target) => {
                // Absolute call: rel32 resolved at relocate, trampolined
                // when out of range.
                self.put1(0xE8);
                let from = self.offset() as u64;
                self.code.add_reloc(RelocEntry {
                    kind: RelocKind::Trampoline,
                    size: 4,
                    from,
                    data: target as u64,
                });
                self.put4(0);
                Ok(())
            }
            Op::Mem(mem) => self.emit_rm(0xFF, 2, false, 4, mem),
            _ => Err(Error::InvalidOperand),
        }
    }

    fn encode_jump(&mut self, inst: InstId, o0: Operand, options: InstOptions) -> CodeResult<()> {
        use Operand as Op;

        // Branch prediction prefixes are opt-in via the holder hints.
        if inst.is_jcc() && self.state.hints.contains(Hints::PREDICTED_JUMPS) {
            if options.contains(InstOptions::TAKEN) {
                self.put1(0x3E);
            } else if options.contains(InstOptions::NOT_TAKEN) {
                self.put1(0x2E);
            }
        }

        match o0 {
            Op::Label(label) => {
                if !self.code.is_label_valid(label) {
                    return Err(Error::InvalidLabel);
                }
                let bound = self.code.label_offset(label);
                let short_len: i64 = 2;
                let use_short = match bound {
                    Some(target) if !options.contains(InstOptions::LONG_FORM) => {
                        let rel = target as i64 - (self.offset() as i64 + short_len);
                        i8::try_from(rel).is_ok()
                    }
                    _ => false,
                };
                if use_short {
                    let target = bound.unwrap_or_default();
                    let rel = target as i64 - (self.offset() as i64 + short_len);
                    if inst == InstId::Jmp {
                        self.put1(0xEB);
                    } else {
                        self.put1(0x70 + inst.cond_code());
                    }
                    self.put1(rel as i8 as u8);
                } else {
                    if inst == InstId::Jmp {
                        self.put1(0xE9);
                    } else {
                        self.put1(0x0F);
                        self.put1(0x80 + inst.cond_code());
                    }
                    self.put_label_rel32(label)?;
                }
                Ok(())
            }
            Op::Reg(r) if inst == InstId::Jmp => {
                let r = self.check_reg_any_size(r)?;
                self.put_rex(false, false, false, r.needs_rex_ext());
                self.put1(0xFF);
                self.put_modrm(0b11, 4, r.low_bits());
                Ok(())
            }
            Op::Imm(target) if inst == InstId::Jmp => {
                self.put1(0xE9);
                let from = self.offset() as u64;
                self.code.add_reloc(RelocEntry {
                    kind: RelocKind::Trampoline,
                    size: 4,
                    from,
                    data: target as u64,
                });
                self.put4(0);
                Ok(())
            }
            _ => Err(Error::InvalidOperand),
        }
    }
}

impl Emitter for Assembler<'_> {
    fn state(&self) -> &EmitterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        &mut self.state
    }

    fn _emit(
        &mut self,
        inst: InstId,
        o0: Operand,
        o1: Operand,
        o2: Operand,
        o3: Operand,
    ) -> CodeResult<()> {
        self.check_ok()?;
        let sidecar = self.state.take_sidecar();
        let op_count = count_operands(sidecar.options, &o0, &o1, &o2, &o3);

        if sidecar.options.contains(InstOptions::STRICT_VALIDATION) {
            let operands = [o0, o1, o2, o3, sidecar.extra.op4, sidecar.extra.op5];
            if let Err(err) = validate(
                self.code.code_info().arch,
                inst,
                sidecar.options,
                &sidecar.extra,
                &operands,
                op_count,
            ) {
                return Err(self.raise(err));
            }
        }

        if op_count > 2 {
            return Err(self.raise(Error::InvalidOperand));
        }

        let start = self.pending.len();
        match self.encode(inst, o0, o1, sidecar.options).and_then(|()| self.ensure(0)) {
            Ok(()) => {
                if let Some(comment) = sidecar.comment {
                    trace!("Assembler: {:?} ; {}", inst, comment);
                } else {
                    trace!("Assembler: {:?} at offset {}", inst, self.offset());
                }
                Ok(())
            }
            Err(err) => {
                self.pending.truncate(start);
                Err(self.raise(err))
            }
        }
    }

    fn new_label(&mut self) -> Label {
        if self.state.last_error.is_some() {
            return Label::invalid();
        }
        match self.code.new_label_id() {
            Ok(label) => label,
            Err(err) => {
                self.raise(err);
                Label::invalid()
            }
        }
    }

    fn bind(&mut self, label: Label) -> CodeResult<()> {
        self.check_ok()?;
        if !self.code.is_label_valid(label) {
            return Err(self.raise(Error::InvalidLabel));
        }
        if self.code.is_label_bound(label) {
            return Err(self.raise(Error::LabelAlreadyBound));
        }
        let offset = self.offset();
        trace!("Assembler: bind {:?} at offset {}", label, offset);

        // Consume the pending link chain, returning each record to the
        // holder's free list.
        let mut link = self
            .code
            .label_entry(label)
            .and_then(|e| e.links.expand());
        while let Some(l) = link {
            let record = self.code.link(l);
            let next = record.prev.expand();
            let site = record.offset;
            let displacement = record.displacement;
            let reloc_id = record.reloc_id;
            if reloc_id != INVALID_ID {
                if let Some(re) = self.code.reloc_mut(reloc_id) {
                    re.data = (offset as i64 + displacement as i64) as u64;
                }
            } else {
                let rel = offset as i64 - (site as i64 + 4) + displacement as i64;
                let rel = i32::try_from(rel).map_err(|_| self.raise(Error::DisplacementOverflow))?;
                self.patch4(site, rel as u32)?;
            }
            self.code.release_link(l);
            link = next;
        }

        let entry = self
            .code
            .label_entry_mut(label)
            .ok_or(Error::InvalidLabel)?;
        entry.offset = offset;
        entry.links = None.into();
        Ok(())
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> CodeResult<()> {
        self.check_ok()?;
        if alignment <= 1 {
            return Ok(());
        }
        if !alignment.is_power_of_two() {
            return Err(self.raise(Error::InvalidOperand));
        }
        let offset = self.offset();
        let mut gap = (alignment - (offset & (alignment - 1))) & (alignment - 1);
        if gap == 0 {
            return Ok(());
        }
        if let Err(err) = self.ensure(gap as usize) {
            return Err(self.raise(err));
        }
        trace!("Assembler: align to {} ({} bytes)", alignment, gap);
        match mode {
            AlignMode::Code => {
                if self.state.hints.contains(Hints::OPTIMIZED_ALIGN) {
                    while gap > 0 {
                        let n = gap.min(NOPS.len() as u32) as usize;
                        self.put_data(NOPS[n - 1]);
                        gap -= n as u32;
                    }
                } else {
                    for _ in 0..gap {
                        self.put1(0x90);
                    }
                }
            }
            AlignMode::Data | AlignMode::Zero => {
                for _ in 0..gap {
                    self.put1(0);
                }
            }
        }
        Ok(())
    }

    fn embed(&mut self, data: &[u8]) -> CodeResult<()> {
        self.check_ok()?;
        if let Err(err) = self.ensure(data.len()) {
            return Err(self.raise(err));
        }
        trace!("Assembler: embed {} bytes", data.len());
        self.put_data(data);
        Ok(())
    }

    fn embed_label(&mut self, label: Label) -> CodeResult<()> {
        self.check_ok()?;
        if !self.code.is_label_valid(label) {
            return Err(self.raise(Error::InvalidLabel));
        }
        let size = self.code.code_info().gp_size();
        if let Err(err) = self.ensure(size as usize) {
            return Err(self.raise(err));
        }
        let from = self.offset() as u64;
        let reloc_id = self.code.add_reloc(RelocEntry {
            kind: RelocKind::AbsToAbs,
            size,
            from,
            data: self.code.label_offset(label).unwrap_or(0) as u64,
        });
        if !self.code.is_label_bound(label) {
            let site = self.offset();
            self.code.new_label_link(label, site, 0, reloc_id)?;
        }
        for _ in 0..size {
            self.put1(0);
        }
        Ok(())
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> CodeResult<()> {
        self.check_ok()?;
        if !self.code.is_label_valid(label) {
            return Err(self.raise(Error::InvalidLabel));
        }
        self.align(AlignMode::Data, pool.alignment())?;
        self.bind(label)?;
        let mut bytes = vec![0u8; pool.size()];
        pool.fill(&mut bytes);
        self.embed(&bytes)
    }

    fn comment(&mut self, text: &str) -> CodeResult<()> {
        self.check_ok()?;
        trace!("Assembler: ; {}", text);
        Ok(())
    }

    fn finalize(&mut self) -> CodeResult<()> {
        self.check_ok()?;
        self.flush()
    }
}

impl Drop for Assembler<'_> {
    fn drop(&mut self) {
        // Detach: flush what we can and release the direct-encoder slot.
        let _ = self.flush();
        self.code.asm_attached = false;
        trace!("Assembler: detached");
    }
}

/// Choose a ModRM addressing mode for a displacement; rbp/r13 bases force
/// at least a disp8 because their mod=00 encoding means something else.
fn disp_mode(disp: i32, base_is_bp: bool) -> u8 {
    if disp == 0 && !base_is_bp {
        0b00
    } else if i8::try_from(disp).is_ok() {
        0b01
    } else {
        0b10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::CodeInfo;

    fn new_holder() -> CodeHolder {
        CodeHolder::new(CodeInfo::new(ArchType::X64))
    }

    fn bytes(code: &CodeHolder) -> Vec<u8> {
        code.section(code.text_section()).unwrap().buffer.data.clone()
    }

    fn rax() -> Reg {
        Reg::gp64(0)
    }
    fn rcx() -> Reg {
        Reg::gp64(1)
    }
    fn rbx() -> Reg {
        Reg::gp64(3)
    }

    #[test]
    fn encodes_common_instructions() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            a.emit2(InstId::Mov, rax(), rbx()).unwrap();
            a.emit2(InstId::Add, rax(), rcx()).unwrap();
            a.emit2(InstId::Xor, Reg::gp32(0), Reg::gp32(0)).unwrap();
            a.emit2(InstId::Mov, rax(), 42i64).unwrap();
            a.emit0(InstId::Ret).unwrap();
        }
        assert_eq!(
            bytes(&code),
            vec![
                0x48, 0x89, 0xD8, // mov rax, rbx
                0x48, 0x01, 0xC8, // add rax, rcx
                0x31, 0xC0, // xor eax, eax
                0x48, 0xC7, 0xC0, 42, 0, 0, 0, // mov rax, 42
                0xC3, // ret
            ]
        );
    }

    #[test]
    fn encodes_memory_operands() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            let rbp = Reg::gp64(5);
            let rsp = Reg::gp64(4);
            a.emit2(InstId::Mov, rax(), Mem::base_disp(rbp, -8)).unwrap();
            a.emit2(InstId::Mov, Mem::base_disp(rsp, 8), rax()).unwrap();
        }
        assert_eq!(
            bytes(&code),
            vec![
                0x48, 0x8B, 0x45, 0xF8, // mov rax, [rbp-8]
                0x48, 0x89, 0x44, 0x24, 0x08, // mov [rsp+8], rax
            ]
        );
    }

    #[test]
    fn forward_branch_is_patched_at_bind() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            let l = a.new_label();
            a.emit1(InstId::Jmp, l).unwrap();
            a.emit0(InstId::Nop).unwrap();
            a.bind(l).unwrap();
            a.emit0(InstId::Ret).unwrap();
        }
        // jmp rel32 (5 bytes) + nop; the label binds at offset 6.
        assert_eq!(
            bytes(&code),
            vec![0xE9, 0x01, 0, 0, 0, 0x90, 0xC3]
        );
    }

    #[test]
    fn backward_branch_uses_short_form() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            let l = a.new_label();
            a.bind(l).unwrap();
            a.emit0(InstId::Nop).unwrap();
            a.emit1(InstId::Jmp, l).unwrap();
        }
        assert_eq!(bytes(&code), vec![0x90, 0xEB, 0xFD]);
    }

    #[test]
    fn conditional_branches_encode_their_condition() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            let l = a.new_label();
            a.emit1(InstId::Je, l).unwrap();
            a.emit1(InstId::Jne, l).unwrap();
            a.bind(l).unwrap();
        }
        let data = bytes(&code);
        assert_eq!(&data[0..2], &[0x0F, 0x84]);
        assert_eq!(&data[6..8], &[0x0F, 0x85]);
        // First site patches to 6, second to 0.
        assert_eq!(&data[2..6], &6i32.to_le_bytes());
        assert_eq!(&data[8..12], &0i32.to_le_bytes());
    }

    #[test]
    fn binding_twice_is_an_error() {
        let mut code = new_holder();
        let mut a = Assembler::new(&mut code).unwrap();
        let l = a.new_label();
        a.bind(l).unwrap();
        assert_eq!(a.bind(l), Err(Error::LabelAlreadyBound));
        // The error latches: even an otherwise-fine call is refused.
        assert_eq!(a.emit0(InstId::Nop), Err(Error::LabelAlreadyBound));
        a.state_mut().reset_last_error();
        assert!(a.emit0(InstId::Nop).is_ok());
    }

    #[test]
    fn only_one_direct_encoder_at_a_time() {
        let mut code = new_holder();
        // Simulate the transient-assembler path: the slot is taken.
        code.asm_attached = true;
        assert!(matches!(Assembler::new(&mut code), Err(Error::SlotAlreadyTaken)));
        code.asm_attached = false;
        assert!(Assembler::new(&mut code).is_ok());
    }

    #[test]
    fn optimized_align_uses_multibyte_nops() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            a.emit0(InstId::Nop).unwrap();
            a.align(AlignMode::Code, 8).unwrap();
            assert_eq!(a.offset(), 8);
        }
        let data = bytes(&code);
        // One 7-byte NOP, not seven 0x90s.
        assert_eq!(&data[1..], &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn sync_makes_bytes_visible_mid_stream() {
        let mut code = new_holder();
        let mut a = Assembler::new(&mut code).unwrap();
        a.emit0(InstId::Nop).unwrap();
        assert_eq!(a.code().section(a.section()).unwrap().buffer.data.len(), 0);
        a.sync().unwrap();
        assert_eq!(a.code().section(a.section()).unwrap().buffer.data.len(), 1);
    }

    #[test]
    fn embed_label_records_a_relocation() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            let l = a.new_label();
            a.embed_label(l).unwrap();
            a.bind(l).unwrap();
        }
        assert_eq!(code.relocs().len(), 1);
        let re = code.relocs()[0];
        assert_eq!(re.kind, RelocKind::AbsToAbs);
        assert_eq!(re.size, 8);
        assert_eq!(re.from, 0);
        assert_eq!(re.data, 8, "bind must complete the relocation");

        let mut out = vec![0u8; code.code_size()];
        code.relocate(&mut out, 0x4000).unwrap();
        assert_eq!(&out[..8], &0x4008u64.to_le_bytes());
    }

    #[test]
    fn absolute_jump_round_trips_through_trampoline() {
        let mut code = new_holder();
        {
            let mut a = Assembler::new(&mut code).unwrap();
            a.emit1(InstId::Jmp, 0x7FFF_FFFF_F000u64).unwrap();
        }
        let mut out = vec![0u8; code.code_size()];
        let used = code.relocate(&mut out, 0x1000).unwrap();
        assert_eq!(used, 5 + 14);
        assert_eq!(out[0], 0xE9);
        assert_eq!(&out[5..7], &[0xFF, 0x25]);
    }
}
