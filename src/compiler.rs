//! The compiling emitter: a node-list builder that additionally records
//! virtual registers and function boundaries, then runs a register
//! allocation pass before serializing into the direct encoder.
//!
//! Virtual registers share the packed-id space with labels; a `Reg` whose
//! id lies in the packed range names an entry of the compiler's virtual
//! register table. Function structure is expressed in the node list itself:
//! `add_func` appends the function node, its exit label and its end
//! sentinel, then parks the cursor on the function node so the body is
//! emitted between the function node and the exit label.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use log::trace;
use smallvec::SmallVec;

use crate::assembler::Assembler;
use crate::builder::{
    align_impl, bind_impl, check_ok, comment_impl, embed_const_pool_impl, embed_impl,
    embed_label_impl, emit_impl, new_label_impl, raise_on, ConstPoolData, InstData, LabelData,
    Node, NodeFlags, NodeKind, NodeList, OperandArray,
};
use crate::const_pool::ConstPool;
use crate::emitter::{Emitter, EmitterKind, EmitterState};
use crate::error::{CodeResult, Error};
use crate::holder::{CallConv, CodeHolder};
use crate::inst::{AlignMode, InstId};
use crate::operand::{pack_id, unpack_id, Label, Operand, Reg, RegKind};
use crate::regalloc;
use crate::zone::{Zone, ZoneStr};

/// An opaque reference to a virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct VirtReg(u32);
entity_impl!(VirtReg, "v");

/// Description of one virtual register.
#[derive(Debug)]
pub struct VirtRegData {
    /// Register class.
    pub kind: RegKind,
    /// Value size in bytes.
    pub size: u8,
    /// Optional debug name, duplicated into the data zone.
    pub name: Option<ZoneStr>,
}

/// Value types accepted by function signatures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
}

impl ValueType {
    /// Size of the value in bytes.
    pub fn size(self) -> u8 {
        match self {
            ValueType::I32 => 4,
            ValueType::I64 => 8,
        }
    }
}

/// A function signature: calling convention, return type, argument types.
#[derive(Clone, Debug)]
pub struct FuncSignature {
    /// Calling convention.
    pub call_conv: CallConv,
    /// Return type, if the function returns a value.
    pub ret: Option<ValueType>,
    /// Argument types.
    pub args: SmallVec<[ValueType; 6]>,
}

impl FuncSignature {
    /// Start a signature for `call_conv`.
    pub fn new(call_conv: CallConv) -> Self {
        Self {
            call_conv,
            ret: None,
            args: SmallVec::new(),
        }
    }

    /// Set the return type.
    pub fn returns(mut self, ty: ValueType) -> Self {
        self.ret = Some(ty);
        self
    }

    /// Append an argument.
    pub fn arg(mut self, ty: ValueType) -> Self {
        self.args.push(ty);
        self
    }

    /// Number of arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

/// Function details derived from a signature at node creation time.
#[derive(Clone, Debug)]
pub struct FuncDetail {
    /// Calling convention.
    pub call_conv: CallConv,
    /// Return type.
    pub ret: Option<ValueType>,
    /// Argument types.
    pub args: SmallVec<[ValueType; 6]>,
    /// Stack alignment the function must maintain; the holder's natural
    /// alignment overrides the convention's.
    pub stack_alignment: u8,
}

impl FuncDetail {
    fn from_signature(sign: &FuncSignature, stack_alignment: u8) -> Self {
        Self {
            call_conv: sign.call_conv,
            ret: sign.ret,
            args: sign.args.clone(),
            stack_alignment,
        }
    }
}

/// Payload of a function node. The node is also a label bind point for the
/// function entry.
pub struct FuncData {
    /// Entry label data.
    pub label: LabelData,
    /// Details derived from the signature.
    pub detail: FuncDetail,
    /// The function's exit label node.
    pub exit: PackedOption<Node>,
    /// The function's end sentinel node.
    pub end: PackedOption<Node>,
    /// Argument slots, filled by `set_arg`.
    pub args: SmallVec<[PackedOption<VirtReg>; 6]>,
    /// Set by `end_func`.
    pub is_finished: bool,
}

/// Payload of a function-return node.
#[derive(Debug)]
pub struct RetData {
    /// Up to two return value operands.
    pub ops: [Operand; 2],
}

/// Payload of a call-site node: the call instruction (target operand first,
/// then one slot per argument) plus signature details and return bindings.
pub struct CallData {
    /// The underlying call instruction.
    pub inst: InstData,
    /// Details derived from the signature.
    pub detail: FuncDetail,
    /// Up to two return value bindings, filled by `set_call_ret`.
    pub rets: [Operand; 2],
}

/// Where a compiler-managed constant lands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstScope {
    /// The pool flushed at the end of the current function.
    Local,
    /// The pool flushed at finalization.
    Global,
}

/// Deferred emitter with virtual registers and register allocation.
pub struct Compiler<'a> {
    pub(crate) code: &'a mut CodeHolder,
    pub(crate) state: EmitterState,
    pub(crate) list: NodeList,
    pub(crate) virt_regs: PrimaryMap<VirtReg, VirtRegData>,
    /// The currently open function node.
    func: PackedOption<Node>,
    local_pool: PackedOption<Node>,
    global_pool: PackedOption<Node>,
    finalized: bool,
}

impl<'a> Compiler<'a> {
    /// Attach a compiler to `code`.
    pub fn new(code: &'a mut CodeHolder) -> Self {
        let mut state = EmitterState::new(EmitterKind::Compiler);
        state.hints = code.global_hints();
        state.global_options = code.global_options();
        trace!("Compiler: attached");
        Self {
            code,
            state,
            list: NodeList::new(),
            virt_regs: PrimaryMap::new(),
            func: None.into(),
            local_pool: None.into(),
            global_pool: None.into(),
            finalized: false,
        }
    }

    /// The holder this compiler is attached to.
    pub fn code(&self) -> &CodeHolder {
        self.code
    }

    /// The node list.
    pub fn list(&self) -> &NodeList {
        &self.list
    }

    /// The node list, mutably.
    pub fn list_mut(&mut self) -> &mut NodeList {
        &mut self.list
    }

    /// The currently open function node, if any.
    pub fn func(&self) -> Option<Node> {
        self.func.expand()
    }

    // ------------------------------------------------------------------
    // Virtual registers.
    // ------------------------------------------------------------------

    /// Create a new virtual general-purpose register of `size` bytes.
    pub fn new_gp(&mut self, size: u8) -> Reg {
        let index = self.virt_regs.len() as u32;
        self.virt_regs.push(VirtRegData {
            kind: RegKind::Gp,
            size,
            name: None,
        });
        Reg {
            kind: RegKind::Gp,
            size,
            id: pack_id(index),
        }
    }

    /// Create a new 32-bit virtual register.
    pub fn new_gp32(&mut self) -> Reg {
        self.new_gp(4)
    }

    /// Create a new 64-bit virtual register.
    pub fn new_gp64(&mut self) -> Reg {
        self.new_gp(8)
    }

    /// Create a named virtual register; the name shows up in traces.
    pub fn new_named_gp(&mut self, size: u8, name: &str) -> Reg {
        let reg = self.new_gp(size);
        let stored = self.list.data_zone.dup_str(name);
        let index = VirtReg::from_u32(unpack_id(reg.id));
        self.virt_regs[index].name = stored;
        reg
    }

    /// Whether `reg` names a virtual register of this compiler.
    pub fn is_virt_reg_valid(&self, reg: Reg) -> bool {
        reg.is_virt() && (unpack_id(reg.id) as usize) < self.virt_regs.len()
    }

    /// Look up the data of a virtual register operand.
    pub fn virt_reg(&self, reg: Reg) -> Option<&VirtRegData> {
        if !reg.is_virt() {
            return None;
        }
        self.virt_regs.get(VirtReg::from_u32(unpack_id(reg.id)))
    }

    // ------------------------------------------------------------------
    // Functions.
    // ------------------------------------------------------------------

    /// Create a function node (with its exit label and end sentinel)
    /// without adding it to the list.
    pub fn new_func(&mut self, sign: &FuncSignature) -> CodeResult<Node> {
        let detail =
            FuncDetail::from_signature(sign, self.code.code_info().stack_alignment);
        let mut args = SmallVec::new();
        args.resize(sign.arg_count(), None.into());

        let func = match self.list.alloc_node(NodeKind::Func(FuncData {
            label: LabelData {
                label: Label::invalid(),
                from: None.into(),
                num_refs: 0,
            },
            detail,
            exit: None.into(),
            end: None.into(),
            args,
            is_finished: false,
        })) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(&mut self.state, self.code, err)),
        };
        if let Err(err) = self.list.register_label_node(self.code, func) {
            return Err(raise_on(&mut self.state, self.code, err));
        }

        let exit = new_label_impl(&mut self.list, &mut self.state, self.code);
        let exit_node = match self.list.get_label_node(self.code, exit) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(&mut self.state, self.code, err)),
        };
        let end = match self.list.alloc_node(NodeKind::Sentinel) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(&mut self.state, self.code, err)),
        };

        if let NodeKind::Func(f) = &mut self.list.node_mut(func).kind {
            f.exit = exit_node.into();
            f.end = end.into();
        }
        Ok(func)
    }

    /// Append a function and open its scope: the node list gains the
    /// function node, the exit label and the end sentinel, and the cursor
    /// parks on the function node so the body lands inside.
    pub fn add_func(&mut self, sign: &FuncSignature) -> CodeResult<Node> {
        check_ok(&self.state)?;
        if self.func.is_some() {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidState));
        }
        let func = self.new_func(sign)?;
        let (exit, end) = self.func_shape(func);

        self.list.add_node(func);
        let cursor = self.list.cursor();
        self.list.add_node(exit);
        self.list.add_node(end);
        self.list.set_cursor(cursor);

        self.func = func.into();
        trace!("Compiler: open function {:?}", func);
        Ok(func)
    }

    /// Close the current function: flush the local constant pool after the
    /// exit label, mark the function finished, and park the cursor on the
    /// end sentinel.
    pub fn end_func(&mut self) -> CodeResult<()> {
        check_ok(&self.state)?;
        let Some(func) = self.func.expand() else {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidState));
        };
        let (exit, end) = self.func_shape(func);

        self.list.set_cursor(Some(exit));
        if let Some(pool) = self.local_pool.take() {
            self.list.add_node(pool);
        }
        if let NodeKind::Func(f) = &mut self.list.node_mut(func).kind {
            f.is_finished = true;
        }
        self.func = None.into();
        self.list.set_cursor(Some(end));
        trace!("Compiler: close function {:?}", func);
        Ok(())
    }

    fn func_shape(&self, func: Node) -> (Node, Node) {
        match &self.list.node(func).kind {
            NodeKind::Func(f) => (
                f.exit.expand().expect("function has an exit node"),
                f.end.expand().expect("function has an end node"),
            ),
            _ => unreachable!("not a function node"),
        }
    }

    /// Record a virtual register as argument `index` of the current
    /// function.
    pub fn set_arg(&mut self, index: usize, reg: Reg) -> CodeResult<()> {
        check_ok(&self.state)?;
        let Some(func) = self.func.expand() else {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidState));
        };
        if !self.is_virt_reg_valid(reg) {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidVirtId));
        }
        let virt = VirtReg::from_u32(unpack_id(reg.id));
        match &mut self.list.node_mut(func).kind {
            NodeKind::Func(f) if index < f.args.len() => {
                f.args[index] = virt.into();
                Ok(())
            }
            _ => Err(raise_on(&mut self.state, self.code, Error::InvalidState)),
        }
    }

    // ------------------------------------------------------------------
    // Returns and calls.
    // ------------------------------------------------------------------

    /// Create a return node without adding it.
    pub fn new_ret(&mut self, o0: Operand, o1: Operand) -> CodeResult<Node> {
        let node = match self.list.alloc_node(NodeKind::FuncRet(RetData { ops: [o0, o1] })) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(&mut self.state, self.code, err)),
        };
        self.list.node_mut(node).flags = NodeFlags::RET;
        Ok(node)
    }

    /// Append a return of up to two values.
    pub fn add_ret(&mut self, o0: Operand, o1: Operand) -> CodeResult<Node> {
        check_ok(&self.state)?;
        let node = self.new_ret(o0, o1)?;
        self.list.add_node(node);
        Ok(node)
    }

    /// Create a call node without adding it. The operand array holds the
    /// call target followed by one slot per argument.
    pub fn new_call(&mut self, target: Operand, sign: &FuncSignature) -> CodeResult<Node> {
        let detail =
            FuncDetail::from_signature(sign, self.code.code_info().stack_alignment);
        let mut ops: OperandArray = OperandArray::new();
        ops.push(target);
        ops.resize(1 + sign.arg_count(), Operand::None);
        let node = match self.list.alloc_node(NodeKind::FuncCall(CallData {
            inst: InstData {
                inst: InstId::Call,
                ops,
            },
            detail,
            rets: [Operand::None, Operand::None],
        })) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(&mut self.state, self.code, err)),
        };
        Ok(node)
    }

    /// Append a call.
    pub fn add_call(&mut self, target: Operand, sign: &FuncSignature) -> CodeResult<Node> {
        check_ok(&self.state)?;
        let node = self.new_call(target, sign)?;
        self.list.add_node(node);
        Ok(node)
    }

    /// Set argument `index` of a call node.
    pub fn set_call_arg(&mut self, call: Node, index: usize, op: Operand) -> CodeResult<()> {
        match &mut self.list.node_mut(call).kind {
            NodeKind::FuncCall(c) if 1 + index < c.inst.ops.len() => {
                c.inst.ops[1 + index] = op;
                Ok(())
            }
            _ => Err(raise_on(&mut self.state, self.code, Error::InvalidState)),
        }
    }

    /// Bind return value `index` of a call node to a virtual register.
    pub fn set_call_ret(&mut self, call: Node, index: usize, reg: Reg) -> CodeResult<()> {
        if !self.is_virt_reg_valid(reg) {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidVirtId));
        }
        match &mut self.list.node_mut(call).kind {
            NodeKind::FuncCall(c) if index < c.rets.len() => {
                c.rets[index] = Operand::Reg(reg);
                Ok(())
            }
            _ => Err(raise_on(&mut self.state, self.code, Error::InvalidState)),
        }
    }

    // ------------------------------------------------------------------
    // Constants.
    // ------------------------------------------------------------------

    /// Add a constant to the local or global pool, creating the pool node
    /// on first use. Returns the pool label and the constant's offset from
    /// it.
    pub fn new_const(&mut self, scope: ConstScope, data: &[u8]) -> CodeResult<(Label, u32)> {
        check_ok(&self.state)?;
        let existing = match scope {
            ConstScope::Local => self.local_pool.expand(),
            ConstScope::Global => self.global_pool.expand(),
        };
        let node = match existing {
            Some(node) => node,
            None => {
                let node = match self.list.alloc_node(NodeKind::ConstPool(ConstPoolData {
                    label: LabelData {
                        label: Label::invalid(),
                        from: None.into(),
                        num_refs: 0,
                    },
                    pool: ConstPool::new(),
                })) {
                    Ok(node) => node,
                    Err(err) => return Err(raise_on(&mut self.state, self.code, err)),
                };
                if let Err(err) = self.list.register_label_node(self.code, node) {
                    return Err(raise_on(&mut self.state, self.code, err));
                }
                match scope {
                    ConstScope::Local => self.local_pool = node.into(),
                    ConstScope::Global => self.global_pool = node.into(),
                }
                node
            }
        };

        let (label, offset) = match &mut self.list.node_mut(node).kind {
            NodeKind::ConstPool(c) => {
                let offset = c
                    .pool
                    .add(data)
                    .ok_or(Error::InvalidOperand)?;
                (c.label.label, offset)
            }
            _ => unreachable!(),
        };
        Ok((label, offset))
    }

    /// Serialize the recorded nodes into another emitter, without running
    /// the allocation pass.
    pub fn serialize(&self, dst: &mut dyn Emitter) -> CodeResult<()> {
        self.list.serialize(dst)
    }
}

impl Emitter for Compiler<'_> {
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
        emit_impl(&mut self.list, &mut self.state, self.code, inst, o0, o1, o2, o3)
    }

    fn new_label(&mut self) -> Label {
        new_label_impl(&mut self.list, &mut self.state, self.code)
    }

    fn bind(&mut self, label: Label) -> CodeResult<()> {
        bind_impl(&mut self.list, &mut self.state, self.code, label)
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> CodeResult<()> {
        align_impl(&mut self.list, &mut self.state, self.code, mode, alignment)
    }

    fn embed(&mut self, data: &[u8]) -> CodeResult<()> {
        embed_impl(&mut self.list, &mut self.state, self.code, data)
    }

    fn embed_label(&mut self, label: Label) -> CodeResult<()> {
        embed_label_impl(&mut self.list, &mut self.state, self.code, label)
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> CodeResult<()> {
        embed_const_pool_impl(&mut self.list, &mut self.state, self.code, label, pool)
    }

    fn comment(&mut self, text: &str) -> CodeResult<()> {
        comment_impl(&mut self.list, &mut self.state, self.code, text)
    }

    /// Flush the global constant pool, run the register allocation pass,
    /// then serialize into a direct encoder on the same holder.
    fn finalize(&mut self) -> CodeResult<()> {
        check_ok(&self.state)?;
        if self.finalized {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidState));
        }
        if self.func.is_some() {
            return Err(raise_on(&mut self.state, self.code, Error::InvalidState));
        }

        if let Some(pool) = self.global_pool.take() {
            let last = self.list.last_node();
            self.list.set_cursor(last);
            self.list.add_node(pool);
        }

        let mut pass_zone = Zone::new(8 * 1024);
        if let Err(err) = regalloc::run(
            &mut self.list,
            &self.virt_regs,
            self.code.code_info(),
            &mut pass_zone,
        ) {
            return Err(raise_on(&mut self.state, self.code, err));
        }
        pass_zone.reset(true);

        self.finalized = true;
        let Self { code, list, .. } = self;
        let mut asm = Assembler::new(&mut **code)?;
        list.serialize(&mut asm)?;
        asm.finalize()
    }
}
