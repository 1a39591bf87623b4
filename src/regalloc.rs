//! The register allocation pass run by the compiler before serialization.
//!
//! The pass rewrites the node list in place: every virtual register operand
//! becomes a physical register (or a stack slot reached through a reserved
//! scratch register), function returns and calls are lowered to plain
//! instructions, and function prologue/epilogue sequences are inserted.
//! All list and back-reference invariants hold afterwards; lowered jumps to
//! the function exit go through the normal jump construction path so the
//! exit label's reference index stays accurate.
//!
//! The allocation strategy is deliberately direct: argument registers keep
//! their ABI homes, every other virtual register gets a distinct physical
//! register from the allocatable order, and the overflow goes to stack
//! slots addressed off the frame (or the red zone for frameless
//! functions). There is no liveness analysis and no reuse; values that
//! must survive a call belong in the caller's hands.

use cranelift_entity::PrimaryMap;
use log::trace;
use smallvec::SmallVec;

use crate::builder::{InstData, Node, NodeFlags, NodeKind, NodeList, OperandArray};
use crate::compiler::{VirtReg, VirtRegData};
use crate::error::{CodeResult, Error};
use crate::holder::{ArchType, CallConv, CodeInfo};
use crate::inst::InstId;
use crate::operand::{unpack_id, Label, Mem, Operand, Reg, RegKind, INVALID_ID};
use crate::zone::{Zone, ZoneRef};

/// Allocatable registers, in preference order, for each architecture.
/// Scratch registers are excluded; they carry spilled values.
const POOL_X64: [u32; 7] = [0, 9, 8, 1, 2, 6, 7]; // rax r9 r8 rcx rdx rsi rdi
const SCRATCH_X64: [u32; 2] = [10, 11];
const POOL_X86: [u32; 4] = [0, 3, 1, 2]; // eax ebx ecx edx
const SCRATCH_X86: [u32; 2] = [6, 7];

const UNASSIGNED: u8 = 0xFF;
const SPILLED: u8 = 0xFE;

const RBP: u32 = 5;
const RSP: u32 = 4;

/// One open function while walking the list.
struct Region {
    exit: Node,
    exit_label: Label,
    end: Node,
    has_frame: bool,
}

/// Assignment state shared across the pass. The per-register tables live
/// in the caller's scratch zone.
struct Alloc<'z> {
    zone: &'z mut Zone,
    /// One byte per virtual register: a physical id, `SPILLED`, or
    /// `UNASSIGNED`.
    assigned: ZoneRef,
    /// One little-endian i32 per virtual register: its slot displacement.
    slots: ZoneRef,
    /// Bitmask of physical registers already handed out.
    used: u32,
    next_slot: i32,
    pool: &'static [u32],
    scratch: &'static [u32],
    gp_size: u8,
}

impl<'z> Alloc<'z> {
    fn new(zone: &'z mut Zone, count: usize, arch: ArchType) -> CodeResult<Self> {
        let assigned = zone
            .alloc(count.max(1), 1)
            .ok_or(Error::NoHeapMemory)?;
        let slots = zone
            .alloc(4 * count.max(1), 4)
            .ok_or(Error::NoHeapMemory)?;
        zone.get_mut(assigned).fill(UNASSIGNED);
        let (pool, scratch): (&[u32], &[u32]) = match arch {
            ArchType::X64 => (&POOL_X64, &SCRATCH_X64),
            ArchType::X86 => (&POOL_X86, &SCRATCH_X86),
        };
        Ok(Self {
            zone,
            assigned,
            slots,
            used: 0,
            next_slot: 0,
            pool,
            scratch,
            gp_size: arch.gp_size(),
        })
    }

    fn get(&self, virt: usize) -> u8 {
        self.zone.get(self.assigned)[virt]
    }

    fn set(&mut self, virt: usize, value: u8) {
        self.zone.get_mut(self.assigned)[virt] = value;
    }

    fn slot_of(&self, virt: usize) -> i32 {
        let bytes = self.zone.get(self.slots);
        i32::from_le_bytes(bytes[virt * 4..virt * 4 + 4].try_into().unwrap_or_default())
    }

    fn bind(&mut self, virt: usize, phys: u32) {
        self.set(virt, phys as u8);
        self.used |= 1 << phys;
    }

    /// Assign `virt` a register from the pool, or a stack slot when the
    /// pool is exhausted.
    fn assign(&mut self, virt: usize) {
        if self.get(virt) != UNASSIGNED {
            return;
        }
        for &phys in self.pool {
            if self.used & (1 << phys) == 0 {
                self.bind(virt, phys);
                trace!("regalloc: v{} -> phys {}", virt, phys);
                return;
            }
        }
        let disp = -(self.gp_size as i32) * (self.next_slot + 1);
        self.next_slot += 1;
        let bytes = self.zone.get_mut(self.slots);
        bytes[virt * 4..virt * 4 + 4].copy_from_slice(&disp.to_le_bytes());
        self.set(virt, SPILLED);
        trace!("regalloc: v{} -> spill slot {}", virt, disp);
    }
}

/// ABI argument registers for a calling convention (empty when arguments
/// are passed on the stack, which this pass does not support).
fn abi_arg_regs(conv: CallConv, arch: ArchType) -> &'static [u32] {
    match arch {
        ArchType::X64 => match conv {
            CallConv::Win64 => &[1, 2, 8, 9],
            _ => &[7, 6, 2, 1, 8, 9],
        },
        ArchType::X86 => match conv {
            CallConv::FastCall => &[1, 2],
            _ => &[],
        },
    }
}

/// Whether the first operand of `inst` is written.
fn writes_dst(inst: InstId) -> bool {
    matches!(
        inst,
        InstId::Mov
            | InstId::Add
            | InstId::Sub
            | InstId::And
            | InstId::Or
            | InstId::Xor
            | InstId::Lea
            | InstId::Inc
            | InstId::Dec
            | InstId::Neg
            | InstId::Not
            | InstId::Pop
    )
}

/// Run the allocation pass over `list`.
pub(crate) fn run(
    list: &mut NodeList,
    virt_regs: &PrimaryMap<VirtReg, VirtRegData>,
    info: &CodeInfo,
    zone: &mut Zone,
) -> CodeResult<()> {
    let mut alloc = Alloc::new(zone, virt_regs.len(), info.arch)?;
    let gp_size = info.gp_size();

    // Bind function arguments to their ABI homes and detect which
    // functions need a frame (any function containing a call gets one, so
    // its call sites are 16-byte aligned).
    let mut current = list.first_node();
    while let Some(node) = current {
        let next = list.node(node).next.expand();
        if let NodeKind::Func(f) = &list.node(node).kind {
            let regs = abi_arg_regs(f.detail.call_conv, info.arch);
            if f.detail.args.len() > regs.len() {
                return Err(Error::InvalidState);
            }
            let bindings: SmallVec<[(usize, u32); 6]> = f
                .args
                .iter()
                .enumerate()
                .filter_map(|(i, arg)| arg.expand().map(|v| (v.as_u32() as usize, regs[i])))
                .collect();
            for (virt, phys) in bindings {
                if virt >= virt_regs.len() {
                    return Err(Error::InvalidVirtId);
                }
                alloc.bind(virt, phys);
            }
        }
        current = next;
    }

    // Walk the list: rewrite operands, lower rets and calls, insert
    // prologue and epilogue sequences.
    let mut region: Option<Region> = None;
    let mut current = list.first_node();
    while let Some(node) = current {
        let next = list.node(node).next.expand();

        let opened = match &list.node(node).kind {
            NodeKind::Func(f) => {
                let exit = f.exit.expand().ok_or(Error::InvalidState)?;
                let end = f.end.expand().ok_or(Error::InvalidState)?;
                let exit_label = list
                    .node(exit)
                    .label_data()
                    .map(|l| l.label)
                    .ok_or(Error::InvalidState)?;
                Some(Region {
                    exit,
                    exit_label,
                    end,
                    has_frame: function_contains_call(list, node, end),
                })
            }
            _ => None,
        };
        match opened {
            Some(r) => {
                if r.has_frame {
                    let push = make_inst(
                        list,
                        InstId::Push,
                        &[Operand::Reg(Reg::gp(RBP, gp_size))],
                    )?;
                    list.add_after(push, node);
                    let mov = make_inst(
                        list,
                        InstId::Mov,
                        &[
                            Operand::Reg(Reg::gp(RBP, gp_size)),
                            Operand::Reg(Reg::gp(RSP, gp_size)),
                        ],
                    )?;
                    list.add_after(mov, push);
                }
                region = Some(r);
            }
            None => match &list.node(node).kind {
                NodeKind::Inst(_) | NodeKind::Jump(_) => {
                    rewrite_inst_node(list, virt_regs, &mut alloc, node, region.as_ref())?;
                }
                NodeKind::FuncRet(_) => {
                    lower_ret(list, virt_regs, &mut alloc, node, region.as_ref(), info)?;
                }
                NodeKind::FuncCall(_) => {
                    lower_call(list, virt_regs, &mut alloc, node, region.as_ref(), info)?;
                }
                _ => {}
            },
        }

        if let Some(r) = &region {
            if node == r.exit {
                // Epilogue right after the exit label, ahead of any local
                // constant pool.
                let mut anchor = node;
                if r.has_frame {
                    let pop = make_inst(
                        list,
                        InstId::Pop,
                        &[Operand::Reg(Reg::gp(RBP, gp_size))],
                    )?;
                    list.add_after(pop, anchor);
                    anchor = pop;
                }
                let ret = make_inst(list, InstId::Ret, &[])?;
                list.add_after(ret, anchor);
            }
            if node == r.end {
                region = None;
            }
        }

        current = next;
    }

    #[cfg(debug_assertions)]
    list.check_list_invariants();
    Ok(())
}

fn function_contains_call(list: &NodeList, func: Node, end: Node) -> bool {
    let mut current = list.node(func).next.expand();
    while let Some(node) = current {
        if node == end {
            return false;
        }
        if matches!(list.node(node).kind, NodeKind::FuncCall(_)) {
            return true;
        }
        current = list.node(node).next.expand();
    }
    false
}

fn make_inst(list: &mut NodeList, inst: InstId, ops: &[Operand]) -> CodeResult<Node> {
    let node = list.alloc_node(NodeKind::Inst(InstData {
        inst,
        ops: OperandArray::from_slice(ops),
    }))?;
    Ok(node)
}

fn spill_base(region: Option<&Region>) -> u32 {
    match region {
        Some(r) if r.has_frame => RBP,
        _ => RSP,
    }
}

fn virt_index(
    virt_regs: &PrimaryMap<VirtReg, VirtRegData>,
    reg: Reg,
) -> CodeResult<usize> {
    let index = unpack_id(reg.id) as usize;
    if index >= virt_regs.len() {
        return Err(Error::InvalidVirtId);
    }
    Ok(index)
}

/// Resolve one register operand: a physical register stays put; a virtual
/// one is assigned on first sight. Spilled registers report their slot.
enum Resolved {
    Phys(Reg),
    Spill { slot: i32, size: u8 },
}

fn resolve_reg(
    virt_regs: &PrimaryMap<VirtReg, VirtRegData>,
    alloc: &mut Alloc<'_>,
    reg: Reg,
) -> CodeResult<Resolved> {
    if !reg.is_virt() {
        return Ok(Resolved::Phys(reg));
    }
    if reg.kind != RegKind::Gp {
        return Err(Error::InvalidVirtId);
    }
    let index = virt_index(virt_regs, reg)?;
    alloc.assign(index);
    match alloc.get(index) {
        SPILLED => Ok(Resolved::Spill {
            slot: alloc.slot_of(index),
            size: reg.size,
        }),
        phys => Ok(Resolved::Phys(Reg {
            kind: RegKind::Gp,
            size: reg.size,
            id: phys as u32,
        })),
    }
}

/// Rewrite all operands of an instruction-like node. Spilled values are
/// staged through the reserved scratch registers: a reload is inserted
/// before the node and, for a written first operand, a store after it.
fn rewrite_inst_node(
    list: &mut NodeList,
    virt_regs: &PrimaryMap<VirtReg, VirtRegData>,
    alloc: &mut Alloc<'_>,
    node: Node,
    region: Option<&Region>,
) -> CodeResult<()> {
    let (inst, mut ops) = match list.node(node).inst_data() {
        Some(data) => (data.inst, data.ops.clone()),
        None => return Ok(()),
    };
    let base = spill_base(region);
    let gp_size = alloc.gp_size;

    let mut scratch_used = 0usize;
    for (i, op) in ops.clone().iter().enumerate() {
        match *op {
            Operand::Reg(reg) => match resolve_reg(virt_regs, alloc, reg)? {
                Resolved::Phys(phys) => ops[i] = Operand::Reg(phys),
                Resolved::Spill { slot, size } => {
                    if scratch_used >= alloc.scratch.len() {
                        return Err(Error::InvalidState);
                    }
                    let scratch = Reg::gp(alloc.scratch[scratch_used], size);
                    scratch_used += 1;
                    let slot_mem = Mem {
                        base,
                        index: INVALID_ID,
                        shift: 0,
                        size,
                        disp: slot,
                    };
                    let reload = make_inst(
                        list,
                        InstId::Mov,
                        &[Operand::Reg(scratch), Operand::Mem(slot_mem)],
                    )?;
                    list.add_before(reload, node);
                    if i == 0 && writes_dst(inst) {
                        let store = make_inst(
                            list,
                            InstId::Mov,
                            &[Operand::Mem(slot_mem), Operand::Reg(scratch)],
                        )?;
                        list.add_after(store, node);
                    }
                    ops[i] = Operand::Reg(scratch);
                }
            },
            Operand::Mem(mut mem) => {
                let mut changed = false;
                for part in [&mut mem.base, &mut mem.index] {
                    if *part == INVALID_ID {
                        continue;
                    }
                    let reg = Reg::gp(*part, gp_size);
                    if !reg.is_virt() {
                        continue;
                    }
                    match resolve_reg(virt_regs, alloc, reg)? {
                        Resolved::Phys(phys) => {
                            *part = phys.id;
                            changed = true;
                        }
                        Resolved::Spill { slot, .. } => {
                            if scratch_used >= alloc.scratch.len() {
                                return Err(Error::InvalidState);
                            }
                            let scratch = Reg::gp(alloc.scratch[scratch_used], gp_size);
                            scratch_used += 1;
                            let slot_mem = Mem {
                                base,
                                index: INVALID_ID,
                                shift: 0,
                                size: gp_size,
                                disp: slot,
                            };
                            let reload = make_inst(
                                list,
                                InstId::Mov,
                                &[Operand::Reg(scratch), Operand::Mem(slot_mem)],
                            )?;
                            list.add_before(reload, node);
                            *part = scratch.id;
                            changed = true;
                        }
                    }
                }
                if changed {
                    ops[i] = Operand::Mem(mem);
                }
            }
            _ => {}
        }
    }

    match &mut list.node_mut(node).kind {
        NodeKind::Inst(data) => data.ops = ops,
        NodeKind::Jump(data) => data.inst.ops = ops,
        _ => {}
    }
    Ok(())
}

/// Lower a return node to moves into the return registers followed by a
/// jump to the function's exit label.
fn lower_ret(
    list: &mut NodeList,
    virt_regs: &PrimaryMap<VirtReg, VirtRegData>,
    alloc: &mut Alloc<'_>,
    node: Node,
    region: Option<&Region>,
    info: &CodeInfo,
) -> CodeResult<()> {
    let Some(region) = region else {
        return Err(Error::InvalidState);
    };
    let ops = match &list.node(node).kind {
        NodeKind::FuncRet(r) => r.ops,
        _ => return Ok(()),
    };

    // rax/eax then rdx/edx.
    for (op, ret_reg) in ops.iter().zip([0u32, 2u32]) {
        let value = match *op {
            Operand::None => continue,
            Operand::Reg(reg) => match resolve_reg(virt_regs, alloc, reg)? {
                Resolved::Phys(phys) => Operand::Reg(phys),
                Resolved::Spill { slot, size } => Operand::Mem(Mem {
                    base: spill_base(Some(region)),
                    index: INVALID_ID,
                    shift: 0,
                    size,
                    disp: slot,
                }),
            },
            other => other,
        };
        let size = match value {
            Operand::Reg(r) => r.size,
            _ => info.gp_size(),
        };
        let mov = make_inst(
            list,
            InstId::Mov,
            &[Operand::Reg(Reg::gp(ret_reg, size)), value],
        )?;
        list.add_before(mov, node);
    }

    // The jump goes through the normal construction path so the exit
    // label's back-reference chain stays accurate.
    let jump = list.alloc_node(NodeKind::Jump(crate::builder::JumpData {
        inst: InstData {
            inst: InstId::Jmp,
            ops: OperandArray::from_slice(&[Operand::Label(region.exit_label)]),
        },
        target: None.into(),
        jump_next: None.into(),
    }))?;
    list.node_mut(jump).flags = NodeFlags::JMP | NodeFlags::TAKEN;
    list.link_jump(jump, region.exit);
    list.add_before(jump, node);

    list.remove_node(node);
    Ok(())
}

/// Lower a call node: stage the arguments through the stack into their ABI
/// registers, rewrite the node into a plain call instruction, and bind the
/// returned values.
fn lower_call(
    list: &mut NodeList,
    virt_regs: &PrimaryMap<VirtReg, VirtRegData>,
    alloc: &mut Alloc<'_>,
    node: Node,
    region: Option<&Region>,
    info: &CodeInfo,
) -> CodeResult<()> {
    let (detail, ops, rets) = match &list.node(node).kind {
        NodeKind::FuncCall(c) => (c.detail.clone(), c.inst.ops.clone(), c.rets),
        _ => return Ok(()),
    };
    let abi = abi_arg_regs(detail.call_conv, info.arch);
    let arg_count = ops.len() - 1;
    if arg_count > abi.len() {
        return Err(Error::InvalidState);
    }
    let base = spill_base(region);
    let gp_size = info.gp_size();
    let scratch = Reg::gp(alloc.scratch[0], gp_size);

    // Push every argument, then pop them into the ABI registers in
    // reverse; staging through the stack sidesteps ordering hazards when a
    // source register is also an argument register.
    for op in ops[1..].iter() {
        let pushed: Operand = match *op {
            Operand::Reg(reg) => match resolve_reg(virt_regs, alloc, reg)? {
                Resolved::Phys(phys) => Operand::Reg(Reg::gp(phys.id, gp_size)),
                Resolved::Spill { slot, .. } => {
                    let reload = make_inst(
                        list,
                        InstId::Mov,
                        &[
                            Operand::Reg(scratch),
                            Operand::Mem(Mem {
                                base,
                                index: INVALID_ID,
                                shift: 0,
                                size: gp_size,
                                disp: slot,
                            }),
                        ],
                    )?;
                    list.add_before(reload, node);
                    Operand::Reg(scratch)
                }
            },
            Operand::Imm(value) => {
                if i32::try_from(value).is_ok() {
                    Operand::Imm(value)
                } else {
                    let load = make_inst(
                        list,
                        InstId::Mov,
                        &[Operand::Reg(scratch), Operand::Imm(value)],
                    )?;
                    list.add_before(load, node);
                    Operand::Reg(scratch)
                }
            }
            Operand::Mem(mem) => {
                let reload = make_inst(
                    list,
                    InstId::Mov,
                    &[Operand::Reg(scratch), Operand::Mem(mem)],
                )?;
                list.add_before(reload, node);
                Operand::Reg(scratch)
            }
            Operand::Label(_) | Operand::None => return Err(Error::InvalidState),
        };
        let push = make_inst(list, InstId::Push, &[pushed])?;
        list.add_before(push, node);
    }
    for i in (0..arg_count).rev() {
        let pop = make_inst(
            list,
            InstId::Pop,
            &[Operand::Reg(Reg::gp(abi[i], gp_size))],
        )?;
        list.add_before(pop, node);
    }

    // Resolve the call target and collapse the node into a plain call.
    let target = match ops[0] {
        Operand::Reg(reg) => match resolve_reg(virt_regs, alloc, reg)? {
            Resolved::Phys(phys) => Operand::Reg(phys),
            Resolved::Spill { slot, .. } => Operand::Mem(Mem {
                base,
                index: INVALID_ID,
                shift: 0,
                size: gp_size,
                disp: slot,
            }),
        },
        other => other,
    };
    list.node_mut(node).kind = NodeKind::Inst(InstData {
        inst: InstId::Call,
        ops: OperandArray::from_slice(&[target]),
    });

    // Bind returned values: rax then rdx.
    let mut anchor = node;
    for (ret, ret_reg) in rets.iter().zip([0u32, 2u32]) {
        let Operand::Reg(reg) = *ret else { continue };
        let mov_ops = match resolve_reg(virt_regs, alloc, reg)? {
            Resolved::Phys(phys) => [
                Operand::Reg(phys),
                Operand::Reg(Reg::gp(ret_reg, phys.size)),
            ],
            Resolved::Spill { slot, size } => [
                Operand::Mem(Mem {
                    base,
                    index: INVALID_ID,
                    shift: 0,
                    size,
                    disp: slot,
                }),
                Operand::Reg(Reg::gp(ret_reg, size)),
            ],
        };
        let mov = make_inst(list, InstId::Mov, &mov_ops)?;
        list.add_after(mov, anchor);
        anchor = mov;
    }
    Ok(())
}
