//! The deferred emitter: a doubly-linked list of typed nodes recorded for
//! later passes and serialized into any sink emitter.
//!
//! Nodes live in an entity arena (`PrimaryMap`) and reference each other by
//! index; `PackedOption<Node>` plays the role of the null pointer. This
//! avoids self-referential owned pointers while keeping O(1) splicing. A
//! label node keeps a back-reference chain (`from`) of all jump nodes that
//! target it, threaded through the jumps' `jump_next` indices; the chain is
//! maintained at jump construction time and by the node-removed hook, the
//! only two places that touch it.
//!
//! Cursor semantics: a new node is spliced immediately *after* the cursor
//! and becomes the new cursor. A null cursor prepends; with a non-empty
//! list the new node becomes the new head. Removing the cursor node moves
//! the cursor to its predecessor.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use bitflags::bitflags;
use log::trace;
use smallvec::SmallVec;

use crate::assembler::Assembler;
use crate::compiler::{CallData, FuncData, RetData};
use crate::const_pool::ConstPool;
use crate::emitter::{count_operands, Emitter, EmitterKind, EmitterState, Sidecar};
use crate::error::{CodeResult, Error};
use crate::holder::CodeHolder;
use crate::inst::{validate, AlignMode, InstId, InstOptions};
use crate::operand::{unpack_id, Label, Operand};
use crate::zone::{Zone, ZoneRef, ZoneStr, DATA_ZONE_CHUNK};

/// Data embedded directly in a node before spilling to the zone.
pub const INLINE_DATA_SIZE: usize = 16;

/// An opaque reference to a node in a builder's list.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Node(u32);
entity_impl!(Node, "n");

bitflags! {
    /// Node attribute flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Unconditional jump.
        const JMP = 0x01;
        /// Conditional jump.
        const JCC = 0x02;
        /// The branch is predicted or known taken.
        const TAKEN = 0x04;
        /// Function return.
        const RET = 0x08;
    }
}

/// Operand storage of an instruction-like node.
pub type OperandArray = SmallVec<[Operand; 4]>;

/// Payload of a plain instruction node.
#[derive(Debug)]
pub struct InstData {
    /// Instruction id.
    pub inst: InstId,
    /// Operands, in canonical order.
    pub ops: OperandArray,
}

/// Payload of a jump node: an instruction plus the target back-reference.
#[derive(Debug)]
pub struct JumpData {
    /// The underlying instruction.
    pub inst: InstData,
    /// The targeted label node, when followed.
    pub target: PackedOption<Node>,
    /// Next jump in the target's `from` chain.
    pub jump_next: PackedOption<Node>,
}

/// Payload of a label node.
#[derive(Debug)]
pub struct LabelData {
    /// The holder-registered label this node binds.
    pub label: Label,
    /// Head of the chain of jump nodes targeting this label.
    pub from: PackedOption<Node>,
    /// Number of jumps in the `from` chain.
    pub num_refs: u32,
}

impl LabelData {
    fn new(label: Label) -> Self {
        Self {
            label,
            from: None.into(),
            num_refs: 0,
        }
    }
}

/// Payload of a data node: inline bytes or a zone blob.
#[derive(Debug)]
pub enum DataBytes {
    /// Up to [`INLINE_DATA_SIZE`] bytes stored in the node itself.
    Inline {
        /// The bytes; only the first `len` are meaningful.
        buf: [u8; INLINE_DATA_SIZE],
        /// Number of meaningful bytes.
        len: u8,
    },
    /// Larger payloads are duplicated into the data zone.
    Blob(ZoneRef),
}

/// Payload of a constant-pool node; it is also a label node so the pool
/// start can be addressed.
pub struct ConstPoolData {
    /// Label data binding the pool start.
    pub label: LabelData,
    /// The pool itself.
    pub pool: ConstPool,
}

/// The kind-specific payload of a node.
pub enum NodeKind {
    /// Machine instruction.
    Inst(InstData),
    /// Jump instruction participating in the back-reference index.
    Jump(JumpData),
    /// Label bind point.
    Label(LabelData),
    /// Function boundary (also a label bind point).
    Func(FuncData),
    /// Alignment directive.
    Align(AlignMode, u32),
    /// Embedded data.
    Data(DataBytes),
    /// Embedded absolute label address.
    EmbedLabel(Label),
    /// Constant pool (also a label bind point).
    ConstPool(ConstPoolData),
    /// Standalone comment; the text lives in the node header.
    Comment,
    /// Inert marker, e.g. a function end.
    Sentinel,
    /// Function return (compiler only; consumed by the allocation pass).
    FuncRet(RetData),
    /// Function call (compiler only).
    FuncCall(CallData),
}

/// One node of the builder's list: linkage, common header, payload.
pub struct NodeData {
    /// Previous node; none iff this is the first node.
    pub prev: PackedOption<Node>,
    /// Next node; none iff this is the last node.
    pub next: PackedOption<Node>,
    /// Attribute flags.
    pub flags: NodeFlags,
    /// Instruction options captured at emit time.
    pub options: InstOptions,
    /// Inline comment duplicated into the data zone.
    pub comment: Option<ZoneStr>,
    /// Kind-specific payload.
    pub kind: NodeKind,
}

impl NodeData {
    /// The label data of a label-like node (label, function, const pool).
    pub fn label_data(&self) -> Option<&LabelData> {
        match &self.kind {
            NodeKind::Label(l) => Some(l),
            NodeKind::Func(f) => Some(&f.label),
            NodeKind::ConstPool(c) => Some(&c.label),
            _ => None,
        }
    }

    fn label_data_mut(&mut self) -> Option<&mut LabelData> {
        match &mut self.kind {
            NodeKind::Label(l) => Some(l),
            NodeKind::Func(f) => Some(&mut f.label),
            NodeKind::ConstPool(c) => Some(&mut c.label),
            _ => None,
        }
    }

    /// The instruction payload of an instruction-like node.
    pub fn inst_data(&self) -> Option<&InstData> {
        match &self.kind {
            NodeKind::Inst(i) => Some(i),
            NodeKind::Jump(j) => Some(&j.inst),
            NodeKind::FuncCall(c) => Some(&c.inst),
            _ => None,
        }
    }
}

/// The node arena plus list structure shared by the builder and the
/// compiler.
pub struct NodeList {
    nodes: PrimaryMap<Node, NodeData>,
    first: PackedOption<Node>,
    last: PackedOption<Node>,
    cursor: PackedOption<Node>,
    /// Label index to the node binding it, grown on demand.
    label_nodes: Vec<PackedOption<Node>>,
    /// Zone for duplicated comments, data blobs and names.
    pub(crate) data_zone: Zone,
    /// Optional cap on the node arena, for failure injection and for
    /// callers that want bounded growth.
    node_limit: Option<usize>,
}

impl NodeList {
    pub(crate) fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            first: None.into(),
            last: None.into(),
            cursor: None.into(),
            label_nodes: Vec::new(),
            data_zone: Zone::new(DATA_ZONE_CHUNK),
            node_limit: None,
        }
    }

    pub(crate) fn reset(&mut self, release_memory: bool) {
        self.nodes.clear();
        self.first = None.into();
        self.last = None.into();
        self.cursor = None.into();
        self.label_nodes.clear();
        self.data_zone.reset(release_memory);
    }

    /// First node of the list.
    pub fn first_node(&self) -> Option<Node> {
        self.first.expand()
    }

    /// Last node of the list.
    pub fn last_node(&self) -> Option<Node> {
        self.last.expand()
    }

    /// Current cursor.
    pub fn cursor(&self) -> Option<Node> {
        self.cursor.expand()
    }

    /// Move the cursor, returning the previous one.
    pub fn set_cursor(&mut self, node: Option<Node>) -> Option<Node> {
        let old = self.cursor.expand();
        self.cursor = node.into();
        old
    }

    /// Access a node.
    pub fn node(&self, node: Node) -> &NodeData {
        &self.nodes[node]
    }

    /// Access a node mutably.
    pub fn node_mut(&mut self, node: Node) -> &mut NodeData {
        &mut self.nodes[node]
    }

    /// Number of nodes ever created, including removed ones (the arena
    /// never reclaims individual nodes).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `node` is currently linked into the list.
    pub fn is_linked(&self, node: Node) -> bool {
        self.first.expand() == Some(node) || self.nodes[node].prev.is_some()
    }

    /// Cap the node arena at `limit` nodes; `None` removes the cap.
    pub fn set_node_limit(&mut self, limit: Option<usize>) {
        self.node_limit = limit;
    }

    /// Cap the data zone at `limit` bytes; `None` removes the cap.
    pub fn set_data_limit(&mut self, limit: Option<usize>) {
        self.data_zone.set_limit(limit);
    }

    // ------------------------------------------------------------------
    // Factories.
    // ------------------------------------------------------------------

    pub(crate) fn alloc_node(&mut self, kind: NodeKind) -> CodeResult<Node> {
        if let Some(limit) = self.node_limit {
            if self.nodes.len() >= limit {
                return Err(Error::NoHeapMemory);
            }
        }
        Ok(self.nodes.push(NodeData {
            prev: None.into(),
            next: None.into(),
            flags: NodeFlags::empty(),
            options: InstOptions::empty(),
            comment: None,
            kind,
        }))
    }

    /// Create a data node: small payloads inline, larger ones duplicated
    /// into the zone; a missing source reserves zeroed space.
    pub(crate) fn new_data_node(&mut self, data: Option<&[u8]>, size: usize) -> CodeResult<Node> {
        let bytes = if size <= INLINE_DATA_SIZE {
            let mut buf = [0u8; INLINE_DATA_SIZE];
            if let Some(src) = data {
                buf[..size].copy_from_slice(&src[..size]);
            }
            DataBytes::Inline {
                buf,
                len: size as u8,
            }
        } else {
            let blob = match data {
                Some(src) => self.data_zone.dup(src),
                None => self.data_zone.alloc(size, 1),
            }
            .ok_or(Error::NoHeapMemory)?;
            DataBytes::Blob(blob)
        };
        self.alloc_node(NodeKind::Data(bytes))
    }

    /// Create a comment node; the text is duplicated into the zone and an
    /// empty text is stored as no comment at all.
    pub(crate) fn new_comment_node(&mut self, text: &str) -> CodeResult<Node> {
        let comment = if text.is_empty() {
            None
        } else {
            Some(self.data_zone.dup_str(text).ok_or(Error::NoHeapMemory)?)
        };
        let node = self.alloc_node(NodeKind::Comment)?;
        self.nodes[node].comment = comment;
        Ok(node)
    }

    /// The bytes of a data node.
    pub fn data_of(&self, node: Node) -> &[u8] {
        match &self.nodes[node].kind {
            NodeKind::Data(DataBytes::Inline { buf, len }) => &buf[..*len as usize],
            NodeKind::Data(DataBytes::Blob(blob)) => self.data_zone.get(*blob),
            _ => &[],
        }
    }

    /// Look up (or lazily create) the label node for a label that is
    /// already registered with the holder.
    pub(crate) fn get_label_node(&mut self, code: &CodeHolder, label: Label) -> CodeResult<Node> {
        if !code.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        let index = unpack_id(label.id()) as usize;
        if index >= self.label_nodes.len() {
            self.label_nodes.resize(index + 1, None.into());
        }
        if let Some(node) = self.label_nodes[index].expand() {
            return Ok(node);
        }
        let node = self.alloc_node(NodeKind::Label(LabelData::new(label)))?;
        self.label_nodes[index] = node.into();
        Ok(node)
    }

    /// Register a freshly created label-like node with the holder and
    /// record it in the label-node table.
    pub(crate) fn register_label_node(
        &mut self,
        code: &mut CodeHolder,
        node: Node,
    ) -> CodeResult<Label> {
        let label = code.new_label_id()?;
        let index = unpack_id(label.id()) as usize;
        debug_assert!(self.label_nodes.len() <= index);
        self.label_nodes.resize(index + 1, None.into());
        self.label_nodes[index] = node.into();
        if let Some(data) = self.nodes[node].label_data_mut() {
            data.label = label;
        }
        Ok(label)
    }

    // ------------------------------------------------------------------
    // Linkage.
    // ------------------------------------------------------------------

    /// Insert `node` after the cursor (prepending when the cursor is null)
    /// and make it the new cursor.
    pub fn add_node(&mut self, node: Node) -> Node {
        debug_assert!(self.nodes[node].prev.is_none());
        debug_assert!(self.nodes[node].next.is_none());

        match self.cursor.expand() {
            None => match self.first.expand() {
                None => {
                    self.first = node.into();
                    self.last = node.into();
                }
                Some(first) => {
                    self.nodes[node].next = first.into();
                    self.nodes[first].prev = node.into();
                    self.first = node.into();
                }
            },
            Some(cursor) => {
                let next = self.nodes[cursor].next;
                self.nodes[node].prev = cursor.into();
                self.nodes[node].next = next;
                self.nodes[cursor].next = node.into();
                match next.expand() {
                    Some(next) => self.nodes[next].prev = node.into(),
                    None => self.last = node.into(),
                }
            }
        }
        self.cursor = node.into();
        node
    }

    /// Splice `node` right after `reference`; the cursor does not move.
    pub fn add_after(&mut self, node: Node, reference: Node) -> Node {
        debug_assert!(self.nodes[node].prev.is_none());
        debug_assert!(self.nodes[node].next.is_none());

        let next = self.nodes[reference].next;
        self.nodes[node].prev = reference.into();
        self.nodes[node].next = next;
        self.nodes[reference].next = node.into();
        match next.expand() {
            Some(next) => self.nodes[next].prev = node.into(),
            None => self.last = node.into(),
        }
        node
    }

    /// Splice `node` right before `reference`; the cursor does not move.
    pub fn add_before(&mut self, node: Node, reference: Node) -> Node {
        debug_assert!(self.nodes[node].prev.is_none());
        debug_assert!(self.nodes[node].next.is_none());

        let prev = self.nodes[reference].prev;
        self.nodes[node].prev = prev;
        self.nodes[node].next = reference.into();
        self.nodes[reference].prev = node.into();
        match prev.expand() {
            Some(prev) => self.nodes[prev].next = node.into(),
            None => self.first = node.into(),
        }
        node
    }

    /// Unlink `node`. A removed cursor falls back to the predecessor, and
    /// the node-removed hook keeps the jump back-reference index accurate.
    pub fn remove_node(&mut self, node: Node) -> Node {
        let prev = self.nodes[node].prev;
        let next = self.nodes[node].next;

        if self.first.expand() == Some(node) {
            self.first = next;
        } else if let Some(prev) = prev.expand() {
            self.nodes[prev].next = next;
        }
        if self.last.expand() == Some(node) {
            self.last = prev;
        } else if let Some(next) = next.expand() {
            self.nodes[next].prev = prev;
        }

        self.nodes[node].prev = None.into();
        self.nodes[node].next = None.into();
        if self.cursor.expand() == Some(node) {
            self.cursor = prev;
        }
        self.on_node_removed(node);
        trace!("NodeList: removed {:?}", node);
        node
    }

    /// Unlink the closed range `range_first..=range_last` as a block, then
    /// run the node-removed hook for each node in forward order. When the
    /// cursor was inside the range it falls back to the node *before* the
    /// range.
    pub fn remove_range(&mut self, range_first: Node, range_last: Node) {
        if range_first == range_last {
            self.remove_node(range_first);
            return;
        }

        let prev = self.nodes[range_first].prev;
        let next = self.nodes[range_last].next;

        if self.first.expand() == Some(range_first) {
            self.first = next;
        } else if let Some(prev) = prev.expand() {
            self.nodes[prev].next = next;
        }
        if self.last.expand() == Some(range_last) {
            self.last = prev;
        } else if let Some(next) = next.expand() {
            self.nodes[next].prev = prev;
        }

        let mut node = range_first;
        loop {
            let following = self.nodes[node].next.expand();
            self.nodes[node].prev = None.into();
            self.nodes[node].next = None.into();
            if self.cursor.expand() == Some(node) {
                self.cursor = prev;
            }
            self.on_node_removed(node);
            if node == range_last {
                break;
            }
            node = following.expect("range must be contiguous");
        }
    }

    /// Maintain the jump back-reference index when a jump node leaves the
    /// list: unlink it from its target's `from` chain (a linear scan) and
    /// drop the reference count.
    fn on_node_removed(&mut self, node: Node) {
        if !self.nodes[node]
            .flags
            .intersects(NodeFlags::JMP | NodeFlags::JCC)
        {
            return;
        }
        let (target, node_jump_next) = match &self.nodes[node].kind {
            NodeKind::Jump(j) => (j.target.expand(), j.jump_next),
            _ => return,
        };
        let Some(target) = target else { return };

        let mut prev: Option<Node> = None;
        let mut current = self.nodes[target]
            .label_data()
            .and_then(|l| l.from.expand());
        while let Some(c) = current {
            if c == node {
                match prev {
                    None => {
                        if let Some(l) = self.nodes[target].label_data_mut() {
                            l.from = node_jump_next;
                        }
                    }
                    Some(p) => {
                        if let NodeKind::Jump(j) = &mut self.nodes[p].kind {
                            j.jump_next = node_jump_next;
                        }
                    }
                }
                break;
            }
            prev = Some(c);
            current = match &self.nodes[c].kind {
                NodeKind::Jump(j) => j.jump_next.expand(),
                _ => None,
            };
        }

        if let Some(l) = self.nodes[target].label_data_mut() {
            debug_assert!(l.num_refs > 0);
            l.num_refs -= 1;
        }
        if let NodeKind::Jump(j) = &mut self.nodes[node].kind {
            j.jump_next = None.into();
        }
    }

    /// Thread a jump node into its target's `from` chain.
    pub(crate) fn link_jump(&mut self, jump: Node, target: Node) {
        let head = self.nodes[target]
            .label_data()
            .map(|l| l.from)
            .unwrap_or_else(|| None.into());
        if let NodeKind::Jump(j) = &mut self.nodes[jump].kind {
            j.target = target.into();
            j.jump_next = head;
        }
        if let Some(l) = self.nodes[target].label_data_mut() {
            l.from = jump.into();
            l.num_refs += 1;
        }
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn check_list_invariants(&self) {
        // Nothing.
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_list_invariants(&self) {
        let mut seen = 0usize;
        let mut prev: Option<Node> = None;
        let mut current = self.first.expand();
        while let Some(node) = current {
            assert_eq!(self.nodes[node].prev.expand(), prev);
            prev = Some(node);
            current = self.nodes[node].next.expand();
            seen += 1;
            assert!(seen <= self.nodes.len(), "cycle in node list");
        }
        assert_eq!(self.last.expand(), prev);
        if let Some(cursor) = self.cursor.expand() {
            assert!(self.is_linked(cursor));
        }
    }

    // ------------------------------------------------------------------
    // Serialization.
    // ------------------------------------------------------------------

    /// Replay the node list, in order, as calls into `dst`. The first sink
    /// error aborts and is returned.
    pub fn serialize(&self, dst: &mut dyn Emitter) -> CodeResult<()> {
        let mut current = self.first.expand();
        while let Some(node) = current {
            let data = &self.nodes[node];
            if let Some(comment) = data.comment {
                dst.state_mut()
                    .set_inline_comment(self.data_zone.get_str(comment));
            }
            match &data.kind {
                NodeKind::Align(mode, alignment) => dst.align(*mode, *alignment)?,
                NodeKind::Data(_) => dst.embed(self.data_of(node))?,
                NodeKind::EmbedLabel(label) => dst.embed_label(*label)?,
                NodeKind::Label(l) => dst.bind(l.label)?,
                NodeKind::Func(f) => dst.bind(f.label.label)?,
                NodeKind::ConstPool(c) => dst.embed_const_pool(c.label.label, &c.pool)?,
                NodeKind::Inst(i) => self.replay_inst(dst, i, data.options)?,
                NodeKind::Jump(j) => self.replay_inst(dst, &j.inst, data.options)?,
                NodeKind::FuncCall(c) => self.replay_inst(dst, &c.inst, data.options)?,
                NodeKind::Comment => {
                    let text = data
                        .comment
                        .map(|c| self.data_zone.get_str(c))
                        .unwrap_or_default();
                    dst.comment(text)?;
                }
                NodeKind::Sentinel | NodeKind::FuncRet(_) => {}
            }
            current = data.next.expand();
        }
        Ok(())
    }

    fn replay_inst(
        &self,
        dst: &mut dyn Emitter,
        inst: &InstData,
        options: InstOptions,
    ) -> CodeResult<()> {
        let get = |i: usize| inst.ops.get(i).copied().unwrap_or(Operand::None);
        if inst.ops.len() > 4 {
            dst.state_mut().set_op4(inst.ops[4]);
        }
        if inst.ops.len() > 5 {
            dst.state_mut().set_op5(inst.ops[5]);
        }
        dst.state_mut().set_options(options);
        dst._emit(inst.inst, get(0), get(1), get(2), get(3))
    }
}

// ----------------------------------------------------------------------
// Shared write-API implementation for the deferred emitters.
// ----------------------------------------------------------------------

pub(crate) fn raise_on(state: &mut EmitterState, code: &mut CodeHolder, err: Error) -> Error {
    if code.consult_error_handler(err, "builder") {
        return err;
    }
    if state.last_error.is_none() {
        state.last_error = Some(err);
    }
    err
}

pub(crate) fn check_ok(state: &EmitterState) -> CodeResult<()> {
    match state.last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// The deferred `_emit`: records an instruction or jump node, resolving a
/// followed jump target into the label back-reference index.
pub(crate) fn emit_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    inst: InstId,
    o0: Operand,
    o1: Operand,
    o2: Operand,
    o3: Operand,
) -> CodeResult<()> {
    check_ok(state)?;
    let Sidecar {
        mut options,
        comment,
        extra,
    } = state.take_sidecar();
    let op_count = count_operands(options, &o0, &o1, &o2, &o3);

    if options.contains(InstOptions::STRICT_VALIDATION) {
        let operands = [o0, o1, o2, o3, extra.op4, extra.op5];
        if let Err(err) = validate(
            code.code_info().arch,
            inst,
            options,
            &extra,
            &operands,
            op_count,
        ) {
            return Err(raise_on(state, code, err));
        }
        // Validation is a property of this emit call, not of the node.
        options &= !InstOptions::STRICT_VALIDATION;
    }

    let mut ops: OperandArray = OperandArray::new();
    for (i, op) in [o0, o1, o2, o3, extra.op4, extra.op5].into_iter().enumerate() {
        if i >= op_count {
            break;
        }
        ops.push(op);
    }

    let comment = match comment {
        Some(text) => match list.data_zone.dup_str(&text) {
            Some(s) => Some(s),
            None => return Err(raise_on(state, code, Error::NoHeapMemory)),
        },
        None => None,
    };

    let node = if inst.is_jump() {
        // Resolve the target label unless asked not to follow.
        let mut target = None;
        if !options.contains(InstOptions::UNFOLLOW) {
            match ops.first().and_then(|op| op.as_label()) {
                Some(label) => match list.get_label_node(code, label) {
                    Ok(node) => target = Some(node),
                    Err(err) => return Err(raise_on(state, code, err)),
                },
                None => options |= InstOptions::UNFOLLOW,
            }
        }

        let node = match list.alloc_node(NodeKind::Jump(JumpData {
            inst: InstData { inst, ops },
            target: None.into(),
            jump_next: None.into(),
        })) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(state, code, err)),
        };

        let mut flags = if inst == InstId::Jmp {
            NodeFlags::JMP | NodeFlags::TAKEN
        } else {
            NodeFlags::JCC
        };
        if options.contains(InstOptions::TAKEN) {
            flags |= NodeFlags::TAKEN;
        }
        list.node_mut(node).flags = flags;
        if let Some(target) = target {
            list.link_jump(node, target);
        }
        node
    } else {
        match list.alloc_node(NodeKind::Inst(InstData { inst, ops })) {
            Ok(node) => node,
            Err(err) => return Err(raise_on(state, code, err)),
        }
    };

    list.node_mut(node).options = options;
    list.node_mut(node).comment = comment;
    list.add_node(node);
    trace!("NodeList: recorded {:?} as {:?}", inst, node);
    Ok(())
}

pub(crate) fn new_label_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
) -> Label {
    if state.last_error.is_some() {
        return Label::invalid();
    }
    let node = match list.alloc_node(NodeKind::Label(LabelData::new(Label::invalid()))) {
        Ok(node) => node,
        Err(err) => {
            raise_on(state, code, err);
            return Label::invalid();
        }
    };
    match list.register_label_node(code, node) {
        Ok(label) => label,
        Err(err) => {
            raise_on(state, code, err);
            Label::invalid()
        }
    }
}

pub(crate) fn bind_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    label: Label,
) -> CodeResult<()> {
    check_ok(state)?;
    let node = match list.get_label_node(code, label) {
        Ok(node) => node,
        Err(err) => return Err(raise_on(state, code, err)),
    };
    if list.is_linked(node) {
        return Err(raise_on(state, code, Error::LabelAlreadyBound));
    }
    list.add_node(node);
    Ok(())
}

pub(crate) fn align_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    mode: AlignMode,
    alignment: u32,
) -> CodeResult<()> {
    check_ok(state)?;
    if alignment > 1 && !alignment.is_power_of_two() {
        return Err(raise_on(state, code, Error::InvalidOperand));
    }
    let node = match list.alloc_node(NodeKind::Align(mode, alignment)) {
        Ok(node) => node,
        Err(err) => return Err(raise_on(state, code, err)),
    };
    list.add_node(node);
    Ok(())
}

pub(crate) fn embed_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    data: &[u8],
) -> CodeResult<()> {
    check_ok(state)?;
    let node = match list.new_data_node(Some(data), data.len()) {
        Ok(node) => node,
        Err(err) => return Err(raise_on(state, code, err)),
    };
    list.add_node(node);
    Ok(())
}

pub(crate) fn embed_label_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    label: Label,
) -> CodeResult<()> {
    check_ok(state)?;
    if !code.is_label_valid(label) {
        return Err(raise_on(state, code, Error::InvalidLabel));
    }
    let node = match list.alloc_node(NodeKind::EmbedLabel(label)) {
        Ok(node) => node,
        Err(err) => return Err(raise_on(state, code, err)),
    };
    list.add_node(node);
    Ok(())
}

pub(crate) fn embed_const_pool_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    label: Label,
    pool: &ConstPool,
) -> CodeResult<()> {
    check_ok(state)?;
    if !code.is_label_valid(label) {
        return Err(raise_on(state, code, Error::InvalidLabel));
    }
    align_impl(list, state, code, AlignMode::Data, pool.alignment())?;
    bind_impl(list, state, code, label)?;
    let node = match list.new_data_node(None, pool.size()) {
        Ok(node) => node,
        Err(err) => return Err(raise_on(state, code, err)),
    };
    let blob = match &list.node(node).kind {
        NodeKind::Data(DataBytes::Blob(blob)) => Some(*blob),
        _ => None,
    };
    match blob {
        Some(blob) => pool.fill(list.data_zone.get_mut(blob)),
        None => {
            if let NodeKind::Data(DataBytes::Inline { buf, len }) =
                &mut list.node_mut(node).kind
            {
                pool.fill(&mut buf[..*len as usize]);
            }
        }
    }
    list.add_node(node);
    Ok(())
}

pub(crate) fn comment_impl(
    list: &mut NodeList,
    state: &mut EmitterState,
    code: &mut CodeHolder,
    text: &str,
) -> CodeResult<()> {
    check_ok(state)?;
    let node = match list.new_comment_node(text) {
        Ok(node) => node,
        Err(err) => return Err(raise_on(state, code, err)),
    };
    list.add_node(node);
    Ok(())
}

// ----------------------------------------------------------------------
// Builder.
// ----------------------------------------------------------------------

/// Deferred emitter recording nodes for later transformation and
/// serialization.
pub struct Builder<'a> {
    pub(crate) code: &'a mut CodeHolder,
    pub(crate) state: EmitterState,
    pub(crate) list: NodeList,
}

impl<'a> Builder<'a> {
    /// Attach a builder to `code`.
    pub fn new(code: &'a mut CodeHolder) -> Self {
        let mut state = EmitterState::new(EmitterKind::Builder);
        state.hints = code.global_hints();
        state.global_options = code.global_options();
        trace!("Builder: attached");
        Self {
            code,
            state,
            list: NodeList::new(),
        }
    }

    /// The holder this builder is attached to.
    pub fn code(&self) -> &CodeHolder {
        self.code
    }

    /// The node list.
    pub fn list(&self) -> &NodeList {
        &self.list
    }

    /// The node list, mutably: cursor movement, node removal, passes.
    pub fn list_mut(&mut self) -> &mut NodeList {
        &mut self.list
    }

    /// Reset the builder to its post-attach state, releasing the node
    /// arena and data zone when `release_memory` is set.
    pub fn reset(&mut self, release_memory: bool) {
        self.list.reset(release_memory);
        self.state = EmitterState::new(EmitterKind::Builder);
        self.state.hints = self.code.global_hints();
        self.state.global_options = self.code.global_options();
    }

    /// Serialize the recorded nodes into another emitter.
    pub fn serialize(&self, dst: &mut dyn Emitter) -> CodeResult<()> {
        self.list.serialize(dst)
    }
}

impl Emitter for Builder<'_> {
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

    /// Serialize into a direct encoder attached to the same holder.
    fn finalize(&mut self) -> CodeResult<()> {
        check_ok(&self.state)?;
        let Self { code, list, .. } = self;
        let mut asm = Assembler::new(&mut **code)?;
        list.serialize(&mut asm)?;
        asm.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::{ArchType, CodeInfo};
    use crate::operand::Reg;

    fn holder() -> CodeHolder {
        CodeHolder::new(CodeInfo::new(ArchType::X64))
    }

    fn kinds(list: &NodeList) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut current = list.first_node();
        while let Some(node) = current {
            out.push(match &list.node(node).kind {
                NodeKind::Inst(_) => "inst",
                NodeKind::Jump(_) => "jump",
                NodeKind::Label(_) => "label",
                NodeKind::Func(_) => "func",
                NodeKind::Align(..) => "align",
                NodeKind::Data(_) => "data",
                NodeKind::EmbedLabel(_) => "embed-label",
                NodeKind::ConstPool(_) => "const-pool",
                NodeKind::Comment => "comment",
                NodeKind::Sentinel => "sentinel",
                NodeKind::FuncRet(_) => "ret",
                NodeKind::FuncCall(_) => "call",
            });
            current = list.node(node).next.expand();
        }
        out
    }

    /// A sink that accepts everything and records nothing.
    struct NullSink {
        state: EmitterState,
    }

    impl NullSink {
        fn new() -> Self {
            Self {
                state: EmitterState::new(EmitterKind::Assembler),
            }
        }
    }

    impl Emitter for NullSink {
        fn state(&self) -> &EmitterState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut EmitterState {
            &mut self.state
        }
        fn _emit(
            &mut self,
            _inst: InstId,
            _o0: Operand,
            _o1: Operand,
            _o2: Operand,
            _o3: Operand,
        ) -> CodeResult<()> {
            self.state.take_sidecar();
            Ok(())
        }
        fn new_label(&mut self) -> Label {
            Label::invalid()
        }
        fn bind(&mut self, _label: Label) -> CodeResult<()> {
            Ok(())
        }
        fn align(&mut self, _mode: AlignMode, _alignment: u32) -> CodeResult<()> {
            Ok(())
        }
        fn embed(&mut self, _data: &[u8]) -> CodeResult<()> {
            Ok(())
        }
        fn embed_label(&mut self, _label: Label) -> CodeResult<()> {
            Ok(())
        }
        fn embed_const_pool(&mut self, _label: Label, _pool: &ConstPool) -> CodeResult<()> {
            Ok(())
        }
        fn comment(&mut self, _text: &str) -> CodeResult<()> {
            Ok(())
        }
        fn finalize(&mut self) -> CodeResult<()> {
            Ok(())
        }
    }

    /// A sink recording the sequence of calls it receives.
    struct TraceSink {
        state: EmitterState,
        calls: Vec<String>,
    }

    impl TraceSink {
        fn new() -> Self {
            Self {
                state: EmitterState::new(EmitterKind::Assembler),
                calls: Vec::new(),
            }
        }
    }

    impl Emitter for TraceSink {
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
            _o1: Operand,
            _o2: Operand,
            _o3: Operand,
        ) -> CodeResult<()> {
            self.state.take_sidecar();
            self.calls.push(format!("emit {:?} {:?}", inst, o0));
            Ok(())
        }
        fn new_label(&mut self) -> Label {
            Label::invalid()
        }
        fn bind(&mut self, label: Label) -> CodeResult<()> {
            self.calls.push(format!("bind {}", label.index()));
            Ok(())
        }
        fn align(&mut self, _mode: AlignMode, alignment: u32) -> CodeResult<()> {
            self.calls.push(format!("align {}", alignment));
            Ok(())
        }
        fn embed(&mut self, data: &[u8]) -> CodeResult<()> {
            self.calls.push(format!("embed {}", data.len()));
            Ok(())
        }
        fn embed_label(&mut self, label: Label) -> CodeResult<()> {
            self.calls.push(format!("embed-label {}", label.index()));
            Ok(())
        }
        fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> CodeResult<()> {
            self.calls
                .push(format!("pool {} {}", label.index(), pool.size()));
            Ok(())
        }
        fn comment(&mut self, text: &str) -> CodeResult<()> {
            self.calls.push(format!("comment {}", text));
            Ok(())
        }
        fn finalize(&mut self) -> CodeResult<()> {
            Ok(())
        }
    }

    fn r0() -> Reg {
        Reg::gp64(0)
    }
    fn r1() -> Reg {
        Reg::gp64(1)
    }

    #[test]
    fn empty_builder_serializes_to_nothing() {
        let mut code = holder();
        let b = Builder::new(&mut code);
        let mut sink = NullSink::new();
        b.serialize(&mut sink).unwrap();
        drop(b);
        assert_eq!(code.code_size(), 0);
    }

    #[test]
    fn forward_branch_builds_the_back_reference_index() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.emit1(InstId::Jmp, l).unwrap();
        b.bind(l).unwrap();

        assert_eq!(kinds(b.list()), ["jump", "label"]);
        let jump = b.list().first_node().unwrap();
        let label = b.list().node(jump).next.expand().unwrap();

        let data = b.list().node(jump);
        assert!(data.flags.contains(NodeFlags::JMP | NodeFlags::TAKEN));
        match &data.kind {
            NodeKind::Jump(j) => assert_eq!(j.target.expand(), Some(label)),
            _ => panic!("expected a jump node"),
        }
        let label_data = b.list().node(label).label_data().unwrap();
        assert_eq!(label_data.num_refs, 1);
        assert_eq!(label_data.from.expand(), Some(jump));
        b.list().check_list_invariants();
    }

    #[test]
    fn forward_branch_serializes_into_an_encoder() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.emit1(InstId::Jmp, l).unwrap();
        b.bind(l).unwrap();
        b.finalize().unwrap();

        // The jump is five bytes; the label binds right after it, so the
        // displacement resolves to zero.
        let data = &code.section(code.text_section()).unwrap().buffer.data;
        assert_eq!(data, &[0xE9, 0, 0, 0, 0]);
        assert_eq!(code.label_offset(l), Some(5));
    }

    #[test]
    fn removing_the_jump_unlinks_the_back_reference() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.emit1(InstId::Jmp, l).unwrap();
        b.bind(l).unwrap();

        let jump = b.list().first_node().unwrap();
        b.list_mut().remove_node(jump);

        assert_eq!(kinds(b.list()), ["label"]);
        let label = b.list().first_node().unwrap();
        let label_data = b.list().node(label).label_data().unwrap();
        assert_eq!(label_data.num_refs, 0);
        assert!(label_data.from.is_none());
        b.list().check_list_invariants();
    }

    #[test]
    fn jump_with_many_references_unlinks_the_right_one() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.emit1(InstId::Je, l).unwrap();
        b.emit1(InstId::Jne, l).unwrap();
        b.emit1(InstId::Jmp, l).unwrap();
        b.bind(l).unwrap();

        let first = b.list().first_node().unwrap();
        let second = b.list().node(first).next.expand().unwrap();
        let third = b.list().node(second).next.expand().unwrap();
        let label = b.list().node(third).next.expand().unwrap();
        assert_eq!(b.list().node(label).label_data().unwrap().num_refs, 3);

        // Remove the middle jump; the other two stay threaded.
        b.list_mut().remove_node(second);
        let label_data = b.list().node(label).label_data().unwrap();
        assert_eq!(label_data.num_refs, 2);
        let mut chain = Vec::new();
        let mut current = label_data.from.expand();
        while let Some(node) = current {
            chain.push(node);
            current = match &b.list().node(node).kind {
                NodeKind::Jump(j) => j.jump_next.expand(),
                _ => None,
            };
        }
        assert_eq!(chain, vec![third, first]);
    }

    #[test]
    fn error_latching_short_circuits_writes() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();

        // Exhaust the node arena so the next allocation fails.
        let limit = b.list().node_count();
        b.list_mut().set_node_limit(Some(limit));

        assert_eq!(b.emit2(InstId::Add, r0(), r1()), Err(Error::NoHeapMemory));
        let nodes_after_error = b.list().node_count();

        // Latched: even a bind that would otherwise succeed is refused and
        // nothing is allocated or linked.
        assert_eq!(b.bind(l), Err(Error::NoHeapMemory));
        assert_eq!(b.list().node_count(), nodes_after_error);
        assert_eq!(b.list().first_node(), None);

        b.state_mut().reset_last_error();
        b.list_mut().set_node_limit(None);
        b.bind(l).unwrap();
        assert_eq!(kinds(b.list()), ["label"]);
    }

    #[test]
    fn const_pool_embeds_as_align_label_data() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        let mut pool = ConstPool::new();
        pool.add8(1).unwrap();
        pool.add8(2).unwrap();
        pool.add8(3).unwrap();
        assert_eq!(pool.size(), 24);
        assert_eq!(pool.alignment(), 8);

        b.embed_const_pool(l, &pool).unwrap();
        assert_eq!(kinds(b.list()), ["align", "label", "data"]);

        let align = b.list().first_node().unwrap();
        match b.list().node(align).kind {
            NodeKind::Align(AlignMode::Data, 8) => {}
            _ => panic!("expected a data alignment of 8"),
        }
        let label = b.list().node(align).next.expand().unwrap();
        let data = b.list().node(label).next.expand().unwrap();
        let mut expected = vec![0u8; 24];
        pool.fill(&mut expected);
        assert_eq!(b.list().data_of(data), &expected[..]);
    }

    #[test]
    fn cursor_semantics_and_list_invariants() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        b.emit0(InstId::Nop).unwrap();
        b.emit0(InstId::Ret).unwrap();
        let first = b.list().first_node().unwrap();
        let last = b.list().last_node().unwrap();

        // Null cursor with a non-empty list prepends and the new node
        // becomes the head.
        b.list_mut().set_cursor(None);
        b.emit2(InstId::Mov, r0(), r1()).unwrap();
        let head = b.list().first_node().unwrap();
        assert_ne!(head, first);
        assert_eq!(b.list().cursor(), Some(head));
        assert_eq!(b.list().node(head).next.expand(), Some(first));
        assert_eq!(b.list().last_node(), Some(last));
        b.list().check_list_invariants();

        // Inserting after the cursor splices mid-list.
        b.emit2(InstId::Add, r0(), r1()).unwrap();
        let added = b.list().node(head).next.expand().unwrap();
        assert_eq!(b.list().cursor(), Some(added));
        assert_eq!(b.list().node(added).next.expand(), Some(first));
        b.list().check_list_invariants();

        // Removing the cursor node falls back to its predecessor.
        b.list_mut().remove_node(added);
        assert_eq!(b.list().cursor(), Some(head));
        b.list().check_list_invariants();
    }

    #[test]
    fn remove_range_cursor_falls_back_before_the_range() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        b.emit0(InstId::Nop).unwrap();
        b.emit0(InstId::Nop).unwrap();
        b.emit0(InstId::Nop).unwrap();
        b.emit0(InstId::Nop).unwrap();
        let n1 = b.list().first_node().unwrap();
        let n2 = b.list().node(n1).next.expand().unwrap();
        let n3 = b.list().node(n2).next.expand().unwrap();
        let n4 = b.list().node(n3).next.expand().unwrap();

        // Cursor in the middle of the removed range falls back to the node
        // before the whole range, not the node before itself.
        b.list_mut().set_cursor(Some(n3));
        b.list_mut().remove_range(n2, n3);
        assert_eq!(b.list().cursor(), Some(n1));
        assert_eq!(b.list().first_node(), Some(n1));
        assert_eq!(b.list().node(n1).next.expand(), Some(n4));
        assert_eq!(b.list().last_node(), Some(n4));
        b.list().check_list_invariants();
    }

    #[test]
    fn removed_node_can_be_reinserted() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        b.emit0(InstId::Nop).unwrap();
        b.emit0(InstId::Ret).unwrap();
        let nop = b.list().first_node().unwrap();

        b.list_mut().remove_node(nop);
        assert!(!b.list().is_linked(nop));
        let tail = b.list().last_node();
        b.list_mut().set_cursor(tail);
        b.list_mut().add_node(nop);
        assert_eq!(b.list().last_node(), Some(nop));
        b.list().check_list_invariants();

        // A removed jump stays detached from the index; re-establishing the
        // back-reference means constructing a fresh jump.
        let l = b.new_label();
        b.emit1(InstId::Jmp, l).unwrap();
        let jump = b.list().last_node().unwrap();
        b.list_mut().remove_node(jump);
        b.emit1(InstId::Jmp, l).unwrap();
        b.bind(l).unwrap();
        let label = b.list().last_node().unwrap();
        assert_eq!(b.list().node(label).label_data().unwrap().num_refs, 1);
    }

    #[test]
    fn serialize_visits_every_node_in_order() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.comment("prologue").unwrap();
        b.align(AlignMode::Code, 4).unwrap();
        b.emit2(InstId::Mov, r0(), r1()).unwrap();
        b.bind(l).unwrap();
        b.embed(&[1, 2, 3]).unwrap();

        let mut sink = TraceSink::new();
        b.serialize(&mut sink).unwrap();
        assert_eq!(
            sink.calls,
            [
                "comment prologue",
                "align 4",
                "emit Mov Reg(Reg { kind: Gp, size: 8, id: 0 })",
                "bind 0",
                "embed 3",
            ]
        );

        // The same list serializes to the same call sequence.
        let mut sink2 = TraceSink::new();
        b.serialize(&mut sink2).unwrap();
        assert_eq!(sink.calls, sink2.calls);
    }

    #[test]
    fn serialize_round_trips_into_another_builder() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.state_mut().set_inline_comment("loop body");
        b.emit2(InstId::Add, r0(), r1()).unwrap();
        b.emit1(InstId::Jne, l).unwrap();
        b.bind(l).unwrap();
        b.align(AlignMode::Data, 8).unwrap();
        b.embed(&[9; 20]).unwrap();
        let label_count = b.code().label_count();

        // The second builder lives on a second holder with the same labels
        // registered.
        let mut code2 = holder();
        for _ in 0..label_count {
            code2.new_label_id().unwrap();
        }
        let mut b2 = Builder::new(&mut code2);
        b.serialize(&mut b2).unwrap();

        assert_eq!(kinds(b.list()), kinds(b2.list()));
        let mut n1 = b.list().first_node();
        let mut n2 = b2.list().first_node();
        while let (Some(a), Some(c)) = (n1, n2) {
            let da = b.list().node(a);
            let dc = b2.list().node(c);
            assert_eq!(da.options, dc.options);
            match (da.inst_data(), dc.inst_data()) {
                (Some(ia), Some(ic)) => {
                    assert_eq!(ia.inst, ic.inst);
                    assert_eq!(ia.ops, ic.ops);
                }
                (None, None) => {}
                _ => panic!("node kinds diverged"),
            }
            n1 = da.next.expand();
            n2 = dc.next.expand();
        }
        assert!(n1.is_none() && n2.is_none());

        // The copied jump is threaded into the copied label's chain.
        let jne = b2
            .list()
            .node(b2.list().first_node().unwrap())
            .next
            .expand()
            .unwrap();
        match &b2.list().node(jne).kind {
            NodeKind::Jump(j) => assert!(j.target.is_some()),
            _ => panic!("expected a jump node"),
        }
    }

    #[test]
    fn inline_comments_travel_with_nodes() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        b.state_mut().set_inline_comment("the answer");
        b.emit2(InstId::Mov, r0(), 42i64).unwrap();
        b.emit0(InstId::Ret).unwrap();

        let first = b.list().first_node().unwrap();
        let comment = b.list().node(first).comment.unwrap();
        assert_eq!(b.list().data_zone.get_str(comment), "the answer");
        let second = b.list().node(first).next.expand().unwrap();
        assert!(b.list().node(second).comment.is_none());
    }

    #[test]
    fn unfollowed_jumps_stay_out_of_the_index() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.state_mut().add_options(InstOptions::UNFOLLOW);
        b.emit1(InstId::Jmp, l).unwrap();
        b.bind(l).unwrap();

        let jump = b.list().first_node().unwrap();
        match &b.list().node(jump).kind {
            NodeKind::Jump(j) => assert!(j.target.is_none()),
            _ => panic!("expected a jump node"),
        }
        let label = b.list().node(jump).next.expand().unwrap();
        assert_eq!(b.list().node(label).label_data().unwrap().num_refs, 0);

        // A register-target jump is implicitly unfollowed.
        b.emit1(InstId::Jmp, r0()).unwrap();
        let tail = b.list().last_node().unwrap();
        match &b.list().node(tail).kind {
            NodeKind::Jump(j) => {
                assert!(j.target.is_none());
                assert!(b.list().node(tail).options.contains(InstOptions::UNFOLLOW));
            }
            _ => panic!("expected a jump node"),
        }
    }

    #[test]
    fn binding_an_already_listed_label_fails() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        let l = b.new_label();
        b.bind(l).unwrap();
        assert_eq!(b.bind(l), Err(Error::LabelAlreadyBound));
    }

    #[test]
    fn strict_validation_rejects_and_aborts_emit() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        b.state_mut().add_options(InstOptions::STRICT_VALIDATION);
        assert_eq!(
            b.emit2(InstId::Add, 1i64, r0()),
            Err(Error::InvalidOperand)
        );
        assert_eq!(b.list().first_node(), None);

        // The validation flag applies to one emit only and never reaches a
        // recorded node.
        b.state_mut().reset_last_error();
        b.state_mut().add_options(InstOptions::STRICT_VALIDATION);
        b.emit2(InstId::Add, r0(), r1()).unwrap();
        let node = b.list().first_node().unwrap();
        assert!(!b
            .list()
            .node(node)
            .options
            .contains(InstOptions::STRICT_VALIDATION));
    }

    #[test]
    fn large_embeds_spill_to_the_zone() {
        let mut code = holder();
        let mut b = Builder::new(&mut code);
        b.embed(&[7u8; 8]).unwrap();
        b.embed(&[9u8; 64]).unwrap();
        let small = b.list().first_node().unwrap();
        let large = b.list().node(small).next.expand().unwrap();
        assert!(matches!(
            b.list().node(small).kind,
            NodeKind::Data(DataBytes::Inline { len: 8, .. })
        ));
        assert!(matches!(
            b.list().node(large).kind,
            NodeKind::Data(DataBytes::Blob(_))
        ));
        assert_eq!(b.list().data_of(large), &[9u8; 64]);
    }
}
