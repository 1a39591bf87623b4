//! `CodeHolder`: the owner of everything the attached emitters share.
//!
//! A holder owns the section table with its code buffers, the label table
//! with pending label links, the relocation list, and the global options
//! propagated to every emitter attached to it. Emitters borrow the holder
//! for the duration of their attachment; the borrow checker guarantees that
//! two emitters never mutate the holder at the same time, and a runtime
//! flag guards the unique direct-encoder slot across the transient
//! assembler constructed by `Compiler::finalize`.
//!
//! The relocation model follows the classic two-phase scheme: emitters
//! record sites (`RelocEntry`) while writing section-relative bytes, and
//! [`CodeHolder::relocate`] places sections at their final offsets, copies
//! the bytes, and patches every site against the chosen base address,
//! appending trampolines for relative sites whose displacement cannot reach
//! its target.

use bitflags::bitflags;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use log::trace;
use smallvec::SmallVec;

use crate::error::{CodeResult, Error};
use crate::inst::{Hints, InstOptions};
use crate::operand::{pack_id, unpack_id, Label};

/// Maximum length of a section name, in bytes.
pub const SECTION_NAME_MAX: usize = 35;

/// Offset value of an unbound label (the -1 sentinel).
pub const UNBOUND_OFFSET: u32 = 0xFFFF_FFFF;

/// Size of one trampoline stub: `jmp [rip+0]` followed by the 8-byte
/// absolute target.
pub const TRAMPOLINE_SIZE: u32 = 14;

/// Target architecture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchType {
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X64,
}

impl ArchType {
    /// Size of a general-purpose register in bytes.
    pub fn gp_size(self) -> u8 {
        match self {
            ArchType::X86 => 4,
            ArchType::X64 => 8,
        }
    }

    /// Number of addressable general-purpose registers.
    pub fn gp_count(self) -> u8 {
        match self {
            ArchType::X86 => 8,
            ArchType::X64 => 16,
        }
    }
}

/// Calling convention identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallConv {
    /// No convention selected.
    None,
    /// 32-bit cdecl.
    CDecl,
    /// 32-bit stdcall.
    StdCall,
    /// 32-bit fastcall.
    FastCall,
    /// System V AMD64.
    SysV64,
    /// Windows x64.
    Win64,
}

/// Immutable-after-construction description of the code a holder contains:
/// target architecture, stack alignment, default calling conventions, and
/// an optional fixed base address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodeInfo {
    /// Target architecture.
    pub arch: ArchType,
    /// Natural stack alignment the target requires.
    pub stack_alignment: u8,
    /// Default convention for cdecl-style calls.
    pub cdecl_call_conv: CallConv,
    /// Default convention for stdcall-style calls.
    pub std_call_conv: CallConv,
    /// Default convention for fastcall-style calls.
    pub fast_call_conv: CallConv,
    /// Base address the code will be loaded at, if known up front.
    pub base_address: Option<u64>,
}

impl CodeInfo {
    /// Create a descriptor with the architecture's natural defaults.
    pub fn new(arch: ArchType) -> Self {
        match arch {
            ArchType::X86 => Self {
                arch,
                stack_alignment: 4,
                cdecl_call_conv: CallConv::CDecl,
                std_call_conv: CallConv::StdCall,
                fast_call_conv: CallConv::FastCall,
                base_address: None,
            },
            ArchType::X64 => Self {
                arch,
                stack_alignment: 16,
                cdecl_call_conv: CallConv::SysV64,
                std_call_conv: CallConv::SysV64,
                fast_call_conv: CallConv::SysV64,
                base_address: None,
            },
        }
    }

    /// Size of a general-purpose register in bytes.
    pub fn gp_size(&self) -> u8 {
        self.arch.gp_size()
    }

    /// Number of addressable general-purpose registers.
    pub fn gp_count(&self) -> u8 {
        self.arch.gp_count()
    }
}

bitflags! {
    /// Section attribute flags.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct SectionFlags: u32 {
        /// The section holds executable code.
        const EXEC = 0x0000_0001;
        /// The section is read-only.
        const CONST = 0x0000_0002;
        /// The section is zero-initialized by the loader.
        const ZERO = 0x0000_0004;
        /// Informational section, not loaded.
        const INFO = 0x0000_0008;
    }
}

/// An opaque reference to a section of a holder.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Section(u32);
entity_impl!(Section, "section");

/// An opaque reference to a pending label link record.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Link(u32);
entity_impl!(Link, "link");

/// A growable or fixed code buffer owned by a section.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    /// Emitted bytes.
    pub data: Vec<u8>,
    /// The buffer was handed in from outside rather than allocated here.
    pub is_external: bool,
    /// The buffer must not grow beyond its current capacity.
    pub is_fixed_size: bool,
}

/// A named region of code or data.
#[derive(Debug)]
pub struct SectionEntry {
    /// Section name, at most [`SECTION_NAME_MAX`] bytes.
    pub name: String,
    /// Attribute flags.
    pub flags: SectionFlags,
    /// Required alignment of the section start, a power of two (0 = none).
    pub alignment: u32,
    /// The bytes of the section.
    pub buffer: CodeBuffer,
}

/// Label table entry: the bound offset (or the unbound sentinel) and the
/// head of the pending-link chain.
#[derive(Debug)]
pub struct LabelEntry {
    /// Byte offset into the owning section, or [`UNBOUND_OFFSET`].
    pub offset: u32,
    /// Singly-linked chain of patch sites waiting for this label.
    pub links: PackedOption<Link>,
}

impl LabelEntry {
    /// Whether the label has been bound to an offset.
    pub fn is_bound(&self) -> bool {
        self.offset != UNBOUND_OFFSET
    }
}

/// A pending patch site referring to a not-yet-bound label.
#[derive(Debug)]
pub struct LabelLink {
    /// Next link in the label's chain.
    pub prev: PackedOption<Link>,
    /// Offset of the patch site in the section.
    pub offset: u32,
    /// Inline displacement added to the resolved target.
    pub displacement: i32,
    /// Relocation to complete at bind time, or
    /// [`INVALID_ID`](crate::operand::INVALID_ID).
    pub reloc_id: u32,
}

/// Relocation kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute site, absolute target: write `base + data`.
    AbsToAbs,
    /// Relative site converted to an absolute value: write `base + data`.
    RelToAbs,
    /// Absolute target encoded into a relative field; overflow is an error.
    AbsToRel,
    /// Like `AbsToRel`, but overflow falls back to a trampoline stub.
    Trampoline,
}

/// One relocation record.
#[derive(Copy, Clone, Debug)]
pub struct RelocEntry {
    /// Relocation kind.
    pub kind: RelocKind,
    /// Patched field width, 4 or 8 bytes.
    pub size: u8,
    /// Offset of the patched field. Relocated sites live in the default
    /// section, which is always placed at image offset zero.
    pub from: u64,
    /// Target: image offset for the `*ToAbs` kinds, absolute address for
    /// `AbsToRel` and `Trampoline`.
    pub data: u64,
}

/// Hook consulted when an emitter is about to latch an error.
///
/// Returning `true` marks the error handled: it is still returned to the
/// caller, but the emitter does not enter the error state.
pub trait ErrorHandler {
    /// React to `err` raised in `context`.
    fn handle_error(&mut self, err: Error, context: &str) -> bool;
}

/// Owner of sections, labels, relocations, and the state shared by all
/// attached emitters.
pub struct CodeHolder {
    code_info: CodeInfo,
    global_hints: Hints,
    global_options: InstOptions,
    sections: PrimaryMap<Section, SectionEntry>,
    labels: Vec<LabelEntry>,
    links: PrimaryMap<Link, LabelLink>,
    unused_links: PackedOption<Link>,
    relocs: Vec<RelocEntry>,
    trampolines_size: u32,
    error_handler: Option<Box<dyn ErrorHandler>>,
    pub(crate) asm_attached: bool,
}

impl CodeHolder {
    /// Create a holder for code described by `info`. The default section
    /// (id 0, ".text", executable) exists from the start.
    pub fn new(info: CodeInfo) -> Self {
        let mut sections = PrimaryMap::new();
        sections.push(SectionEntry {
            name: ".text".to_string(),
            flags: SectionFlags::EXEC,
            alignment: 0,
            buffer: CodeBuffer::default(),
        });
        Self {
            code_info: info,
            global_hints: Hints::OPTIMIZED_ALIGN,
            global_options: InstOptions::empty(),
            sections,
            labels: Vec::new(),
            links: PrimaryMap::new(),
            unused_links: None.into(),
            relocs: Vec::new(),
            trampolines_size: 0,
            error_handler: None,
            asm_attached: false,
        }
    }

    /// Discard all code, labels and relocations while keeping the
    /// architecture description. With `release_memory` the buffers are
    /// returned to the system instead of being kept for reuse.
    pub fn reset(&mut self, release_memory: bool) {
        debug_assert!(!self.asm_attached, "cannot reset with an attached encoder");
        if self.sections.len() > 1 || release_memory {
            let mut sections = PrimaryMap::new();
            sections.push(SectionEntry {
                name: ".text".to_string(),
                flags: SectionFlags::EXEC,
                alignment: 0,
                buffer: CodeBuffer::default(),
            });
            self.sections = sections;
        } else {
            for (_, entry) in self.sections.iter_mut() {
                entry.buffer.data.clear();
            }
        }
        self.labels.clear();
        self.links.clear();
        self.unused_links = None.into();
        self.relocs.clear();
        self.trampolines_size = 0;
    }

    /// The code description this holder was created with.
    pub fn code_info(&self) -> &CodeInfo {
        &self.code_info
    }

    /// Global hints propagated to attached emitters.
    pub fn global_hints(&self) -> Hints {
        self.global_hints
    }

    /// Replace the global hints. Takes effect for emitters attached later.
    pub fn set_global_hints(&mut self, hints: Hints) {
        self.global_hints = hints;
    }

    /// Global options merged into every emitted instruction.
    pub fn global_options(&self) -> InstOptions {
        self.global_options
    }

    /// Replace the global options. Takes effect for emitters attached later.
    pub fn set_global_options(&mut self, options: InstOptions) {
        self.global_options = options;
    }

    /// Install an error handler consulted before an emitter latches an
    /// error.
    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    /// Remove the error handler.
    pub fn reset_error_handler(&mut self) {
        self.error_handler = None;
    }

    pub(crate) fn consult_error_handler(&mut self, err: Error, context: &str) -> bool {
        match self.error_handler.as_mut() {
            Some(handler) => handler.handle_error(err, context),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Sections and buffers.
    // ------------------------------------------------------------------

    /// The default text section.
    pub fn text_section(&self) -> Section {
        Section::from_u32(0)
    }

    /// Add a section. The name must be at most [`SECTION_NAME_MAX`] bytes
    /// and `alignment` must be zero or a power of two.
    pub fn new_section(
        &mut self,
        name: &str,
        flags: SectionFlags,
        alignment: u32,
    ) -> CodeResult<Section> {
        if name.len() > SECTION_NAME_MAX {
            return Err(Error::InvalidSection);
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(Error::InvalidSection);
        }
        let section = self.sections.push(SectionEntry {
            name: name.to_string(),
            flags,
            alignment,
            buffer: CodeBuffer::default(),
        });
        trace!("CodeHolder: new section {} ({:?})", name, section);
        Ok(section)
    }

    /// Access a section entry.
    pub fn section(&self, section: Section) -> CodeResult<&SectionEntry> {
        self.sections.get(section).ok_or(Error::InvalidSection)
    }

    /// Access a section entry mutably.
    pub fn section_mut(&mut self, section: Section) -> CodeResult<&mut SectionEntry> {
        self.sections.get_mut(section).ok_or(Error::InvalidSection)
    }

    /// Number of sections, including the default one.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Grow a section's buffer so that `n` more bytes fit, doubling the
    /// capacity until they do. Fixed-size and external buffers refuse.
    pub fn grow_buffer(&mut self, section: Section, n: usize) -> CodeResult<()> {
        let entry = self.sections.get_mut(section).ok_or(Error::InvalidSection)?;
        let buf = &mut entry.buffer;
        let needed = buf.data.len() + n;
        if needed <= buf.data.capacity() {
            return Ok(());
        }
        if buf.is_fixed_size || buf.is_external {
            return Err(Error::CodeTooLarge);
        }
        let mut capacity = buf.data.capacity().max(64);
        while capacity < needed {
            capacity *= 2;
        }
        trace!(
            "CodeHolder: grow buffer of {:?} to capacity {}",
            section,
            capacity
        );
        buf.data.reserve_exact(capacity - buf.data.len());
        Ok(())
    }

    /// Make sure a section's buffer capacity is at least `n` bytes.
    pub fn reserve_buffer(&mut self, section: Section, n: usize) -> CodeResult<()> {
        let entry = self.sections.get_mut(section).ok_or(Error::InvalidSection)?;
        let buf = &mut entry.buffer;
        if n <= buf.data.capacity() {
            return Ok(());
        }
        if buf.is_fixed_size || buf.is_external {
            return Err(Error::FixedBufferTooSmall);
        }
        buf.data.reserve_exact(n - buf.data.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Labels.
    // ------------------------------------------------------------------

    /// Register a fresh, unbound label and return its handle.
    pub fn new_label_id(&mut self) -> CodeResult<Label> {
        let index = self.labels.len() as u32;
        self.labels.push(LabelEntry {
            offset: UNBOUND_OFFSET,
            links: None.into(),
        });
        trace!("CodeHolder: new label index {}", index);
        Ok(Label::from_id(pack_id(index)))
    }

    /// Number of labels registered so far.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Whether `label` was registered with this holder.
    pub fn is_label_valid(&self, label: Label) -> bool {
        label.is_valid() && (unpack_id(label.id()) as usize) < self.labels.len()
    }

    /// Whether `label` has been bound. Returns `false` for invalid labels.
    pub fn is_label_bound(&self, label: Label) -> bool {
        self.label_entry(label).map_or(false, LabelEntry::is_bound)
    }

    /// The bound offset of `label`, or `None` when unbound or invalid.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.label_entry(label)
            .filter(|e| e.is_bound())
            .map(|e| e.offset)
    }

    /// The label table entry for `label`, if valid.
    pub fn label_entry(&self, label: Label) -> Option<&LabelEntry> {
        if !label.is_valid() {
            return None;
        }
        self.labels.get(unpack_id(label.id()) as usize)
    }

    pub(crate) fn label_entry_mut(&mut self, label: Label) -> Option<&mut LabelEntry> {
        if !label.is_valid() {
            return None;
        }
        self.labels.get_mut(unpack_id(label.id()) as usize)
    }

    /// Record a patch site waiting for `label`, pulling the record from the
    /// free list when one is available.
    pub fn new_label_link(
        &mut self,
        label: Label,
        offset: u32,
        displacement: i32,
        reloc_id: u32,
    ) -> CodeResult<Link> {
        let index = unpack_id(label.id()) as usize;
        if index >= self.labels.len() {
            return Err(Error::InvalidLabel);
        }
        let prev = self.labels[index].links;
        let link = match self.unused_links.expand() {
            Some(link) => {
                self.unused_links = self.links[link].prev;
                self.links[link] = LabelLink {
                    prev,
                    offset,
                    displacement,
                    reloc_id,
                };
                link
            }
            None => self.links.push(LabelLink {
                prev,
                offset,
                displacement,
                reloc_id,
            }),
        };
        self.labels[index].links = link.into();
        trace!(
            "CodeHolder: label link for index {} at offset {}",
            index,
            offset
        );
        Ok(link)
    }

    /// Access a link record.
    pub fn link(&self, link: Link) -> &LabelLink {
        &self.links[link]
    }

    /// Return a consumed link record to the free list.
    pub(crate) fn release_link(&mut self, link: Link) {
        self.links[link].prev = self.unused_links;
        self.unused_links = link.into();
    }

    // ------------------------------------------------------------------
    // Relocations.
    // ------------------------------------------------------------------

    /// Record a relocation and return its id.
    pub fn add_reloc(&mut self, entry: RelocEntry) -> u32 {
        let id = self.relocs.len() as u32;
        if entry.kind == RelocKind::Trampoline {
            self.trampolines_size += TRAMPOLINE_SIZE;
        }
        self.relocs.push(entry);
        id
    }

    /// The recorded relocations.
    pub fn relocs(&self) -> &[RelocEntry] {
        &self.relocs
    }

    pub(crate) fn reloc_mut(&mut self, id: u32) -> Option<&mut RelocEntry> {
        self.relocs.get_mut(id as usize)
    }

    /// Worst-case size of the trampoline area.
    pub fn trampolines_size(&self) -> u32 {
        self.trampolines_size
    }

    // ------------------------------------------------------------------
    // Finalization.
    // ------------------------------------------------------------------

    /// Worst-case number of bytes [`CodeHolder::relocate`] may write:
    /// all sections at their alignments plus all possible trampolines.
    pub fn code_size(&self) -> usize {
        let mut offset = 0usize;
        for (_, entry) in self.sections.iter() {
            let align = entry.alignment.max(1) as usize;
            offset = align_up(offset, align);
            offset += entry.buffer.data.len();
        }
        offset + self.trampolines_size as usize
    }

    /// Copy all sections into `dst`, assuming the image will live at
    /// `base`, and patch every relocation. Returns the number of bytes
    /// actually used, which is less than [`CodeHolder::code_size`] when
    /// trampolines go unused.
    pub fn relocate(&self, dst: &mut [u8], base: u64) -> CodeResult<usize> {
        // Place and copy the sections in id order.
        let mut placements: SmallVec<[usize; 4]> = SmallVec::new();
        let mut offset = 0usize;
        for (_, entry) in self.sections.iter() {
            let align = entry.alignment.max(1) as usize;
            let placed = align_up(offset, align);
            placements.push(placed);
            offset = placed + entry.buffer.data.len();
        }
        let code_end = offset;
        if dst.len() < code_end {
            return Err(Error::CodeTooLarge);
        }
        dst[..code_end].fill(0);
        for ((_, entry), &placed) in self.sections.iter().zip(placements.iter()) {
            let len = entry.buffer.data.len();
            if !entry.flags.contains(SectionFlags::ZERO) {
                dst[placed..placed + len].copy_from_slice(&entry.buffer.data);
            }
        }

        // Patch relocations; trampolines are appended past the sections.
        let mut tramp_offset = code_end;
        for re in &self.relocs {
            let at = re.from as usize;
            if at + re.size as usize > code_end {
                return Err(Error::InvalidState);
            }
            match re.kind {
                RelocKind::AbsToAbs | RelocKind::RelToAbs => {
                    let value = base.wrapping_add(re.data);
                    write_abs(&mut dst[at..], value, re.size)?;
                }
                RelocKind::AbsToRel => {
                    let rel = rel32_to(re.data, base, re.from, re.size)
                        .ok_or(Error::DisplacementOverflow)?;
                    dst[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                }
                RelocKind::Trampoline => {
                    match rel32_to(re.data, base, re.from, re.size) {
                        Some(rel) => {
                            dst[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                        }
                        None => {
                            // Out of range: route the jump through a stub
                            // appended to the end of the image.
                            if tramp_offset + TRAMPOLINE_SIZE as usize > dst.len() {
                                return Err(Error::CodeTooLarge);
                            }
                            trace!(
                                "CodeHolder: trampoline at {} for target {:#x}",
                                tramp_offset,
                                re.data
                            );
                            dst[tramp_offset..tramp_offset + 6]
                                .copy_from_slice(&[0xFF, 0x25, 0, 0, 0, 0]);
                            dst[tramp_offset + 6..tramp_offset + TRAMPOLINE_SIZE as usize]
                                .copy_from_slice(&re.data.to_le_bytes());
                            let rel = (tramp_offset as i64)
                                - (re.from as i64 + re.size as i64);
                            dst[at..at + 4]
                                .copy_from_slice(&(rel as i32).to_le_bytes());
                            tramp_offset += TRAMPOLINE_SIZE as usize;
                        }
                    }
                }
            }
        }
        Ok(tramp_offset)
    }
}

impl PartialEq for CodeHolder {
    fn eq(&self, other: &Self) -> bool {
        self.code_info == other.code_info
    }
}

impl std::fmt::Debug for CodeHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeHolder")
            .field("code_info", &self.code_info)
            .finish()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

fn write_abs(dst: &mut [u8], value: u64, size: u8) -> CodeResult<()> {
    match size {
        8 => dst[..8].copy_from_slice(&value.to_le_bytes()),
        4 => {
            let narrow = u32::try_from(value).map_err(|_| Error::DisplacementOverflow)?;
            dst[..4].copy_from_slice(&narrow.to_le_bytes());
        }
        _ => return Err(Error::InvalidState),
    }
    Ok(())
}

/// Displacement from the end of the patched field to an absolute target,
/// when it fits in 32 bits.
fn rel32_to(target: u64, base: u64, from: u64, size: u8) -> Option<i32> {
    let source = base.wrapping_add(from).wrapping_add(size as u64);
    let rel = target.wrapping_sub(source) as i64;
    i32::try_from(rel).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::INVALID_ID;

    #[test]
    fn holders_compare_by_code_info() {
        let a = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let b = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let c = CodeHolder::new(CodeInfo::new(ArchType::X86));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn label_table_basics() {
        let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let l0 = code.new_label_id().unwrap();
        let l1 = code.new_label_id().unwrap();
        assert_eq!(l0.index(), 0);
        assert_eq!(l1.index(), 1);
        assert!(code.is_label_valid(l0));
        assert!(!code.is_label_bound(l0));
        assert!(!code.is_label_valid(Label::from_id(pack_id(2))));
        assert!(!code.is_label_valid(Label::invalid()));
    }

    #[test]
    fn label_links_recycle_through_free_list() {
        let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let l = code.new_label_id().unwrap();
        let a = code.new_label_link(l, 4, 0, INVALID_ID).unwrap();
        let b = code.new_label_link(l, 12, 0, INVALID_ID).unwrap();
        assert_eq!(code.labels[0].links.expand(), Some(b));
        assert_eq!(code.link(b).prev.expand(), Some(a));

        code.labels[0].links = None.into();
        code.release_link(a);
        code.release_link(b);
        let c = code.new_label_link(l, 20, 0, INVALID_ID).unwrap();
        assert_eq!(c, b, "free list should hand back the last released link");
    }

    #[test]
    fn section_name_limit() {
        let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let long = "x".repeat(SECTION_NAME_MAX + 1);
        assert_eq!(
            code.new_section(&long, SectionFlags::CONST, 8),
            Err(Error::InvalidSection)
        );
        let ok = code.new_section(".rodata", SectionFlags::CONST, 8).unwrap();
        assert_eq!(code.section(ok).unwrap().name, ".rodata");
    }

    #[test]
    fn fixed_buffers_refuse_to_grow() {
        let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let text = code.text_section();
        {
            let buf = &mut code.section_mut(text).unwrap().buffer;
            buf.data.reserve_exact(16);
            buf.is_fixed_size = true;
        }
        assert!(code.grow_buffer(text, 8).is_ok());
        assert_eq!(code.grow_buffer(text, 64), Err(Error::CodeTooLarge));
        assert_eq!(code.reserve_buffer(text, 1024), Err(Error::FixedBufferTooSmall));
    }

    #[test]
    fn relocate_patches_absolute_and_relative() {
        let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let text = code.text_section();
        // 8 placeholder bytes for an absolute slot, then a rel32 slot at 12.
        code.section_mut(text).unwrap().buffer.data =
            vec![0, 0, 0, 0, 0, 0, 0, 0, 0x90, 0x90, 0x90, 0x90, 0, 0, 0, 0];
        code.add_reloc(RelocEntry {
            kind: RelocKind::AbsToAbs,
            size: 8,
            from: 0,
            data: 8,
        });
        code.add_reloc(RelocEntry {
            kind: RelocKind::AbsToRel,
            size: 4,
            from: 12,
            data: 0x2000,
        });
        let mut out = vec![0u8; code.code_size()];
        let used = code.relocate(&mut out, 0x1000).unwrap();
        assert_eq!(used, 16);
        assert_eq!(&out[0..8], &0x1008u64.to_le_bytes());
        // rel = 0x2000 - (0x1000 + 12 + 4)
        assert_eq!(&out[12..16], &0x0FF0u32.to_le_bytes());
    }

    #[test]
    fn relocate_uses_trampoline_when_out_of_range() {
        let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let text = code.text_section();
        // jmp rel32 with a zero placeholder.
        code.section_mut(text).unwrap().buffer.data = vec![0xE9, 0, 0, 0, 0];
        code.add_reloc(RelocEntry {
            kind: RelocKind::Trampoline,
            size: 4,
            from: 1,
            data: 0x7FFF_FFFF_F000,
        });
        assert_eq!(code.trampolines_size(), TRAMPOLINE_SIZE);

        let mut out = vec![0u8; code.code_size()];
        let used = code.relocate(&mut out, 0x1000).unwrap();
        assert_eq!(used, 5 + TRAMPOLINE_SIZE as usize);
        // The jump lands on the stub right after the section.
        let rel = i32::from_le_bytes(out[1..5].try_into().unwrap());
        assert_eq!(rel, 5 - (1 + 4));
        assert_eq!(&out[5..7], &[0xFF, 0x25]);
        assert_eq!(&out[11..19], &0x7FFF_FFFF_F000u64.to_le_bytes());

        // An in-range target needs no trampoline and uses fewer bytes.
        let mut code2 = CodeHolder::new(CodeInfo::new(ArchType::X64));
        let text2 = code2.text_section();
        code2.section_mut(text2).unwrap().buffer.data = vec![0xE9, 0, 0, 0, 0];
        code2.add_reloc(RelocEntry {
            kind: RelocKind::Trampoline,
            size: 4,
            from: 1,
            data: 0x3000,
        });
        let mut out2 = vec![0u8; code2.code_size()];
        let used2 = code2.relocate(&mut out2, 0x1000).unwrap();
        assert_eq!(used2, 5);
    }
}
