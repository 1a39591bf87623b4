//! End-to-end tests driving the public API: build, serialize, relocate.

use jitcode::{
    AlignMode, ArchType, Assembler, Builder, CodeHolder, CodeInfo, Compiler, ConstPool,
    ConstScope, Emitter, Error, ErrorHandler, FuncSignature, Hints, InstId, InstOptions,
    Operand, Reg, ValueType,
};

fn holder() -> CodeHolder {
    CodeHolder::new(CodeInfo::new(ArchType::X64))
}

#[test]
fn builder_pipeline_produces_the_same_bytes_as_direct_emission() {
    // Direct encoding.
    let mut direct = holder();
    {
        let mut a = Assembler::new(&mut direct).unwrap();
        let l = a.new_label();
        a.emit2(InstId::Xor, Reg::gp32(0), Reg::gp32(0)).unwrap();
        a.bind(l).unwrap();
        a.emit2(InstId::Add, Reg::gp32(0), 1i32).unwrap();
        a.emit2(InstId::Cmp, Reg::gp32(0), 10i32).unwrap();
        a.emit1(InstId::Jne, l).unwrap();
        a.emit0(InstId::Ret).unwrap();
    }

    // The same program recorded as nodes and serialized afterwards.
    let mut deferred = holder();
    {
        let mut b = Builder::new(&mut deferred);
        let l = b.new_label();
        b.emit2(InstId::Xor, Reg::gp32(0), Reg::gp32(0)).unwrap();
        b.bind(l).unwrap();
        b.emit2(InstId::Add, Reg::gp32(0), 1i32).unwrap();
        b.emit2(InstId::Cmp, Reg::gp32(0), 10i32).unwrap();
        b.emit1(InstId::Jne, l).unwrap();
        b.emit0(InstId::Ret).unwrap();
        b.finalize().unwrap();
    }

    let direct_bytes = &direct.section(direct.text_section()).unwrap().buffer.data;
    let deferred_bytes = &deferred
        .section(deferred.text_section())
        .unwrap()
        .buffer
        .data;
    // The direct encoder can use the short backward form; the deferred
    // list replays through the same encoder, so both images agree.
    assert_eq!(direct_bytes, deferred_bytes);
    assert!(!direct_bytes.is_empty());
}

#[test]
fn relocated_image_is_byte_exact() {
    let mut code = holder();
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let data = a.new_label();
        a.emit2(InstId::Mov, Reg::gp32(0), 7i32).unwrap();
        a.emit0(InstId::Ret).unwrap();
        a.align(AlignMode::Data, 8).unwrap();
        a.bind(data).unwrap();
        a.embed(&0xDEAD_BEEF_u32.to_le_bytes()).unwrap();
        a.embed_label(data).unwrap();
    }

    let size = code.code_size();
    let mut image = vec![0u8; size];
    let used = code.relocate(&mut image, 0x10_0000).unwrap();
    assert_eq!(used, size);

    // mov eax, 7; ret; padding to 8; the data word; its own absolute
    // address.
    assert_eq!(&image[0..5], &[0xB8, 7, 0, 0, 0]);
    assert_eq!(image[5], 0xC3);
    assert_eq!(&image[8..12], &0xDEAD_BEEF_u32.to_le_bytes());
    assert_eq!(&image[12..20], &(0x10_0000u64 + 8).to_le_bytes());
}

#[test]
fn compiled_function_relocates_with_a_trampoline() {
    let mut code = holder();
    {
        let mut cc = Compiler::new(&mut code);
        let sig = FuncSignature::new(jitcode::CallConv::SysV64)
            .returns(ValueType::I64)
            .arg(ValueType::I64);
        cc.add_func(&sig).unwrap();
        let a = cc.new_gp64();
        cc.set_arg(0, a).unwrap();
        let call = cc
            .add_call(Operand::Imm(0x7FFF_FFFF_0000), &sig)
            .unwrap();
        cc.set_call_arg(call, 0, Operand::Reg(a)).unwrap();
        let r = cc.new_gp64();
        cc.set_call_ret(call, 0, r).unwrap();
        cc.add_ret(Operand::Reg(r), Operand::None).unwrap();
        cc.end_func().unwrap();
        cc.finalize().unwrap();
    }

    let text_len = code
        .section(code.text_section())
        .unwrap()
        .buffer
        .data
        .len();
    let size = code.code_size();
    assert!(size > text_len, "worst case includes the trampoline");

    let mut image = vec![0u8; size];
    let used = code.relocate(&mut image, 0x1000).unwrap();
    assert_eq!(used, size, "far target forces the trampoline");
    // The stub is an indirect jump through the absolute address stored
    // right behind it.
    assert_eq!(&image[text_len..text_len + 2], &[0xFF, 0x25]);
    assert_eq!(
        &image[text_len + 6..text_len + 14],
        &0x7FFF_FFFF_0000u64.to_le_bytes()
    );
}

struct Forgiving {
    seen: Vec<Error>,
}

impl ErrorHandler for Forgiving {
    fn handle_error(&mut self, err: Error, _context: &str) -> bool {
        self.seen.push(err);
        true
    }
}

#[test]
fn handled_errors_are_returned_but_not_latched() {
    let mut code = holder();
    code.set_error_handler(Box::new(Forgiving { seen: Vec::new() }));
    let mut a = Assembler::new(&mut code).unwrap();
    let l = a.new_label();
    a.bind(l).unwrap();

    // The handler marks the error handled: the call still fails but the
    // emitter stays usable.
    assert_eq!(a.bind(l), Err(Error::LabelAlreadyBound));
    assert_eq!(a.state().last_error(), None);
    assert!(a.emit0(InstId::Nop).is_ok());
}

#[test]
fn predicted_jumps_hint_adds_branch_prefixes() {
    let mut code = holder();
    code.set_global_hints(Hints::OPTIMIZED_ALIGN | Hints::PREDICTED_JUMPS);
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let l = a.new_label();
        a.bind(l).unwrap();
        a.state_mut().add_options(InstOptions::TAKEN);
        a.emit1(InstId::Je, l).unwrap();
        a.state_mut().add_options(InstOptions::NOT_TAKEN);
        a.emit1(InstId::Jne, l).unwrap();
    }
    let bytes = &code.section(code.text_section()).unwrap().buffer.data;
    assert_eq!(bytes[0], 0x3E, "taken hint");
    // Short backward form follows the prefix.
    assert_eq!(bytes[1], 0x74);
    let second = 3;
    assert_eq!(bytes[second], 0x2E, "not-taken hint");
    assert_eq!(bytes[second + 1], 0x75);
}

#[test]
fn const_pool_round_trips_through_the_compiler() {
    let mut code = holder();
    let pool_label;
    {
        let mut cc = Compiler::new(&mut code);
        let sig = FuncSignature::new(jitcode::CallConv::SysV64).returns(ValueType::I64);
        cc.add_func(&sig).unwrap();
        let (label, offset) = cc
            .new_const(ConstScope::Local, &0x1122_3344_5566_7788u64.to_le_bytes())
            .unwrap();
        assert_eq!(offset, 0);
        pool_label = label;
        let v = cc.new_gp64();
        cc.emit2(InstId::Mov, v, 1i64).unwrap();
        cc.add_ret(Operand::Reg(v), Operand::None).unwrap();
        cc.end_func().unwrap();
        cc.finalize().unwrap();
    }

    let bytes = &code.section(code.text_section()).unwrap().buffer.data;
    let at = code.label_offset(pool_label).unwrap() as usize;
    assert_eq!(at % 8, 0);
    assert_eq!(
        &bytes[at..at + 8],
        &0x1122_3344_5566_7788u64.to_le_bytes()
    );
}

#[test]
fn standalone_const_pool_embeds_via_any_emitter() {
    let mut code = holder();
    {
        let mut a = Assembler::new(&mut code).unwrap();
        let l = a.new_label();
        let mut pool = ConstPool::new();
        let off = pool.add4(0xAABB_CCDD).unwrap();
        assert_eq!(off, 0);
        a.emit0(InstId::Nop).unwrap();
        a.embed_const_pool(l, &pool).unwrap();
    }
    let bytes = &code.section(code.text_section()).unwrap().buffer.data;
    // nop, pad to 4, then the constant.
    assert_eq!(bytes[0], 0x90);
    assert_eq!(&bytes[4..8], &0xAABB_CCDDu32.to_le_bytes());
}

#[test]
fn holders_with_identical_code_info_compare_equal() {
    let a = holder();
    let b = holder();
    let c = CodeHolder::new(CodeInfo::new(ArchType::X86));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.code_info().gp_size(), 8);
    assert_eq!(c.code_info().gp_size(), 4);
}
