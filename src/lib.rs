//! Machine code generation library with JIT and AOT support for x86/x64.
//!
//! Code is produced by driving an [`Emitter`]: either the direct encoder
//! ([`Assembler`]), which streams bytes into a [`CodeHolder`] section, or
//! one of the deferred emitters ([`Builder`], [`Compiler`]), which record a
//! list of typed nodes that later passes can transform and then serialize
//! into the direct encoder. The holder owns everything the emitters share:
//! sections with their code buffers, the label table with pending patch
//! links, the relocation list, and global hints and options. After
//! emission, [`CodeHolder::relocate`] applies a base address and produces
//! the final, byte-exact image.
//!
//! A minimal round trip:
//!
//! ```
//! use jitcode::{ArchType, Assembler, CodeHolder, CodeInfo, Emitter, InstId, Reg};
//!
//! let mut code = CodeHolder::new(CodeInfo::new(ArchType::X64));
//! {
//!     let mut a = Assembler::new(&mut code)?;
//!     a.emit2(InstId::Mov, Reg::gp32(0), 42i32)?;
//!     a.emit0(InstId::Ret)?;
//! }
//! let mut image = vec![0u8; code.code_size()];
//! let used = code.relocate(&mut image, 0x1000)?;
//! assert_eq!(&image[..used], &[0xB8, 42, 0, 0, 0, 0xC3]);
//! # Ok::<(), jitcode::Error>(())
//! ```

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod assembler;
pub mod builder;
pub mod compiler;
pub mod const_pool;
pub mod emitter;
pub mod error;
pub mod holder;
pub mod inst;
pub mod operand;
mod regalloc;
pub mod zone;

pub use crate::assembler::Assembler;
pub use crate::builder::{Builder, Node, NodeFlags, NodeKind, NodeList};
pub use crate::compiler::{
    Compiler, ConstScope, FuncSignature, ValueType, VirtReg,
};
pub use crate::const_pool::ConstPool;
pub use crate::emitter::{Emitter, EmitterKind, EmitterState};
pub use crate::error::{CodeResult, Error};
pub use crate::holder::{
    ArchType, CallConv, CodeHolder, CodeInfo, ErrorHandler, RelocEntry, RelocKind, Section,
    SectionFlags,
};
pub use crate::inst::{AlignMode, Hints, InstId, InstOptions};
pub use crate::operand::{Label, Mem, Operand, Reg, RegKind};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
