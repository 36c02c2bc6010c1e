use crate::codegen::{
    emitter_for, Arith, Branch, BranchSite, CodeBuffer, CodegenError, EmitError, Emitter,
    MachineCode, Relocation, SymbolId, SymbolKind, SymbolTable, LIBC_DISPATCH,
};
use crate::config::{CompileOptions, OptLevel};
use crate::ir::{FunctionInfo, Label, ModuleInfo, Op, OpSink};
use crate::optimizer::OptimizationStats;

/// Everything one compilation owns.
///
/// A context is created per request and consumed by [`finish`](Self::finish),
/// so nothing carries over between compilations.
pub struct CompilationContext {
    options: CompileOptions,
    emitter: Box<dyn Emitter>,
    buf: CodeBuffer,
    symbols: SymbolTable,
    branches: Vec<Branch>,
    relocations: Vec<Relocation>,
    module: ModuleInfo,
    current: Option<(SymbolId, usize)>,
    labels: Vec<Option<usize>>,
    unresolved: Vec<(BranchSite, Label)>,
    // one-slot pending constant
    pending: Option<i32>,
    last_terminator: bool,
    stats: OptimizationStats,
    warnings: Vec<String>,
}

/// What a finished context hands back to the driver.
pub struct Generated {
    pub machine: MachineCode,
    pub stats: OptimizationStats,
    pub warnings: Vec<String>,
}

impl CompilationContext {
    pub fn new(options: &CompileOptions, limit: usize) -> Self {
        Self {
            options: options.clone(),
            emitter: emitter_for(options.arch),
            buf: CodeBuffer::new(limit),
            symbols: SymbolTable::new(),
            branches: Vec::new(),
            relocations: Vec::new(),
            module: ModuleInfo::default(),
            current: None,
            labels: Vec::new(),
            unresolved: Vec::new(),
            pending: None,
            last_terminator: false,
            stats: OptimizationStats::default(),
            warnings: Vec::new(),
        }
    }

    /// Run one emitter operation. In best-effort mode an unsupported
    /// operation is replaced by the target NOP and recorded as a warning.
    fn emit<T>(
        &mut self,
        f: impl FnOnce(&dyn Emitter, &mut CodeBuffer) -> Result<T, EmitError>,
    ) -> Result<Option<T>, CodegenError> {
        let start = self.buf.len();
        self.buf.mark_instruction();
        match f(self.emitter.as_ref(), &mut self.buf) {
            Ok(value) => Ok(Some(value)),
            Err(EmitError::Unsupported { arch, op }) if self.options.best_effort() => {
                self.buf.truncate(start);
                self.buf.emit_bytes(self.emitter.nop())?;
                let message = format!("{op} is not supported on {arch}; emitted NOP at {start:#x}");
                log::warn!("{message}");
                self.warnings.push(message);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<(), CodegenError> {
        if let Some(value) = self.pending.take() {
            self.emit(|e, b| e.const_i32(b, value))?;
        }
        Ok(())
    }

    fn arith(&mut self, op: Arith) -> Result<(), CodegenError> {
        self.emit(|e, b| e.arith(b, op))?;
        Ok(())
    }

    fn branch_to(
        &mut self,
        label: Label,
        f: impl FnOnce(&dyn Emitter, &mut CodeBuffer) -> Result<BranchSite, EmitError>,
    ) -> Result<(), CodegenError> {
        if let Some(site) = self.emit(f)? {
            self.unresolved.push((site, label));
        }
        Ok(())
    }

    fn call_symbol(
        &mut self,
        name: &str,
        f: impl FnOnce(&dyn Emitter, &mut CodeBuffer) -> Result<BranchSite, EmitError>,
    ) -> Result<(), CodegenError> {
        if let Some(site) = self.emit(f)? {
            let symbol = self.symbols.reference(name);
            self.relocations.push(Relocation {
                offset: site.offset,
                symbol,
                kind: site.kind,
            });
        }
        Ok(())
    }

    fn lower_op(&mut self, op: Op<'_>) -> Result<(), CodegenError> {
        match op {
            Op::Nop => {
                self.emit(|e, b| b.emit_bytes(e.nop()))?;
            }
            Op::Halt => {
                self.emit(|e, b| e.halt(b))?;
            }
            Op::Drop => {
                self.emit(|e, b| e.drop_top(b))?;
            }
            Op::Const(value) => {
                self.emit(|e, b| e.const_i32(b, value))?;
            }
            Op::ConstString(bytes) => {
                self.emit(|e, b| e.const_string(b, bytes))?;
            }
            Op::Add => self.arith(Arith::Add)?,
            Op::Sub => self.arith(Arith::Sub)?,
            Op::Mul => self.arith(Arith::Mul)?,
            Op::Div => self.arith(Arith::Div)?,
            Op::Mod => self.arith(Arith::Mod)?,
            Op::Compare(cmp) => {
                self.emit(|e, b| e.compare(b, cmp))?;
            }
            Op::Store(slot) => {
                self.emit(|e, b| e.store_local(b, slot))?;
            }
            Op::Load(slot) => {
                self.emit(|e, b| e.load_local(b, slot))?;
            }
            Op::Jump(label) => self.branch_to(label, |e, b| e.jump(b))?,
            Op::JumpIfFalse(label) => self.branch_to(label, |e, b| e.jump_if_false(b))?,
            Op::Call { function, argc } => {
                let name = self
                    .module
                    .functions
                    .get(function as usize)
                    .map(|f| f.name.clone())
                    .ok_or(CodegenError::UnknownFunction(function))?;
                self.call_symbol(&name, |e, b| e.call(b, argc))?;
            }
            Op::LibcCall { id, argc } => {
                self.call_symbol(LIBC_DISPATCH, |e, b| e.libc_call(b, id, argc))?;
            }
        }
        Ok(())
    }

    /// Close the image: calls to functions defined here become branches, the
    /// rest stay as relocations.
    pub fn finish(self) -> Result<Generated, CodegenError> {
        let (code, marks) = self.buf.into_parts();
        let mut branches = self.branches;
        let mut relocations = Vec::new();

        for reloc in self.relocations {
            match self.symbols.get(reloc.symbol) {
                Some(symbol) if symbol.kind == SymbolKind::Function => branches.push(Branch {
                    site: reloc.offset,
                    kind: reloc.kind,
                    target: symbol.offset,
                }),
                _ => relocations.push(reloc),
            }
        }

        let machine = MachineCode {
            arch: self.options.arch,
            code,
            marks,
            branches,
            symbols: self.symbols,
            relocations,
        };

        if machine.entry_offset().is_none() && self.options.module_kind.requires_main() {
            return Err(CodegenError::MissingMain);
        }

        Ok(Generated {
            machine,
            stats: self.stats,
            warnings: self.warnings,
        })
    }
}

impl OpSink for CompilationContext {
    type Error = CodegenError;

    fn begin_module(&mut self, module: &ModuleInfo) -> Result<(), CodegenError> {
        self.module = module.clone();
        Ok(())
    }

    fn begin_function(&mut self, function: &FunctionInfo) -> Result<(), CodegenError> {
        self.flush()?;
        let offset = self.buf.len();
        let exported = self.module.is_exported(&function.name);
        let id = self
            .symbols
            .define(&function.name, offset, exported)
            .ok_or_else(|| CodegenError::DuplicateSymbol(function.name.clone()))?;
        self.current = Some((id, offset));

        log::debug!(
            "function {} at {offset:#x} ({} param(s), {} slot(s))",
            function.name,
            function.params,
            function.locals
        );

        self.emit(|e, b| e.prologue(b, function.locals))?;
        let argc = function.params;
        for index in 0..argc {
            self.emit(|e, b| e.load_arg(b, index, argc))?;
            self.emit(|e, b| e.store_local(b, index as u32))?;
        }
        self.last_terminator = false;
        Ok(())
    }

    fn end_function(&mut self) -> Result<(), CodegenError> {
        self.flush()?;
        if !self.last_terminator {
            self.emit(|e, b| e.return_const(b, 0))?;
        }

        for (site, label) in std::mem::take(&mut self.unresolved) {
            let target = self
                .labels
                .get(label.0 as usize)
                .copied()
                .flatten()
                .ok_or(CodegenError::UnboundLabel(label.0))?;
            self.branches.push(Branch {
                site: site.offset,
                kind: site.kind,
                target,
            });
        }

        if let Some((id, start)) = self.current.take() {
            self.symbols.set_size(id, self.buf.len() - start);
        }
        self.last_terminator = false;
        Ok(())
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    fn bind(&mut self, label: Label) -> Result<(), CodegenError> {
        self.flush()?;
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(self.buf.len());
        }
        self.last_terminator = false;
        Ok(())
    }

    fn op(&mut self, op: Op<'_>) -> Result<(), CodegenError> {
        match (op, self.pending) {
            (Op::Const(value), _) => {
                self.flush()?;
                self.pending = Some(value);
            }
            (Op::Halt, Some(value)) => {
                self.pending = None;
                self.emit(|e, b| e.return_const(b, value))?;
            }
            (Op::Add, Some(value)) if self.options.folds_constants() => {
                self.pending = None;
                self.emit(|e, b| e.add_imm(b, value))?;
                self.stats.constants_folded += 1;
            }
            (Op::Nop, _) if self.options.opt_level >= OptLevel::O1 => {
                self.stats.dead_code_eliminated += 1;
                return Ok(());
            }
            (op, _) => {
                self.flush()?;
                self.lower_op(op)?;
            }
        }
        self.last_terminator = op.is_terminator();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Arch, CodegenMode, ModuleKind};
    use crate::ir::Cmp;

    fn function(name: &str, params: u16, locals: u16) -> FunctionInfo {
        FunctionInfo {
            name: name.into(),
            params,
            locals,
        }
    }

    fn run(options: &CompileOptions, ops: &[Op<'_>]) -> Result<Generated, CodegenError> {
        let main = function("main", 0, 1);
        let module = ModuleInfo {
            functions: vec![main.clone()],
            ..ModuleInfo::default()
        };
        let mut ctx = CompilationContext::new(options, 1 << 16);
        ctx.begin_module(&module)?;
        ctx.begin_function(&main)?;
        for op in ops {
            ctx.op(*op)?;
        }
        ctx.end_function()?;
        ctx.finish()
    }

    #[test]
    fn test_const_halt_becomes_return_const() {
        let out = run(&CompileOptions::new(Arch::X86_64), &[Op::Const(7), Op::Halt]).unwrap();
        assert_eq!(
            &out.machine.code[8..],
            &[0xB8, 7, 0, 0, 0, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
        assert_eq!(out.machine.symbols.lookup("main").unwrap().size, out.machine.code.len());
    }

    #[test]
    fn test_const_add_folds_only_when_enabled() {
        let ops = [Op::Load(0), Op::Const(5), Op::Add, Op::Halt];

        let plain = run(&CompileOptions::new(Arch::X86_64), &ops).unwrap();
        assert_eq!(plain.stats.constants_folded, 0);

        let folded = CompileOptions::new(Arch::X86_64).with_opt_level(OptLevel::O1);
        let out = run(&folded, &ops).unwrap();
        assert_eq!(out.stats.constants_folded, 1);
        assert!(out
            .machine
            .code
            .windows(5)
            .any(|w| w == [0x48, 0x83, 0x04, 0x24, 0x05]));
    }

    #[test]
    fn test_pending_constant_flushes_on_other_ops() {
        let out = run(
            &CompileOptions::new(Arch::X86_64).with_opt_level(OptLevel::O1),
            &[Op::Const(1), Op::Const(2), Op::Compare(Cmp::Lt), Op::Halt],
        )
        .unwrap();
        // both constants materialised as pushes
        assert!(out.machine.code.windows(4).any(|w| w == [0x6A, 1, 0x6A, 2]));
        assert_eq!(out.stats.constants_folded, 0);
    }

    #[test]
    fn test_missing_return_gets_implicit_zero() {
        let out = run(&CompileOptions::new(Arch::X86_64), &[Op::Const(3), Op::Drop]).unwrap();
        assert!(out.machine.code.ends_with(&[0xB8, 0, 0, 0, 0, 0x48, 0x89, 0xEC, 0x5D, 0xC3]));
    }

    #[test]
    fn test_best_effort_substitutes_nop() {
        let ops = [Op::Const(6), Op::Const(3), Op::Div, Op::Halt];

        let strict = run(&CompileOptions::new(Arch::Arm32), &ops);
        assert!(matches!(strict, Err(CodegenError::Unsupported { .. })));

        let lenient = CompileOptions::new(Arch::Arm32).with_mode(CodegenMode::BestEffort);
        let out = run(&lenient, &ops).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.machine.code.windows(4).any(|w| w == [0x00, 0x00, 0xA0, 0xE1]));
    }

    #[test]
    fn test_missing_main_depends_on_module_kind() {
        let helper = function("helper", 0, 0);
        let module = ModuleInfo {
            functions: vec![helper.clone()],
            ..ModuleInfo::default()
        };
        let build = |kind: ModuleKind| -> Result<Generated, CodegenError> {
            let options = CompileOptions::new(Arch::X86_64).with_module_kind(kind);
            let mut ctx = CompilationContext::new(&options, 4096);
            ctx.begin_module(&module)?;
            ctx.begin_function(&helper)?;
            ctx.end_function()?;
            ctx.finish()
        };
        assert!(matches!(build(ModuleKind::User), Err(CodegenError::MissingMain)));
        assert!(build(ModuleKind::Libc).is_ok());
    }

    #[test]
    fn test_libc_call_stays_relocated() {
        let out = run(
            &CompileOptions::new(Arch::Arm64),
            &[Op::Const(65), Op::LibcCall { id: 0x81, argc: 1 }, Op::Halt],
        )
        .unwrap();
        assert_eq!(out.machine.relocations.len(), 1);
        let reloc = &out.machine.relocations[0];
        assert_eq!(out.machine.symbols.get(reloc.symbol).unwrap().name, LIBC_DISPATCH);
        assert!(out.machine.branches.is_empty());
    }

    #[test]
    fn test_capacity_limit_is_fatal() {
        let mut ctx = CompilationContext::new(&CompileOptions::new(Arch::X86_64), 6);
        ctx.begin_module(&ModuleInfo::default()).unwrap();
        let err = ctx.begin_function(&function("main", 0, 4)).unwrap_err();
        assert!(matches!(err, CodegenError::OutOfMemory { limit: 6, .. }));
    }
}
