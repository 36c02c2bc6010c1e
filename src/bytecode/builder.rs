use super::opcode::Instr;
use super::{BytecodeError, BytecodeFunction, BytecodeModule};
use crate::ir::{self, FunctionInfo, Label, ModuleInfo, Op, OpSink};
use crate::parser::ast::AstNode;

/// Lower a translation unit straight to a bytecode module.
pub fn compile_bytecode(unit: &AstNode) -> Result<BytecodeModule, BytecodeError> {
    let mut builder = BytecodeBuilder::new();
    let info = ir::lower(unit, &mut builder)?;
    builder.finish(info)
}

/// [`OpSink`] that encodes operations as bytecode.
///
/// Jump operands are written as placeholders and patched with absolute code
/// offsets when the enclosing function ends. Labels are unique across the
/// module, so a label can never be resolved against another function.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    code: Vec<u8>,
    functions: Vec<BytecodeFunction>,
    current: Option<usize>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset(&self) -> Result<u32, BytecodeError> {
        u32::try_from(self.code.len()).map_err(|_| BytecodeError::TooLarge)
    }

    fn push(&mut self, instr: Instr<'_>) {
        instr.encode(&mut self.code);
    }

    /// Emit a jump with a zero target and remember where to patch it.
    fn push_jump(&mut self, instr: Instr<'_>, label: Label) {
        self.push(instr);
        self.fixups.push((self.code.len() - 4, label));
    }

    fn resolve_fixups(&mut self) -> Result<(), BytecodeError> {
        for (at, label) in self.fixups.drain(..) {
            let target = self
                .labels
                .get(label.0 as usize)
                .copied()
                .flatten()
                .ok_or(BytecodeError::UnboundLabel(label.0))?;
            self.code[at..at + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(())
    }

    /// Assemble the module. `info` is what [`ir::lower`] returned.
    pub fn finish(self, info: ModuleInfo) -> Result<BytecodeModule, BytecodeError> {
        self.offset()?;
        log::debug!(
            "built bytecode module: {} function(s), {} code bytes",
            self.functions.len(),
            self.code.len()
        );
        Ok(BytecodeModule {
            name: info.name,
            imports: info.imports,
            exports: info.exports,
            functions: self.functions,
            code: self.code,
        })
    }
}

impl OpSink for BytecodeBuilder {
    type Error = BytecodeError;

    fn begin_module(&mut self, _module: &ModuleInfo) -> Result<(), BytecodeError> {
        Ok(())
    }

    fn begin_function(&mut self, function: &FunctionInfo) -> Result<(), BytecodeError> {
        let offset = self.offset()?;
        self.current = Some(self.functions.len());
        self.functions.push(BytecodeFunction {
            name: function.name.clone(),
            offset,
            len: 0,
            params: function.params,
            locals: function.locals,
        });
        Ok(())
    }

    fn end_function(&mut self) -> Result<(), BytecodeError> {
        self.resolve_fixups()?;
        let end = self.offset()?;
        if let Some(index) = self.current.take() {
            let function = &mut self.functions[index];
            function.len = end - function.offset;
        }
        Ok(())
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    fn bind(&mut self, label: Label) -> Result<(), BytecodeError> {
        let offset = self.offset()?;
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(offset);
        }
        Ok(())
    }

    fn op(&mut self, op: Op<'_>) -> Result<(), BytecodeError> {
        match op {
            Op::Nop => self.push(Instr::Nop),
            Op::Halt => self.push(Instr::Halt),
            Op::Drop => self.push(Instr::Drop),
            Op::Const(v) => self.push(Instr::ConstI32(v)),
            Op::ConstString(bytes) => {
                if u32::try_from(bytes.len()).is_err() {
                    return Err(BytecodeError::StringTooLong(bytes.len()));
                }
                self.push(Instr::ConstString(bytes))
            }
            Op::Add => self.push(Instr::Add),
            Op::Sub => self.push(Instr::Sub),
            Op::Mul => self.push(Instr::Mul),
            Op::Div => self.push(Instr::Div),
            Op::Mod => self.push(Instr::Mod),
            Op::Compare(cmp) => self.push(Instr::Compare(cmp)),
            Op::Store(slot) => self.push(Instr::StoreLocal(slot)),
            Op::Load(slot) => self.push(Instr::LoadLocal(slot)),
            Op::Jump(label) => self.push_jump(Instr::Jump(0), label),
            Op::JumpIfFalse(label) => self.push_jump(Instr::JumpIfFalse(0), label),
            Op::Call { function, argc } => self.push(Instr::CallUser { function, argc }),
            Op::LibcCall { id, argc } => self.push(Instr::LibcCall { id, argc }),
        }
        Ok(())
    }
}
