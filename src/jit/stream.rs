//! Feeding a decoded bytecode module through an [`OpSink`].

use crate::bytecode::{BytecodeModule, Instr, Instructions};
use crate::codegen::CodegenError;
use crate::ir::{Label, Op, OpSink};
use rustc_hash::{FxHashMap, FxHashSet};

fn to_op<'a>(
    instr: Instr<'a>,
    labels: &FxHashMap<u32, Label>,
    function: &str,
) -> Result<Op<'a>, CodegenError> {
    let label = |target: u32| {
        labels
            .get(&target)
            .copied()
            .ok_or_else(|| CodegenError::InvalidJumpTarget {
                function: function.to_string(),
                target,
            })
    };

    Ok(match instr {
        Instr::Nop => Op::Nop,
        Instr::Halt => Op::Halt,
        Instr::Drop => Op::Drop,
        Instr::ConstI32(v) => Op::Const(v),
        Instr::ConstString(bytes) => Op::ConstString(bytes),
        Instr::Add => Op::Add,
        Instr::Sub => Op::Sub,
        Instr::Mul => Op::Mul,
        Instr::Div => Op::Div,
        Instr::Mod => Op::Mod,
        Instr::Compare(cmp) => Op::Compare(cmp),
        Instr::StoreLocal(slot) => Op::Store(slot),
        Instr::LoadLocal(slot) => Op::Load(slot),
        Instr::Jump(target) => Op::Jump(label(target)?),
        Instr::JumpIfFalse(target) => Op::JumpIfFalse(label(target)?),
        Instr::CallUser { function, argc } => Op::Call { function, argc },
        Instr::LibcCall { id, argc } => Op::LibcCall { id, argc },
    })
}

/// Replay every function of `module` into `sink`.
///
/// Jump targets must land on an instruction of the same function or on its
/// end. A label is bound in front of each target before the instruction
/// there is delivered, which is exactly where AST lowering binds its own.
pub fn replay<S>(module: &BytecodeModule, sink: &mut S) -> Result<(), CodegenError>
where
    S: OpSink<Error = CodegenError>,
{
    let info = module.module_info();
    sink.begin_module(&info)?;

    for (function, layout) in module.functions.iter().zip(&info.functions) {
        let base = function.offset as usize;
        let end = function.end();
        let decoded = Instructions::with_base(module.function_code(function), base)
            .collect::<Result<Vec<_>, _>>()?;
        let starts: FxHashSet<usize> = decoded.iter().map(|(offset, _)| *offset).collect();

        sink.begin_function(layout)?;

        let mut labels: FxHashMap<u32, Label> = FxHashMap::default();
        for (_, instr) in &decoded {
            let Some(target) = instr.jump_target() else {
                continue;
            };
            if target != end && !starts.contains(&(target as usize)) {
                return Err(CodegenError::InvalidJumpTarget {
                    function: function.name.clone(),
                    target,
                });
            }
            labels.entry(target).or_insert_with(|| sink.new_label());
        }

        for (offset, instr) in decoded {
            if let Some(&label) = labels.get(&(offset as u32)) {
                sink.bind(label)?;
            }
            sink.op(to_op(instr, &labels, &function.name)?)?;
        }
        if let Some(&label) = labels.get(&end) {
            sink.bind(label)?;
        }

        sink.end_function()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeFunction;
    use crate::ir::{FunctionInfo, ModuleInfo};

    #[derive(Default)]
    struct Trace(Vec<String>);

    impl OpSink for Trace {
        type Error = CodegenError;

        fn begin_module(&mut self, _: &ModuleInfo) -> Result<(), CodegenError> {
            Ok(())
        }

        fn begin_function(&mut self, f: &FunctionInfo) -> Result<(), CodegenError> {
            self.0.push(format!("fn {}", f.name));
            Ok(())
        }

        fn end_function(&mut self) -> Result<(), CodegenError> {
            self.0.push("end".into());
            Ok(())
        }

        fn new_label(&mut self) -> Label {
            Label(self.0.len() as u32)
        }

        fn bind(&mut self, label: Label) -> Result<(), CodegenError> {
            self.0.push(format!("bind {label}"));
            Ok(())
        }

        fn op(&mut self, op: Op<'_>) -> Result<(), CodegenError> {
            self.0.push(format!("{op:?}"));
            Ok(())
        }
    }

    fn module(code: Vec<u8>) -> BytecodeModule {
        BytecodeModule {
            functions: vec![BytecodeFunction {
                name: "main".into(),
                offset: 0,
                len: code.len() as u32,
                params: 0,
                locals: 0,
            }],
            code,
            ..BytecodeModule::default()
        }
    }

    #[test]
    fn test_labels_bound_before_targets() {
        // 0: JUMP 5, 5: CONST 1, 10: HALT
        let code = vec![0x40, 5, 0, 0, 0, 0x10, 1, 0, 0, 0, 0x01];
        let mut trace = Trace::default();
        replay(&module(code), &mut trace).unwrap();
        assert_eq!(
            trace.0,
            ["fn main", "Jump(Label(1))", "bind L1", "Const(1)", "Halt", "end"]
        );
    }

    #[test]
    fn test_jump_to_function_end() {
        let code = vec![0x40, 5, 0, 0, 0];
        let mut trace = Trace::default();
        replay(&module(code), &mut trace).unwrap();
        assert_eq!(trace.0[trace.0.len() - 2], "bind L1");
    }

    #[test]
    fn test_jump_into_an_operand_is_rejected() {
        let code = vec![0x40, 6, 0, 0, 0, 0x10, 1, 0, 0, 0, 0x01];
        let err = replay(&module(code), &mut Trace::default()).unwrap_err();
        assert_eq!(
            err,
            CodegenError::InvalidJumpTarget {
                function: "main".into(),
                target: 6
            }
        );
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let err = replay(&module(vec![0x10, 1, 0, 0, 0, 0x77]), &mut Trace::default()).unwrap_err();
        assert!(matches!(err, CodegenError::Decode(_)));
    }
}
