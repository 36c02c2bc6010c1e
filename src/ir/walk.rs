// AST → stack-machine lowering

use super::{Cmp, FunctionInfo, ImportInfo, Label, LowerError, ModuleInfo, Op, OpSink};
use crate::bytecode::libc;
use crate::parser::ast::*;
use rustc_hash::FxHashMap;

/// Lower a translation unit into `sink`, returning the module layout that
/// was announced through [`OpSink::begin_module`].
pub fn lower<S: OpSink>(unit: &AstNode, sink: &mut S) -> Result<ModuleInfo, S::Error> {
    let AstNode::TranslationUnit { declarations, .. } = unit else {
        return Err(LowerError::NotATranslationUnit(unit.kind_name()).into());
    };

    let (info, definitions) = collect_module(declarations)?;
    log::debug!(
        "lowering module {} with {} function(s)",
        info.name.as_deref().unwrap_or("<unnamed>"),
        info.functions.len()
    );

    sink.begin_module(&info)?;
    for (function, (params, body)) in info.functions.iter().zip(definitions) {
        let mut lowerer = FunctionLowerer {
            sink: &mut *sink,
            module: &info,
            scopes: Vec::new(),
            next_slot: 0,
            loops: Vec::new(),
        };
        lowerer.function(function, params, body)?;
    }

    Ok(info)
}

type Definition<'a> = (&'a [Param], &'a AstNode);

/// First pass: module metadata and the function table, in declaration order.
fn collect_module(declarations: &[AstNode]) -> Result<(ModuleInfo, Vec<Definition<'_>>), LowerError> {
    let mut info = ModuleInfo::default();
    let mut definitions = Vec::new();
    let mut exports = Vec::new();

    for decl in declarations {
        match decl {
            AstNode::Module { name, location } => {
                if info.name.is_some() {
                    return Err(unsupported("more than one module declaration", *location));
                }
                info.name = Some(name.clone());
            }
            AstNode::Import { name, path, .. } => info.imports.push(ImportInfo {
                name: name.clone(),
                path: path.clone(),
            }),
            AstNode::Export { name, location } => exports.push((name, *location)),
            AstNode::FunctionDecl {
                name,
                return_type,
                params,
                body: Some(body),
                location,
            } => {
                if info.function_index(name).is_some() {
                    return Err(LowerError::DuplicateFunction {
                        name: name.clone(),
                        location: *location,
                    });
                }
                if return_type.base != BaseType::Void || return_type.is_pointer() {
                    check_scalar(return_type, "return value", *location)?;
                }
                for param in params {
                    check_scalar(&param.param_type, "parameter", *location)?;
                }

                let slots = params.len() + count_locals(body);
                info.functions.push(FunctionInfo {
                    name: name.clone(),
                    params: to_u16(params.len(), "parameters")?,
                    locals: to_u16(slots, "local variables")?,
                });
                definitions.push((params.as_slice(), body.as_ref()));
            }
            // Prototypes only matter through the definition they announce
            AstNode::FunctionDecl { body: None, .. } => {}
            AstNode::VarDecl { name, location, .. } => {
                return Err(unsupported(format!("global variable '{name}'"), *location));
            }
            other => return Err(unsupported(other.kind_name(), other.location())),
        }
    }

    to_u16(info.functions.len(), "functions")?;

    for (name, location) in exports {
        if info.function_index(name).is_none() {
            return Err(LowerError::UndefinedFunction {
                name: name.clone(),
                location,
            });
        }
        info.exports.push(name.clone());
    }

    Ok((info, definitions))
}

fn unsupported(what: impl Into<String>, location: SourceLocation) -> LowerError {
    LowerError::Unsupported {
        what: what.into(),
        location,
    }
}

fn to_u16(n: usize, what: &'static str) -> Result<u16, LowerError> {
    u16::try_from(n).map_err(|_| LowerError::LimitExceeded {
        what,
        limit: u16::MAX as usize,
    })
}

fn type_name(ty: &Type) -> String {
    let base = match &ty.base {
        BaseType::Void => "void".to_string(),
        BaseType::Char => "char".to_string(),
        BaseType::Short => "short".to_string(),
        BaseType::Int => "int".to_string(),
        BaseType::Long => "long".to_string(),
        BaseType::Float => "float".to_string(),
        BaseType::Double => "double".to_string(),
        BaseType::Struct(name) => format!("struct {name}"),
    };
    format!("{}{}", base, "*".repeat(ty.pointer_depth as usize))
}

fn check_scalar(ty: &Type, what: &str, location: SourceLocation) -> Result<(), LowerError> {
    if ty.is_integral() {
        Ok(())
    } else {
        Err(unsupported(format!("{what} of type '{}'", type_name(ty)), location))
    }
}

/// Number of variable declarations anywhere inside a statement.
fn count_locals(node: &AstNode) -> usize {
    match node {
        AstNode::VarDecl { .. } => 1,
        AstNode::Compound { statements, .. } => statements.iter().map(count_locals).sum(),
        AstNode::If {
            then_branch,
            else_branch,
            ..
        } => count_locals(then_branch) + else_branch.as_deref().map_or(0, count_locals),
        AstNode::While { body, .. } | AstNode::DoWhile { body, .. } => count_locals(body),
        AstNode::For { init, body, .. } => {
            init.as_deref().map_or(0, count_locals) + count_locals(body)
        }
        _ => 0,
    }
}

struct LoopLabels {
    break_label: Label,
    continue_label: Label,
}

/// Lowers one function body. Slots are handed out in declaration order,
/// parameters first, and never reused.
struct FunctionLowerer<'a, 'm, S> {
    sink: &'m mut S,
    module: &'m ModuleInfo,
    scopes: Vec<FxHashMap<&'a str, u32>>,
    next_slot: u32,
    loops: Vec<LoopLabels>,
}

impl<'a, 'm, S: OpSink> FunctionLowerer<'a, 'm, S> {
    fn op(&mut self, op: Op<'a>) -> Result<(), S::Error> {
        self.sink.op(op)
    }

    fn bind(&mut self, label: Label) -> Result<(), S::Error> {
        self.sink.bind(label)
    }

    fn function(
        &mut self,
        info: &FunctionInfo,
        params: &'a [Param],
        body: &'a AstNode,
    ) -> Result<(), S::Error> {
        self.sink.begin_function(info)?;

        // Parameters share the outermost block's scope
        self.scopes.push(FxHashMap::default());
        for param in params {
            if param.name.is_empty() {
                self.next_slot += 1;
            } else {
                self.declare(&param.name, body.location())?;
            }
        }

        let statements: &'a [AstNode] = match body {
            AstNode::Compound { statements, .. } => statements,
            other => return Err(unsupported(other.kind_name(), other.location()).into()),
        };
        for stmt in statements {
            self.statement(stmt)?;
        }

        if !matches!(statements.last(), Some(AstNode::Return { .. })) {
            self.op(Op::Const(0))?;
            self.op(Op::Halt)?;
        }

        self.scopes.pop();
        self.sink.end_function()
    }

    fn declare(&mut self, name: &'a str, location: SourceLocation) -> Result<u32, LowerError> {
        let slot = self.next_slot;
        let scope = self
            .scopes
            .last_mut()
            .ok_or_else(|| unsupported("declaration outside a function", location))?;
        if scope.insert(name, slot).is_some() {
            return Err(LowerError::Redeclared {
                name: name.to_string(),
                location,
            });
        }
        self.next_slot += 1;
        Ok(slot)
    }

    fn resolve(&self, name: &str, location: SourceLocation) -> Result<u32, LowerError> {
        if let Some(slot) = self.scopes.iter().rev().find_map(|s| s.get(name)) {
            return Ok(*slot);
        }
        if self.module.function_index(name).is_some() {
            return Err(unsupported(format!("using function '{name}' as a value"), location));
        }
        Err(LowerError::UndefinedVariable {
            name: name.to_string(),
            location,
        })
    }

    /// Slot named by an assignable expression.
    fn lvalue(&self, node: &AstNode) -> Result<u32, LowerError> {
        match node {
            AstNode::Identifier(name, location) => self.resolve(name, *location),
            other => Err(unsupported(
                format!("assignment to a {}", other.kind_name()),
                other.location(),
            )),
        }
    }

    fn statement(&mut self, node: &'a AstNode) -> Result<(), S::Error> {
        match node {
            AstNode::Compound { statements, .. } => {
                self.scopes.push(FxHashMap::default());
                for stmt in statements {
                    self.statement(stmt)?;
                }
                self.scopes.pop();
            }

            AstNode::VarDecl {
                name,
                var_type,
                init,
                location,
            } => {
                check_scalar(var_type, "variable", *location)?;
                // The initializer cannot see the variable it initializes
                if let Some(init) = init {
                    self.expression(init)?;
                }
                let slot = self.declare(name, *location)?;
                if init.is_some() {
                    self.op(Op::Store(slot))?;
                }
            }

            AstNode::ExpressionStatement { expr, .. } => self.effect(expr)?,

            AstNode::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let else_label = self.sink.new_label();
                self.expression(condition)?;
                self.op(Op::JumpIfFalse(else_label))?;
                self.statement(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let end_label = self.sink.new_label();
                        self.op(Op::Jump(end_label))?;
                        self.bind(else_label)?;
                        self.statement(else_branch)?;
                        self.bind(end_label)?;
                    }
                    None => self.bind(else_label)?,
                }
            }

            AstNode::While {
                condition, body, ..
            } => {
                let start = self.sink.new_label();
                let end = self.sink.new_label();
                self.bind(start)?;
                self.expression(condition)?;
                self.op(Op::JumpIfFalse(end))?;
                self.loop_body(body, end, start)?;
                self.op(Op::Jump(start))?;
                self.bind(end)?;
            }

            AstNode::DoWhile {
                body, condition, ..
            } => {
                let start = self.sink.new_label();
                let check = self.sink.new_label();
                let end = self.sink.new_label();
                self.bind(start)?;
                self.loop_body(body, end, check)?;
                self.bind(check)?;
                self.expression(condition)?;
                self.op(Op::JumpIfFalse(end))?;
                self.op(Op::Jump(start))?;
                self.bind(end)?;
            }

            AstNode::For {
                init,
                condition,
                increment,
                body,
                ..
            } => {
                self.scopes.push(FxHashMap::default());
                if let Some(init) = init {
                    self.statement(init)?;
                }

                let start = self.sink.new_label();
                let next = self.sink.new_label();
                let end = self.sink.new_label();
                self.bind(start)?;
                if let Some(condition) = condition {
                    self.expression(condition)?;
                    self.op(Op::JumpIfFalse(end))?;
                }
                self.loop_body(body, end, next)?;
                self.bind(next)?;
                if let Some(increment) = increment {
                    self.effect(increment)?;
                }
                self.op(Op::Jump(start))?;
                self.bind(end)?;
                self.scopes.pop();
            }

            AstNode::Return { value, .. } => {
                match value {
                    Some(value) => self.expression(value)?,
                    None => self.op(Op::Const(0))?,
                }
                self.op(Op::Halt)?;
            }

            AstNode::Break { location } => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.break_label)
                    .ok_or(LowerError::OutsideLoop {
                        keyword: "break",
                        location: *location,
                    })?;
                self.op(Op::Jump(target))?;
            }

            AstNode::Continue { location } => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.continue_label)
                    .ok_or(LowerError::OutsideLoop {
                        keyword: "continue",
                        location: *location,
                    })?;
                self.op(Op::Jump(target))?;
            }

            other => return Err(unsupported(other.kind_name(), other.location()).into()),
        }

        Ok(())
    }

    fn loop_body(
        &mut self,
        body: &'a AstNode,
        break_label: Label,
        continue_label: Label,
    ) -> Result<(), S::Error> {
        self.loops.push(LoopLabels {
            break_label,
            continue_label,
        });
        let result = self.statement(body);
        self.loops.pop();
        result
    }

    /// Evaluate for side effects only; nothing is left on the stack.
    fn effect(&mut self, node: &'a AstNode) -> Result<(), S::Error> {
        match node {
            AstNode::Assignment { lhs, rhs, .. } => {
                let slot = self.lvalue(lhs)?;
                self.expression(rhs)?;
                self.op(Op::Store(slot))
            }
            AstNode::UnaryOp {
                op: op @ (UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec),
                operand,
                ..
            } => {
                let slot = self.lvalue(operand)?;
                self.step(slot, *op)
            }
            _ => {
                self.expression(node)?;
                self.op(Op::Drop)
            }
        }
    }

    /// `slot += 1` or `slot -= 1`
    fn step(&mut self, slot: u32, op: UnOp) -> Result<(), S::Error> {
        let delta = match op {
            UnOp::PreInc | UnOp::PostInc => 1,
            _ => -1,
        };
        self.op(Op::Load(slot))?;
        self.op(Op::Const(delta))?;
        self.op(Op::Add)?;
        self.op(Op::Store(slot))
    }

    /// Evaluate and push exactly one value.
    fn expression(&mut self, node: &'a AstNode) -> Result<(), S::Error> {
        match node {
            AstNode::Constant(value, location) => {
                let value = match value {
                    Constant::Int(n) | Constant::Char(n) => int_constant(*n, *location)?,
                    Constant::Float(_) => {
                        return Err(unsupported("floating-point constant", *location).into())
                    }
                };
                self.op(Op::Const(value))
            }

            AstNode::StringLiteral(s, _) => self.op(Op::ConstString(s.as_bytes())),

            AstNode::Identifier(name, location) => {
                let slot = self.resolve(name, *location)?;
                self.op(Op::Load(slot))
            }

            AstNode::BinaryOp {
                op,
                left,
                right,
                location,
            } => {
                let stack_op = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::Eq => Op::Compare(Cmp::Eq),
                    BinOp::Ne => Op::Compare(Cmp::Ne),
                    BinOp::Lt => Op::Compare(Cmp::Lt),
                    BinOp::Le => Op::Compare(Cmp::Le),
                    BinOp::Gt => Op::Compare(Cmp::Gt),
                    BinOp::Ge => Op::Compare(Cmp::Ge),
                    other => {
                        return Err(unsupported(
                            format!("operator '{}'", other.symbol()),
                            *location,
                        )
                        .into())
                    }
                };
                self.expression(left)?;
                self.expression(right)?;
                self.op(stack_op)
            }

            AstNode::UnaryOp {
                op,
                operand,
                location,
            } => match op {
                UnOp::Plus => self.expression(operand),
                UnOp::Neg => match operand.as_ref() {
                    AstNode::Constant(Constant::Int(n) | Constant::Char(n), loc) => {
                        let value = int_constant(*n, *loc)?;
                        self.op(Op::Const(value.wrapping_neg()))
                    }
                    _ => {
                        self.op(Op::Const(0))?;
                        self.expression(operand)?;
                        self.op(Op::Sub)
                    }
                },
                UnOp::Not => {
                    self.expression(operand)?;
                    self.op(Op::Const(0))?;
                    self.op(Op::Compare(Cmp::Eq))
                }
                UnOp::PreInc | UnOp::PreDec => {
                    let slot = self.lvalue(operand)?;
                    self.step(slot, *op)?;
                    self.op(Op::Load(slot))
                }
                UnOp::PostInc | UnOp::PostDec => {
                    let slot = self.lvalue(operand)?;
                    self.op(Op::Load(slot))?;
                    self.step(slot, *op)
                }
                UnOp::BitNot | UnOp::Deref | UnOp::AddrOf => {
                    Err(unsupported(format!("operator '{}'", op.symbol()), *location).into())
                }
            },

            AstNode::Assignment { lhs, rhs, .. } => {
                let slot = self.lvalue(lhs)?;
                self.expression(rhs)?;
                self.op(Op::Store(slot))?;
                self.op(Op::Load(slot))
            }

            AstNode::Call {
                callee,
                args,
                location,
            } => self.call(callee, args, *location),

            other => Err(unsupported(other.kind_name(), other.location()).into()),
        }
    }

    fn call(
        &mut self,
        callee: &'a AstNode,
        args: &'a [AstNode],
        location: SourceLocation,
    ) -> Result<(), S::Error> {
        let AstNode::Identifier(name, _) = callee else {
            return Err(unsupported("indirect call", location).into());
        };
        let argc = to_u16(args.len(), "call arguments")?;

        if let Some(index) = self.module.function_index(name) {
            let expected = self.module.functions[index].params as usize;
            if expected != args.len() {
                return Err(LowerError::ArityMismatch {
                    name: name.clone(),
                    expected,
                    found: args.len(),
                    location,
                }
                .into());
            }
            for arg in args {
                self.expression(arg)?;
            }
            return self.op(Op::Call {
                function: index as u16,
                argc,
            });
        }

        if let Some(id) = libc::lookup(name) {
            for arg in args {
                self.expression(arg)?;
            }
            return self.op(Op::LibcCall { id, argc });
        }

        Err(LowerError::UndefinedFunction {
            name: name.clone(),
            location,
        }
        .into())
    }
}

/// Integer literals must fit in 32 bits; values up to `u32::MAX` wrap.
fn int_constant(value: i64, location: SourceLocation) -> Result<i32, LowerError> {
    if (i64::from(i32::MIN)..=i64::from(u32::MAX)).contains(&value) {
        Ok(value as u32 as i32)
    } else {
        Err(LowerError::ConstantOutOfRange { value, location })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    /// Records the stream as text, one entry per call.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        labels: u32,
    }

    impl OpSink for Recorder {
        type Error = LowerError;

        fn begin_module(&mut self, module: &ModuleInfo) -> Result<(), LowerError> {
            self.events.push(format!("module {}", module.functions.len()));
            Ok(())
        }

        fn begin_function(&mut self, f: &FunctionInfo) -> Result<(), LowerError> {
            self.events
                .push(format!("fn {} {} {}", f.name, f.params, f.locals));
            Ok(())
        }

        fn end_function(&mut self) -> Result<(), LowerError> {
            self.events.push("end".to_string());
            Ok(())
        }

        fn new_label(&mut self) -> Label {
            self.labels += 1;
            Label(self.labels - 1)
        }

        fn bind(&mut self, label: Label) -> Result<(), LowerError> {
            self.events.push(format!("{label}:"));
            Ok(())
        }

        fn op(&mut self, op: Op<'_>) -> Result<(), LowerError> {
            self.events.push(format!("{op:?}"));
            Ok(())
        }
    }

    fn lower_source(source: &str) -> Result<Vec<String>, LowerError> {
        let unit = parser::parse(source).expect("Parsing failed");
        let mut recorder = Recorder::default();
        lower(&unit, &mut recorder)?;
        Ok(recorder.events)
    }

    #[test]
    fn test_return_constant() {
        assert_eq!(
            lower_source("int main() { return 42; }").unwrap(),
            vec!["module 1", "fn main 0 0", "Const(42)", "Halt", "end"]
        );
    }

    #[test]
    fn test_params_then_locals_and_implicit_return() {
        let events =
            lower_source("int f(int a, int b) { int c = a - b; { int d; d = c; } }").unwrap();
        assert_eq!(
            events,
            vec![
                "module 1",
                "fn f 2 4",
                "Load(0)",
                "Load(1)",
                "Sub",
                "Store(2)",
                "Load(2)",
                "Store(3)",
                "Const(0)",
                "Halt",
                "end",
            ]
        );
    }

    #[test]
    fn test_while_loop_shape() {
        let events =
            lower_source("int main() { int i = 0; while (i < 3) { i++; } return i; }").unwrap();
        assert_eq!(
            events,
            vec![
                "module 1",
                "fn main 0 1",
                "Const(0)",
                "Store(0)",
                "L0:",
                "Load(0)",
                "Const(3)",
                "Compare(Lt)",
                "JumpIfFalse(Label(1))",
                "Load(0)",
                "Const(1)",
                "Add",
                "Store(0)",
                "Jump(Label(0))",
                "L1:",
                "Load(0)",
                "Halt",
                "end",
            ]
        );
    }

    #[test]
    fn test_calls_resolve_user_then_libc() {
        let events = lower_source(
            "int twice(int x) { return x * 2; }\nint main() { printf(\"%d\", twice(4)); return 0; }",
        )
        .unwrap();
        assert!(events.contains(&"Call { function: 0, argc: 1 }".to_string()));
        assert!(events.contains(&"LibcCall { id: 48, argc: 2 }".to_string()));
        assert!(events.contains(&"Drop".to_string()));
    }

    #[test]
    fn test_negative_literal_is_folded() {
        let events = lower_source("int main() { return -7; }").unwrap();
        assert_eq!(events[2], "Const(-7)");
    }

    #[test]
    fn test_block_scoping() {
        assert!(lower_source("int main() { { int x = 1; } return x; }").is_err());
        assert!(lower_source("int main() { int x = 1; { int x = 2; } return x; }").is_ok());
        assert!(matches!(
            lower_source("int main() { int x; int x; return 0; }"),
            Err(LowerError::Redeclared { .. })
        ));
    }

    #[test]
    fn test_unsupported_constructs() {
        for source in [
            "int g; int main() { return 0; }",
            "int main() { return 1 && 2; }",
            "int main() { float f = 1.5; return 0; }",
            "int main() { int *p; return 0; }",
            "int main() { return 1.5; }",
        ] {
            assert!(
                matches!(lower_source(source), Err(LowerError::Unsupported { .. })),
                "{source}"
            );
        }
    }

    #[test]
    fn test_semantic_errors() {
        assert!(matches!(
            lower_source("int main() { return nope(); }"),
            Err(LowerError::UndefinedFunction { .. })
        ));
        assert!(matches!(
            lower_source("int f(int a) { return a; } int main() { return f(); }"),
            Err(LowerError::ArityMismatch { expected: 1, found: 0, .. })
        ));
        assert!(matches!(
            lower_source("int main() { break; }"),
            Err(LowerError::OutsideLoop { keyword: "break", .. })
        ));
        assert!(matches!(
            lower_source("int main() { return 0; } int main() { return 1; }"),
            Err(LowerError::DuplicateFunction { .. })
        ));
        assert!(matches!(
            lower_source("int main() { return 5000000000; }"),
            Err(LowerError::ConstantOutOfRange { .. })
        ));
    }
}
