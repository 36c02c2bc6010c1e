// AST (Abstract Syntax Tree) definitions for the C front end

/// Source location information for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// Base types understood by the front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseType {
    Void,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Struct(String), // Struct name
}

/// Type specifier with qualifiers and pointer depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub base: BaseType,
    pub is_const: bool,
    pub is_unsigned: bool,
    pub pointer_depth: u8, // 0 = not pointer, 1 = *, 2 = **, etc.
}

impl Type {
    pub fn new(base: BaseType) -> Self {
        Type {
            base,
            is_const: false,
            is_unsigned: false,
            pointer_depth: 0,
        }
    }

    pub fn with_const(mut self) -> Self {
        self.is_const = true;
        self
    }

    pub fn with_unsigned(mut self) -> Self {
        self.is_unsigned = true;
        self
    }

    pub fn with_pointer(mut self) -> Self {
        self.pointer_depth = self.pointer_depth.saturating_add(1);
        self
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer_depth > 0
    }

    /// Integer-like scalars the bytecode can hold in a 32-bit slot
    pub fn is_integral(&self) -> bool {
        self.pointer_depth == 0
            && matches!(
                self.base,
                BaseType::Char | BaseType::Short | BaseType::Int | BaseType::Long
            )
    }
}

/// Literal constant value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Char(i64),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    BitShl,
    BitShr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::BitShl => "<<",
            BinOp::BitShr => ">>",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,     // -x
    Plus,    // +x
    Not,     // !x
    BitNot,  // ~x
    PreInc,  // ++x
    PreDec,  // --x
    PostInc, // x++
    PostDec, // x--
    Deref,   // *x
    AddrOf,  // &x
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Plus => "+",
            UnOp::Not => "!",
            UnOp::BitNot => "~",
            UnOp::PreInc | UnOp::PostInc => "++",
            UnOp::PreDec | UnOp::PostDec => "--",
            UnOp::Deref => "*",
            UnOp::AddrOf => "&",
        }
    }
}

/// Function parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub param_type: Type,
}

/// AST nodes. Every node owns its children outright.
#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    TranslationUnit {
        declarations: Vec<AstNode>,
        location: SourceLocation,
    },

    // Declarations
    FunctionDecl {
        name: String,
        return_type: Type,
        params: Vec<Param>,
        /// `None` for a prototype, otherwise a `Compound` node
        body: Option<Box<AstNode>>,
        location: SourceLocation,
    },
    VarDecl {
        name: String,
        var_type: Type,
        init: Option<Box<AstNode>>,
        location: SourceLocation,
    },
    Module {
        name: String,
        location: SourceLocation,
    },
    Import {
        name: String,
        path: Option<String>,
        location: SourceLocation,
    },
    Export {
        name: String,
        location: SourceLocation,
    },

    // Statements
    Compound {
        statements: Vec<AstNode>,
        location: SourceLocation,
    },
    If {
        condition: Box<AstNode>,
        then_branch: Box<AstNode>,
        else_branch: Option<Box<AstNode>>,
        location: SourceLocation,
    },
    While {
        condition: Box<AstNode>,
        body: Box<AstNode>,
        location: SourceLocation,
    },
    DoWhile {
        body: Box<AstNode>,
        condition: Box<AstNode>,
        location: SourceLocation,
    },
    For {
        init: Option<Box<AstNode>>,
        condition: Option<Box<AstNode>>,
        increment: Option<Box<AstNode>>,
        body: Box<AstNode>,
        location: SourceLocation,
    },
    Return {
        value: Option<Box<AstNode>>,
        location: SourceLocation,
    },
    Break {
        location: SourceLocation,
    },
    Continue {
        location: SourceLocation,
    },
    ExpressionStatement {
        expr: Box<AstNode>,
        location: SourceLocation,
    },

    // Expressions
    Identifier(String, SourceLocation),
    Constant(Constant, SourceLocation),
    StringLiteral(String, SourceLocation),
    BinaryOp {
        op: BinOp,
        left: Box<AstNode>,
        right: Box<AstNode>,
        location: SourceLocation,
    },
    UnaryOp {
        op: UnOp,
        operand: Box<AstNode>,
        location: SourceLocation,
    },
    Assignment {
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        location: SourceLocation,
    },
    Call {
        callee: Box<AstNode>,
        args: Vec<AstNode>,
        location: SourceLocation,
    },
}

impl AstNode {
    pub fn location(&self) -> SourceLocation {
        match self {
            AstNode::TranslationUnit { location, .. }
            | AstNode::FunctionDecl { location, .. }
            | AstNode::VarDecl { location, .. }
            | AstNode::Module { location, .. }
            | AstNode::Import { location, .. }
            | AstNode::Export { location, .. }
            | AstNode::Compound { location, .. }
            | AstNode::If { location, .. }
            | AstNode::While { location, .. }
            | AstNode::DoWhile { location, .. }
            | AstNode::For { location, .. }
            | AstNode::Return { location, .. }
            | AstNode::Break { location }
            | AstNode::Continue { location }
            | AstNode::ExpressionStatement { location, .. }
            | AstNode::BinaryOp { location, .. }
            | AstNode::UnaryOp { location, .. }
            | AstNode::Assignment { location, .. }
            | AstNode::Call { location, .. } => *location,
            AstNode::Identifier(_, loc)
            | AstNode::Constant(_, loc)
            | AstNode::StringLiteral(_, loc) => *loc,
        }
    }

    /// Human-readable node kind, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            AstNode::TranslationUnit { .. } => "translation unit",
            AstNode::FunctionDecl { .. } => "function declaration",
            AstNode::VarDecl { .. } => "variable declaration",
            AstNode::Module { .. } => "module declaration",
            AstNode::Import { .. } => "import declaration",
            AstNode::Export { .. } => "export declaration",
            AstNode::Compound { .. } => "compound statement",
            AstNode::If { .. } => "if statement",
            AstNode::While { .. } => "while statement",
            AstNode::DoWhile { .. } => "do-while statement",
            AstNode::For { .. } => "for statement",
            AstNode::Return { .. } => "return statement",
            AstNode::Break { .. } => "break statement",
            AstNode::Continue { .. } => "continue statement",
            AstNode::ExpressionStatement { .. } => "expression statement",
            AstNode::Identifier(..) => "identifier",
            AstNode::Constant(..) => "constant",
            AstNode::StringLiteral(..) => "string literal",
            AstNode::BinaryOp { .. } => "binary expression",
            AstNode::UnaryOp { .. } => "unary expression",
            AstNode::Assignment { .. } => "assignment",
            AstNode::Call { .. } => "call expression",
        }
    }

    /// Visit this node and every descendant, parents first.
    pub fn visit(&self, f: &mut impl FnMut(&AstNode)) {
        f(self);
        match self {
            AstNode::TranslationUnit { declarations: nodes, .. }
            | AstNode::Compound { statements: nodes, .. } => {
                for n in nodes {
                    n.visit(f);
                }
            }
            AstNode::FunctionDecl { body, .. } => {
                if let Some(body) = body {
                    body.visit(f);
                }
            }
            AstNode::VarDecl { init, .. } => {
                if let Some(init) = init {
                    init.visit(f);
                }
            }
            AstNode::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                condition.visit(f);
                then_branch.visit(f);
                if let Some(e) = else_branch {
                    e.visit(f);
                }
            }
            AstNode::While { condition, body, .. } | AstNode::DoWhile { body, condition, .. } => {
                condition.visit(f);
                body.visit(f);
            }
            AstNode::For {
                init,
                condition,
                increment,
                body,
                ..
            } => {
                for part in [init, condition, increment].into_iter().flatten() {
                    part.visit(f);
                }
                body.visit(f);
            }
            AstNode::Return { value, .. } => {
                if let Some(v) = value {
                    v.visit(f);
                }
            }
            AstNode::ExpressionStatement { expr, .. } => expr.visit(f),
            AstNode::BinaryOp { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            AstNode::UnaryOp { operand, .. } => operand.visit(f),
            AstNode::Assignment { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            AstNode::Call { callee, args, .. } => {
                callee.visit(f);
                for a in args {
                    a.visit(f);
                }
            }
            AstNode::Module { .. }
            | AstNode::Import { .. }
            | AstNode::Export { .. }
            | AstNode::Break { .. }
            | AstNode::Continue { .. }
            | AstNode::Identifier(..)
            | AstNode::Constant(..)
            | AstNode::StringLiteral(..) => {}
        }
    }

    /// Top-level declarations of a translation unit (empty for other nodes)
    pub fn declarations(&self) -> &[AstNode] {
        match self {
            AstNode::TranslationUnit { declarations, .. } => declarations,
            _ => &[],
        }
    }
}
