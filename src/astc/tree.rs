//! Tree payload: depth-first, kind-tagged AST serialization
//!
//! Each node is written as `kind:u8 line:u32 column:u32` followed by a
//! kind-specific payload. Child nodes recurse; lists are a `u32` count then the
//! items; optional children carry a presence byte. Type specifiers are their
//! own tagged records without a location.
//!
//! [`write_node`] and [`read_node`] share the tag tables below, so the two
//! directions cannot disagree on a layout.

use super::{ByteReader, ByteWriter, DecodeError, EncodeError};
use crate::parser::ast::*;

/// Deepest nesting written or read. Decoding recurses once per level, and
/// this bound keeps that recursion inside a 2 MiB thread stack in debug builds.
pub const MAX_DEPTH: usize = 128;

const TYPE_SPECIFIER: u8 = 0x07;

/// Node kind tags.
mod kind {
    pub const TRANSLATION_UNIT: u8 = 0x01;
    pub const FUNCTION_DECL: u8 = 0x02;
    pub const VAR_DECL: u8 = 0x03;
    pub const MODULE: u8 = 0x04;
    pub const IMPORT: u8 = 0x05;
    pub const EXPORT: u8 = 0x06;
    pub const COMPOUND: u8 = 0x10;
    pub const IF: u8 = 0x11;
    pub const WHILE: u8 = 0x12;
    pub const DO_WHILE: u8 = 0x13;
    pub const FOR: u8 = 0x14;
    pub const RETURN: u8 = 0x15;
    pub const BREAK: u8 = 0x16;
    pub const CONTINUE: u8 = 0x17;
    pub const EXPRESSION_STATEMENT: u8 = 0x18;
    pub const IDENTIFIER: u8 = 0x20;
    pub const CONSTANT: u8 = 0x21;
    pub const STRING_LITERAL: u8 = 0x22;
    pub const BINARY_OP: u8 = 0x23;
    pub const UNARY_OP: u8 = 0x24;
    pub const ASSIGNMENT: u8 = 0x25;
    pub const CALL: u8 = 0x26;
}

const BIN_OPS: [BinOp; 18] = [
    BinOp::Add,
    BinOp::Sub,
    BinOp::Mul,
    BinOp::Div,
    BinOp::Mod,
    BinOp::Eq,
    BinOp::Ne,
    BinOp::Lt,
    BinOp::Le,
    BinOp::Gt,
    BinOp::Ge,
    BinOp::And,
    BinOp::Or,
    BinOp::BitAnd,
    BinOp::BitOr,
    BinOp::BitXor,
    BinOp::BitShl,
    BinOp::BitShr,
];

const UN_OPS: [UnOp; 10] = [
    UnOp::Neg,
    UnOp::Plus,
    UnOp::Not,
    UnOp::BitNot,
    UnOp::PreInc,
    UnOp::PreDec,
    UnOp::PostInc,
    UnOp::PostDec,
    UnOp::Deref,
    UnOp::AddrOf,
];

fn table_index<T: PartialEq>(table: &[T], item: &T) -> u8 {
    // Every enum variant appears in its table
    table.iter().position(|x| x == item).unwrap_or(0) as u8
}

fn write_location(w: &mut ByteWriter, loc: SourceLocation) -> Result<(), EncodeError> {
    for (what, v) in [("line number", loc.line), ("column number", loc.column)] {
        let v = u32::try_from(v).map_err(|_| EncodeError::TooLarge { what, len: v })?;
        w.write_u32(v);
    }
    Ok(())
}

fn write_header(w: &mut ByteWriter, tag: u8, loc: SourceLocation) -> Result<(), EncodeError> {
    w.write_u8(tag);
    write_location(w, loc)
}

fn write_opt_node(
    w: &mut ByteWriter,
    node: Option<&Box<AstNode>>,
    depth: usize,
) -> Result<(), EncodeError> {
    w.write_opt(node, |w, n| write_at(w, n, depth))
}

fn write_nodes(
    w: &mut ByteWriter,
    nodes: &[AstNode],
    what: &'static str,
    depth: usize,
) -> Result<(), EncodeError> {
    w.write_vec(nodes, what, |w, n| write_at(w, n, depth))
}

/// Write a type specifier record.
pub fn write_type(w: &mut ByteWriter, ty: &Type) -> Result<(), EncodeError> {
    w.write_u8(TYPE_SPECIFIER);
    match &ty.base {
        BaseType::Void => w.write_u8(0),
        BaseType::Char => w.write_u8(1),
        BaseType::Short => w.write_u8(2),
        BaseType::Int => w.write_u8(3),
        BaseType::Long => w.write_u8(4),
        BaseType::Float => w.write_u8(5),
        BaseType::Double => w.write_u8(6),
        BaseType::Struct(name) => {
            w.write_u8(7);
            w.write_str(name)?;
        }
    }
    w.write_u8(ty.pointer_depth);
    w.write_u8(u8::from(ty.is_const) | (u8::from(ty.is_unsigned) << 1));
    Ok(())
}

/// Serialize one node and its subtree.
///
/// Subtrees nested deeper than [`MAX_DEPTH`] are rejected, so everything
/// written here can be read back by [`read_node`].
pub fn write_node(w: &mut ByteWriter, node: &AstNode) -> Result<(), EncodeError> {
    write_at(w, node, 1)
}

fn write_at(w: &mut ByteWriter, node: &AstNode, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_DEPTH {
        return Err(EncodeError::TooDeep(MAX_DEPTH));
    }
    let loc = node.location();
    let child = depth + 1;
    match node {
        AstNode::TranslationUnit { declarations, .. } => {
            write_header(w, kind::TRANSLATION_UNIT, loc)?;
            write_nodes(w, declarations, "declaration list", child)
        }
        AstNode::FunctionDecl {
            name,
            return_type,
            params,
            body,
            ..
        } => {
            write_header(w, kind::FUNCTION_DECL, loc)?;
            w.write_str(name)?;
            write_type(w, return_type)?;
            w.write_vec(params, "parameter list", |w, p| {
                w.write_str(&p.name)?;
                write_type(w, &p.param_type)
            })?;
            write_opt_node(w, body.as_ref(), child)
        }
        AstNode::VarDecl {
            name,
            var_type,
            init,
            ..
        } => {
            write_header(w, kind::VAR_DECL, loc)?;
            w.write_str(name)?;
            write_type(w, var_type)?;
            write_opt_node(w, init.as_ref(), child)
        }
        AstNode::Module { name, .. } => {
            write_header(w, kind::MODULE, loc)?;
            w.write_str(name)
        }
        AstNode::Import { name, path, .. } => {
            write_header(w, kind::IMPORT, loc)?;
            w.write_str(name)?;
            w.write_opt(path.as_ref(), |w, p| w.write_str(p))
        }
        AstNode::Export { name, .. } => {
            write_header(w, kind::EXPORT, loc)?;
            w.write_str(name)
        }
        AstNode::Compound { statements, .. } => {
            write_header(w, kind::COMPOUND, loc)?;
            write_nodes(w, statements, "statement list", child)
        }
        AstNode::If {
            condition,
            then_branch,
            else_branch,
            ..
        } => {
            write_header(w, kind::IF, loc)?;
            write_at(w, condition, child)?;
            write_at(w, then_branch, child)?;
            write_opt_node(w, else_branch.as_ref(), child)
        }
        AstNode::While {
            condition, body, ..
        } => {
            write_header(w, kind::WHILE, loc)?;
            write_at(w, condition, child)?;
            write_at(w, body, child)
        }
        AstNode::DoWhile {
            body, condition, ..
        } => {
            write_header(w, kind::DO_WHILE, loc)?;
            write_at(w, body, child)?;
            write_at(w, condition, child)
        }
        AstNode::For {
            init,
            condition,
            increment,
            body,
            ..
        } => {
            write_header(w, kind::FOR, loc)?;
            write_opt_node(w, init.as_ref(), child)?;
            write_opt_node(w, condition.as_ref(), child)?;
            write_opt_node(w, increment.as_ref(), child)?;
            write_at(w, body, child)
        }
        AstNode::Return { value, .. } => {
            write_header(w, kind::RETURN, loc)?;
            write_opt_node(w, value.as_ref(), child)
        }
        AstNode::Break { .. } => write_header(w, kind::BREAK, loc),
        AstNode::Continue { .. } => write_header(w, kind::CONTINUE, loc),
        AstNode::ExpressionStatement { expr, .. } => {
            write_header(w, kind::EXPRESSION_STATEMENT, loc)?;
            write_at(w, expr, child)
        }
        AstNode::Identifier(name, _) => {
            write_header(w, kind::IDENTIFIER, loc)?;
            w.write_str(name)
        }
        AstNode::Constant(value, _) => {
            write_header(w, kind::CONSTANT, loc)?;
            match value {
                Constant::Int(n) => {
                    w.write_u8(0);
                    w.write_i64(*n);
                }
                Constant::Float(x) => {
                    w.write_u8(1);
                    w.write_i64(x.to_bits() as i64);
                }
                Constant::Char(c) => {
                    w.write_u8(2);
                    w.write_i64(*c);
                }
            }
            Ok(())
        }
        AstNode::StringLiteral(s, _) => {
            write_header(w, kind::STRING_LITERAL, loc)?;
            w.write_str(s)
        }
        AstNode::BinaryOp {
            op, left, right, ..
        } => {
            write_header(w, kind::BINARY_OP, loc)?;
            w.write_u8(table_index(&BIN_OPS, op));
            write_at(w, left, child)?;
            write_at(w, right, child)
        }
        AstNode::UnaryOp { op, operand, .. } => {
            write_header(w, kind::UNARY_OP, loc)?;
            w.write_u8(table_index(&UN_OPS, op));
            write_at(w, operand, child)
        }
        AstNode::Assignment { lhs, rhs, .. } => {
            write_header(w, kind::ASSIGNMENT, loc)?;
            write_at(w, lhs, child)?;
            write_at(w, rhs, child)
        }
        AstNode::Call { callee, args, .. } => {
            write_header(w, kind::CALL, loc)?;
            write_at(w, callee, child)?;
            write_nodes(w, args, "argument list", child)
        }
    }
}

/// Read a type specifier record.
pub fn read_type(r: &mut ByteReader<'_>) -> Result<Type, DecodeError> {
    let offset = r.position();
    let tag = r.read_u8()?;
    if tag != TYPE_SPECIFIER {
        return Err(DecodeError::UnknownTag {
            what: "type specifier",
            tag,
            offset,
        });
    }

    let offset = r.position();
    let base = match r.read_u8()? {
        0 => BaseType::Void,
        1 => BaseType::Char,
        2 => BaseType::Short,
        3 => BaseType::Int,
        4 => BaseType::Long,
        5 => BaseType::Float,
        6 => BaseType::Double,
        7 => BaseType::Struct(r.read_str()?),
        tag => {
            return Err(DecodeError::UnknownTag {
                what: "base type",
                tag,
                offset,
            })
        }
    };
    let pointer_depth = r.read_u8()?;

    let offset = r.position();
    let flags = r.read_u8()?;
    if flags & !0b11 != 0 {
        return Err(DecodeError::UnknownTag {
            what: "type qualifier",
            tag: flags,
            offset,
        });
    }

    Ok(Type {
        base,
        is_const: flags & 1 != 0,
        is_unsigned: flags & 2 != 0,
        pointer_depth,
    })
}

/// Decode one node and its subtree.
pub fn read_node(r: &mut ByteReader<'_>) -> Result<AstNode, DecodeError> {
    TreeReader { r, depth: 0 }.node()
}

struct TreeReader<'r, 'a> {
    r: &'r mut ByteReader<'a>,
    depth: usize,
}

impl TreeReader<'_, '_> {
    fn node(&mut self) -> Result<AstNode, DecodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }
        let node = self.node_inner();
        self.depth -= 1;
        node
    }

    fn boxed(&mut self) -> Result<Box<AstNode>, DecodeError> {
        Ok(Box::new(self.node()?))
    }

    fn opt(&mut self) -> Result<Option<Box<AstNode>>, DecodeError> {
        if self.r.read_bool()? {
            Ok(Some(self.boxed()?))
        } else {
            Ok(None)
        }
    }

    fn list(&mut self) -> Result<Vec<AstNode>, DecodeError> {
        // Smallest node: tag + location
        let count = self.r.read_len(9)?;
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(self.node()?);
        }
        Ok(nodes)
    }

    fn compound(&mut self, what: &'static str) -> Result<Box<AstNode>, DecodeError> {
        let offset = self.r.position();
        let node = self.node()?;
        if !matches!(node, AstNode::Compound { .. }) {
            return Err(DecodeError::UnexpectedNode {
                expected: what,
                found: node.kind_name(),
                offset,
            });
        }
        Ok(Box::new(node))
    }

    fn node_inner(&mut self) -> Result<AstNode, DecodeError> {
        let offset = self.r.position();
        let tag = self.r.read_u8()?;
        let location = SourceLocation::new(self.r.read_u32()? as usize, self.r.read_u32()? as usize);

        let node = match tag {
            kind::TRANSLATION_UNIT => AstNode::TranslationUnit {
                declarations: self.list()?,
                location,
            },
            kind::FUNCTION_DECL => {
                let name = self.r.read_str()?;
                let return_type = read_type(self.r)?;
                let params = self.r.read_vec(4, |r| {
                    Ok(Param {
                        name: r.read_str()?,
                        param_type: read_type(r)?,
                    })
                })?;
                let body = if self.r.read_bool()? {
                    Some(self.compound("function body")?)
                } else {
                    None
                };
                AstNode::FunctionDecl {
                    name,
                    return_type,
                    params,
                    body,
                    location,
                }
            }
            kind::VAR_DECL => AstNode::VarDecl {
                name: self.r.read_str()?,
                var_type: read_type(self.r)?,
                init: self.opt()?,
                location,
            },
            kind::MODULE => AstNode::Module {
                name: self.r.read_str()?,
                location,
            },
            kind::IMPORT => AstNode::Import {
                name: self.r.read_str()?,
                path: self.r.read_opt(|r| r.read_str())?,
                location,
            },
            kind::EXPORT => AstNode::Export {
                name: self.r.read_str()?,
                location,
            },
            kind::COMPOUND => AstNode::Compound {
                statements: self.list()?,
                location,
            },
            kind::IF => AstNode::If {
                condition: self.boxed()?,
                then_branch: self.boxed()?,
                else_branch: self.opt()?,
                location,
            },
            kind::WHILE => AstNode::While {
                condition: self.boxed()?,
                body: self.boxed()?,
                location,
            },
            kind::DO_WHILE => AstNode::DoWhile {
                body: self.boxed()?,
                condition: self.boxed()?,
                location,
            },
            kind::FOR => AstNode::For {
                init: self.opt()?,
                condition: self.opt()?,
                increment: self.opt()?,
                body: self.boxed()?,
                location,
            },
            kind::RETURN => AstNode::Return {
                value: self.opt()?,
                location,
            },
            kind::BREAK => AstNode::Break { location },
            kind::CONTINUE => AstNode::Continue { location },
            kind::EXPRESSION_STATEMENT => AstNode::ExpressionStatement {
                expr: self.boxed()?,
                location,
            },
            kind::IDENTIFIER => AstNode::Identifier(self.r.read_str()?, location),
            kind::CONSTANT => {
                let tag_offset = self.r.position();
                let type_tag = self.r.read_u8()?;
                let payload = self.r.read_i64()?;
                let value = match type_tag {
                    0 => Constant::Int(payload),
                    1 => Constant::Float(f64::from_bits(payload as u64)),
                    2 => Constant::Char(payload),
                    tag => {
                        return Err(DecodeError::UnknownTag {
                            what: "constant type",
                            tag,
                            offset: tag_offset,
                        })
                    }
                };
                AstNode::Constant(value, location)
            }
            kind::STRING_LITERAL => AstNode::StringLiteral(self.r.read_str()?, location),
            kind::BINARY_OP => {
                let op_offset = self.r.position();
                let op_tag = self.r.read_u8()?;
                let op = *BIN_OPS.get(op_tag as usize).ok_or(DecodeError::UnknownTag {
                    what: "binary operator",
                    tag: op_tag,
                    offset: op_offset,
                })?;
                AstNode::BinaryOp {
                    op,
                    left: self.boxed()?,
                    right: self.boxed()?,
                    location,
                }
            }
            kind::UNARY_OP => {
                let op_offset = self.r.position();
                let op_tag = self.r.read_u8()?;
                let op = *UN_OPS.get(op_tag as usize).ok_or(DecodeError::UnknownTag {
                    what: "unary operator",
                    tag: op_tag,
                    offset: op_offset,
                })?;
                AstNode::UnaryOp {
                    op,
                    operand: self.boxed()?,
                    location,
                }
            }
            kind::ASSIGNMENT => AstNode::Assignment {
                lhs: self.boxed()?,
                rhs: self.boxed()?,
                location,
            },
            kind::CALL => AstNode::Call {
                callee: self.boxed()?,
                args: self.list()?,
                location,
            },
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "node kind",
                    tag,
                    offset,
                })
            }
        };

        Ok(node)
    }
}
