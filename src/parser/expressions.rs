//! Expression parsing implementation
//!
//! This module handles parsing of C expressions using precedence climbing
//! for binary operators and recursive descent for other expression forms.
//!
//! # Supported Expressions
//!
//! - Literals: integers, floats, characters, strings (adjacent strings concatenate)
//! - Identifiers
//! - Binary operators: arithmetic, comparison, logical, bitwise
//! - Unary operators: `-`, `+`, `!`, `~`, `&`, `*`, `++`, `--`
//! - Postfix: `()`, `++`, `--`
//! - Assignment, with compound forms rewritten to `x = x op rhs`
//! - Type casts `(type)expr`, which are accepted and dropped
//!
//! # Precedence
//!
//! Binary operators follow C precedence rules, lowest first:
//! `=` → `||` → `&&` → `|` → `^` → `&` → `== !=` → `< <= > >=` → `<< >>`
//! → `+ -` → `* / %` → unary → postfix → primary.
//!
//! All parsing methods are implemented as `pub(crate)` methods on the [`Parser`] struct.

use crate::parser::ast::*;
use crate::parser::lexer::TokenKind;
use crate::parser::parse::{ParseError, Parser};

impl Parser {
    /// Parse expression (top-level entry point)
    pub(crate) fn parse_expression(&mut self) -> Result<AstNode, ParseError> {
        self.nested(Parser::parse_assignment)
    }

    /// Parse assignment (right-associative)
    fn parse_assignment(&mut self) -> Result<AstNode, ParseError> {
        let expr = self.parse_logical_or()?;

        let loc = self.current_location();
        if self.match_token(&TokenKind::Eq) {
            let rhs = Box::new(self.parse_expression()?);
            return Ok(AstNode::Assignment {
                lhs: Box::new(expr),
                rhs,
                location: loc,
            });
        }

        let compound_op = match self.peek().kind {
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::SlashEq => Some(BinOp::Div),
            TokenKind::PercentEq => Some(BinOp::Mod),
            TokenKind::AmpEq => Some(BinOp::BitAnd),
            TokenKind::PipeEq => Some(BinOp::BitOr),
            TokenKind::CaretEq => Some(BinOp::BitXor),
            TokenKind::LtLtEq => Some(BinOp::BitShl),
            TokenKind::GtGtEq => Some(BinOp::BitShr),
            _ => None,
        };

        if let Some(op) = compound_op {
            self.advance();
            let rhs = self.parse_expression()?;
            let value = AstNode::BinaryOp {
                op,
                left: Box::new(expr.clone()),
                right: Box::new(rhs),
                location: loc,
            };
            return Ok(AstNode::Assignment {
                lhs: Box::new(expr),
                rhs: Box::new(value),
                location: loc,
            });
        }

        Ok(expr)
    }

    /// One left-associative precedence level
    fn parse_binary_level(
        &mut self,
        operators: &[(TokenKind, BinOp)],
        next: fn(&mut Parser) -> Result<AstNode, ParseError>,
    ) -> Result<AstNode, ParseError> {
        let mut left = next(self)?;

        'outer: loop {
            let loc = self.current_location();
            for (token, op) in operators {
                if self.match_token(token) {
                    let right = Box::new(next(self)?);
                    left = AstNode::BinaryOp {
                        op: *op,
                        left: Box::new(left),
                        right,
                        location: loc,
                    };
                    continue 'outer;
                }
            }
            break;
        }

        Ok(left)
    }

    /// Parse logical OR (||)
    fn parse_logical_or(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(&[(TokenKind::OrOr, BinOp::Or)], Parser::parse_logical_and)
    }

    /// Parse logical AND (&&)
    fn parse_logical_and(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(&[(TokenKind::AndAnd, BinOp::And)], Parser::parse_bitwise_or)
    }

    /// Parse bitwise OR (|)
    fn parse_bitwise_or(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(&[(TokenKind::Pipe, BinOp::BitOr)], Parser::parse_bitwise_xor)
    }

    /// Parse bitwise XOR (^)
    fn parse_bitwise_xor(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(&[(TokenKind::Caret, BinOp::BitXor)], Parser::parse_bitwise_and)
    }

    /// Parse bitwise AND (&)
    fn parse_bitwise_and(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(&[(TokenKind::Amp, BinOp::BitAnd)], Parser::parse_equality)
    }

    /// Parse equality (== !=)
    fn parse_equality(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(
            &[(TokenKind::EqEq, BinOp::Eq), (TokenKind::NotEq, BinOp::Ne)],
            Parser::parse_relational,
        )
    }

    /// Parse relational (< <= > >=)
    fn parse_relational(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(
            &[
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::Le, BinOp::Le),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::Ge, BinOp::Ge),
            ],
            Parser::parse_shift,
        )
    }

    /// Parse bitwise shift (<< >>)
    fn parse_shift(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(
            &[(TokenKind::LtLt, BinOp::BitShl), (TokenKind::GtGt, BinOp::BitShr)],
            Parser::parse_additive,
        )
    }

    /// Parse additive (+ -)
    fn parse_additive(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Parser::parse_multiplicative,
        )
    }

    /// Parse multiplicative (* / %)
    fn parse_multiplicative(&mut self) -> Result<AstNode, ParseError> {
        self.parse_binary_level(
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Mod),
            ],
            Parser::parse_cast,
        )
    }

    /// Parse cast: (type)expr. The target type is checked and then dropped.
    fn parse_cast(&mut self) -> Result<AstNode, ParseError> {
        let is_cast = self.check(&TokenKind::LParen)
            && self.peek_ahead(1).is_some_and(|t| {
                matches!(
                    t.kind,
                    TokenKind::Int
                        | TokenKind::Char
                        | TokenKind::Void
                        | TokenKind::Float
                        | TokenKind::Double
                        | TokenKind::Long
                        | TokenKind::Short
                        | TokenKind::Unsigned
                        | TokenKind::Signed
                        | TokenKind::Struct
                        | TokenKind::Const
                )
            });

        if is_cast {
            self.advance(); // consume '('
            self.parse_type()?;
            self.expect_rparen("after cast type")?;
            return self.nested(Parser::parse_cast);
        }

        self.parse_unary()
    }

    /// Parse unary (! ~ - + & * ++ --)
    fn parse_unary(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.current_location();

        let op = match self.peek().kind {
            TokenKind::Bang => Some(UnOp::Not),
            TokenKind::Tilde => Some(UnOp::BitNot),
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Plus => Some(UnOp::Plus),
            TokenKind::Amp => Some(UnOp::AddrOf),
            TokenKind::Star => Some(UnOp::Deref),
            TokenKind::PlusPlus => Some(UnOp::PreInc),
            TokenKind::MinusMinus => Some(UnOp::PreDec),
            TokenKind::Sizeof => {
                return Err(self.error_here("'sizeof' is not supported"));
            }
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let operand = Box::new(self.nested(Parser::parse_cast)?);
            return Ok(AstNode::UnaryOp {
                op,
                operand,
                location: loc,
            });
        }

        self.parse_postfix()
    }

    /// Parse postfix (++ -- ())
    fn parse_postfix(&mut self) -> Result<AstNode, ParseError> {
        let mut expr = self.parse_primary()?;

        loop {
            let loc = self.current_location();

            if self.match_token(&TokenKind::PlusPlus) {
                expr = AstNode::UnaryOp {
                    op: UnOp::PostInc,
                    operand: Box::new(expr),
                    location: loc,
                };
            } else if self.match_token(&TokenKind::MinusMinus) {
                expr = AstNode::UnaryOp {
                    op: UnOp::PostDec,
                    operand: Box::new(expr),
                    location: loc,
                };
            } else if self.match_token(&TokenKind::LParen) {
                let args = self.parse_argument_list()?;
                self.expect_rparen("after function arguments")?;
                expr = AstNode::Call {
                    callee: Box::new(expr),
                    args,
                    location: loc,
                };
            } else if self.check(&TokenKind::LBracket)
                || self.check(&TokenKind::Dot)
                || self.check(&TokenKind::Arrow)
            {
                return Err(self.error_here(format!(
                    "{} access is not supported",
                    self.peek()
                )));
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Parse argument list: (expr, expr, ...)
    fn parse_argument_list(&mut self) -> Result<Vec<AstNode>, ParseError> {
        let mut args = Vec::new();

        if self.check(&TokenKind::RParen) {
            return Ok(args);
        }

        loop {
            args.push(self.parse_expression()?);

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        Ok(args)
    }

    /// Parse primary (literals, identifiers, parenthesized expressions)
    fn parse_primary(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.current_location();

        match self.peek().kind.clone() {
            TokenKind::IntLiteral(n) => {
                self.advance();
                Ok(AstNode::Constant(Constant::Int(n), loc))
            }
            TokenKind::FloatLiteral(x) => {
                self.advance();
                Ok(AstNode::Constant(Constant::Float(x), loc))
            }
            TokenKind::CharLiteral(c) => {
                self.advance();
                Ok(AstNode::Constant(Constant::Char(c), loc))
            }
            TokenKind::StringLiteral(mut s) => {
                self.advance();
                while let TokenKind::StringLiteral(next) = &self.peek().kind {
                    s.push_str(next);
                    self.advance();
                }
                Ok(AstNode::StringLiteral(s, loc))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(AstNode::Identifier(name, loc))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_rparen("after expression")?;
                Ok(expr)
            }
            _ => Err(self.error_here(format!("Unexpected token: {}", self.peek()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::ast::*;
    use crate::parser::parse::Parser;

    fn expr_of(source: &str) -> AstNode {
        let wrapped = format!("int main() {{ return {}; }}", source);
        let unit = Parser::new(&wrapped)
            .parse_translation_unit()
            .expect("Parsing failed");
        match unit.declarations() {
            [AstNode::FunctionDecl {
                body: Some(body), ..
            }] => match body.as_ref() {
                AstNode::Compound { statements, .. } => match &statements[0] {
                    AstNode::Return {
                        value: Some(value), ..
                    } => value.as_ref().clone(),
                    other => panic!("Expected return, got {:?}", other),
                },
                other => panic!("Expected compound, got {:?}", other),
            },
            other => panic!("Expected one function, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        match expr_of("1 + 2 * 3") {
            AstNode::BinaryOp {
                op: BinOp::Add,
                right,
                ..
            } => assert!(matches!(*right, AstNode::BinaryOp { op: BinOp::Mul, .. })),
            other => panic!("Expected addition at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_left_associativity() {
        match expr_of("10 - 4 - 3") {
            AstNode::BinaryOp {
                op: BinOp::Sub,
                left,
                right,
                ..
            } => {
                assert!(matches!(*left, AstNode::BinaryOp { op: BinOp::Sub, .. }));
                assert!(matches!(*right, AstNode::Constant(Constant::Int(3), _)));
            }
            other => panic!("Expected subtraction, got {:?}", other),
        }
    }

    #[test]
    fn test_compound_assignment_desugars() {
        match expr_of("x <<= 2") {
            AstNode::Assignment { lhs, rhs, .. } => {
                assert!(matches!(*lhs, AstNode::Identifier(ref n, _) if n == "x"));
                assert!(matches!(*rhs, AstNode::BinaryOp { op: BinOp::BitShl, .. }));
            }
            other => panic!("Expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_call_with_arguments() {
        match expr_of("printf(\"%d\\n\", a + 1, f())") {
            AstNode::Call { callee, args, .. } => {
                assert!(matches!(*callee, AstNode::Identifier(ref n, _) if n == "printf"));
                assert_eq!(args.len(), 3);
                assert!(matches!(&args[0], AstNode::StringLiteral(s, _) if s == "%d\n"));
            }
            other => panic!("Expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_nesting_limit_reports_error() {
        let depth = 20_000;
        let source = format!(
            "int main() {{ return {}1{}; }}",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        let errors = Parser::new(&source)
            .parse_translation_unit()
            .expect_err("runaway nesting must fail");
        assert!(errors.0[0].message.contains("Nesting exceeds"));

        let unary = format!("int main() {{ return {}1; }}", "- ".repeat(depth));
        assert!(Parser::new(&unary).parse_translation_unit().is_err());

        let blocks = format!("int main() {{ {} return 0; {} }}", "{".repeat(depth), "}".repeat(depth));
        assert!(Parser::new(&blocks).parse_translation_unit().is_err());
    }

    #[test]
    fn test_moderate_nesting_parses() {
        match expr_of(&format!("{}7{}", "(".repeat(40), ")".repeat(40))) {
            AstNode::Constant(Constant::Int(7), _) => {}
            other => panic!("Expected constant, got {:?}", other),
        }
        assert!(matches!(
            expr_of(&format!("{}x", "- ".repeat(40))),
            AstNode::UnaryOp { op: UnOp::Neg, .. }
        ));
    }

    #[test]
    fn test_unary_and_postfix() {
        assert!(matches!(expr_of("-x"), AstNode::UnaryOp { op: UnOp::Neg, .. }));
        assert!(matches!(expr_of("!x"), AstNode::UnaryOp { op: UnOp::Not, .. }));
        assert!(matches!(expr_of("x++"), AstNode::UnaryOp { op: UnOp::PostInc, .. }));
        assert!(matches!(expr_of("(int)'a'"), AstNode::Constant(Constant::Char(97), _)));
    }
}
