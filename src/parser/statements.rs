//! Statement parsing implementation
//!
//! This module handles parsing of all statement types:
//!
//! - Variable declarations: `int x = 42;`
//! - Control flow: `if`, `while`, `do-while`, `for`
//! - Jump statements: `return`, `break`, `continue`
//! - Compound statements: `{ ... }`
//! - Expression statements: function calls, assignments
//!
//! Bodies of compound and control-flow statements are parsed in full, so the
//! code generator sees every nested statement.
//!
//! # Grammar
//!
//! ```text
//! statement ::= var_decl | if_stmt | while_stmt | do_while_stmt | for_stmt
//!             | return_stmt | break_stmt | continue_stmt | block | expr_stmt | ";"
//! block     ::= "{" statement* "}"
//! ```
//!
//! All parsing methods are implemented as `pub(crate)` methods on the [`Parser`] struct.

use crate::parser::ast::*;
use crate::parser::lexer::TokenKind;
use crate::parser::parse::{ParseError, Parser};

impl Parser {
    /// Parse `{ statements }` into a `Compound` node
    pub(crate) fn parse_block(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.current_location();
        self.expect_lbrace("to open block")?;
        let statements = self.parse_block_statements();
        self.expect_rbrace("to close block")?;

        Ok(AstNode::Compound {
            statements,
            location: loc,
        })
    }

    /// Parse statements up to the closing brace, recovering from errors
    /// statement by statement.
    pub(crate) fn parse_block_statements(&mut self) -> Vec<AstNode> {
        let mut statements = Vec::new();

        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            let start = self.position;
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(err) => {
                    self.record(err);
                    self.synchronize();
                    if self.position == start {
                        self.advance();
                    }
                }
            }
        }

        statements
    }

    /// Parse a statement
    pub(crate) fn parse_statement(&mut self) -> Result<AstNode, ParseError> {
        self.nested(Parser::parse_statement_kind)
    }

    fn parse_statement_kind(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.current_location();

        if self.match_token(&TokenKind::Return) {
            return self.parse_return_statement();
        }

        if self.match_token(&TokenKind::If) {
            return self.parse_if_statement();
        }

        if self.match_token(&TokenKind::While) {
            return self.parse_while_statement();
        }

        if self.match_token(&TokenKind::Do) {
            return self.parse_do_while_statement();
        }

        if self.match_token(&TokenKind::For) {
            return self.parse_for_statement();
        }

        if self.match_token(&TokenKind::Break) {
            self.expect_semicolon("after 'break'")?;
            return Ok(AstNode::Break { location: loc });
        }

        if self.match_token(&TokenKind::Continue) {
            self.expect_semicolon("after 'continue'")?;
            return Ok(AstNode::Continue { location: loc });
        }

        if self.check(&TokenKind::LBrace) {
            return self.parse_block();
        }

        // Empty statement
        if self.match_token(&TokenKind::Semicolon) {
            return Ok(AstNode::Compound {
                statements: Vec::new(),
                location: loc,
            });
        }

        if self.is_type_keyword() {
            return self.parse_variable_declaration();
        }

        // Otherwise, it's an expression statement
        let expr = self.parse_expression()?;
        self.expect_semicolon("after expression")?;
        Ok(AstNode::ExpressionStatement {
            expr: Box::new(expr),
            location: loc,
        })
    }

    /// Parse return statement
    fn parse_return_statement(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.previous_location();

        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };

        self.expect_semicolon("after return")?;

        Ok(AstNode::Return {
            value,
            location: loc,
        })
    }

    /// Parse `( expression )` for a control-flow header
    fn parse_condition(&mut self, keyword: &str) -> Result<Box<AstNode>, ParseError> {
        self.expect_lparen(&format!("after '{keyword}'"))?;
        let condition = self.parse_expression()?;
        self.expect_rparen(&format!("after {keyword} condition"))?;
        Ok(Box::new(condition))
    }

    /// Parse if statement
    fn parse_if_statement(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.previous_location();

        let condition = self.parse_condition("if")?;
        let then_branch = Box::new(self.parse_statement()?);

        let else_branch = if self.match_token(&TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        Ok(AstNode::If {
            condition,
            then_branch,
            else_branch,
            location: loc,
        })
    }

    /// Parse while statement
    fn parse_while_statement(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.previous_location();

        let condition = self.parse_condition("while")?;
        let body = Box::new(self.parse_statement()?);

        Ok(AstNode::While {
            condition,
            body,
            location: loc,
        })
    }

    /// Parse do-while statement
    fn parse_do_while_statement(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.previous_location();

        let body = Box::new(self.parse_statement()?);

        self.expect_token(&TokenKind::While, "Expected 'while' after do body")?;
        let condition = self.parse_condition("while")?;
        self.expect_semicolon("after do-while")?;

        Ok(AstNode::DoWhile {
            body,
            condition,
            location: loc,
        })
    }

    /// Parse for statement
    fn parse_for_statement(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.previous_location();

        self.expect_lparen("after 'for'")?;

        // Init (optional)
        let init = if self.match_token(&TokenKind::Semicolon) {
            None
        } else if self.is_type_keyword() {
            // Declaration includes semicolon, so don't expect another
            Some(Box::new(self.parse_variable_declaration()?))
        } else {
            let expr_loc = self.current_location();
            let expr = self.parse_expression()?;
            self.expect_semicolon("after for init")?;
            Some(Box::new(AstNode::ExpressionStatement {
                expr: Box::new(expr),
                location: expr_loc,
            }))
        };

        // Condition (optional)
        let condition = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        self.expect_semicolon("after for condition")?;

        // Increment (optional)
        let increment = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };

        self.expect_rparen("after for clauses")?;

        let body = Box::new(self.parse_statement()?);

        Ok(AstNode::For {
            init,
            condition,
            increment,
            body,
            location: loc,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::ast::*;
    use crate::parser::parse::Parser;

    fn body_of(source: &str) -> Vec<AstNode> {
        let unit = Parser::new(source)
            .parse_translation_unit()
            .expect("Parsing failed");
        match unit.declarations() {
            [AstNode::FunctionDecl {
                body: Some(body), ..
            }] => match body.as_ref() {
                AstNode::Compound { statements, .. } => statements.clone(),
                other => panic!("Expected compound body, got {:?}", other),
            },
            other => panic!("Expected one function, got {:?}", other),
        }
    }

    #[test]
    fn test_control_flow_bodies_are_parsed() {
        let stmts = body_of(
            "int main() {
                int total = 0;
                for (int i = 0; i < 10; i++) { total += i; }
                while (total > 5) total = total - 1;
                do { total--; } while (total);
                if (total) { return 1; } else return 2;
            }",
        );

        assert_eq!(stmts.len(), 5);
        match &stmts[1] {
            AstNode::For {
                init: Some(init),
                condition: Some(_),
                increment: Some(_),
                body,
                ..
            } => {
                assert!(matches!(init.as_ref(), AstNode::VarDecl { name, .. } if name == "i"));
                assert!(matches!(body.as_ref(), AstNode::Compound { statements, .. } if statements.len() == 1));
            }
            other => panic!("Expected for loop, got {:?}", other),
        }
        assert!(matches!(&stmts[2], AstNode::While { .. }));
        assert!(matches!(&stmts[3], AstNode::DoWhile { .. }));
        assert!(matches!(
            &stmts[4],
            AstNode::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_break_continue_and_empty() {
        let stmts = body_of("int main() { while (1) { if (1) break; else continue; ; } }");

        match &stmts[0] {
            AstNode::While { body, .. } => match body.as_ref() {
                AstNode::Compound { statements, .. } => {
                    assert_eq!(statements.len(), 2);
                    assert!(matches!(&statements[1], AstNode::Compound { statements, .. } if statements.is_empty()));
                }
                other => panic!("Expected block, got {:?}", other),
            },
            other => panic!("Expected while, got {:?}", other),
        }
    }
}
