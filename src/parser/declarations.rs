//! Declaration parsing implementation
//!
//! This module handles parsing of top-level declarations:
//!
//! - Function definitions and prototypes: `type name(params) { ... }` / `type name(params);`
//! - Global variables: `type name [= init];`
//! - Module lines: `module name;`, `import name [from "path"];`, `export name;`
//! - Type parsing: qualifiers, base types, pointers
//!
//! # Grammar
//!
//! ```text
//! declaration  ::= module_decl | import_decl | export_decl | function | global
//! module_decl  ::= "module" identifier ";"
//! import_decl  ::= "import" identifier ("from" string)? ";"
//! export_decl  ::= "export" identifier ";"
//! function     ::= type identifier "(" params ")" (block | ";")
//! global       ::= type identifier ("=" expression)? ";"
//! type         ::= qualifier* base_type ("*" "const"?)*
//! ```
//!
//! All parsing methods are implemented as `pub(crate)` methods on the [`Parser`] struct.

use crate::parser::ast::*;
use crate::parser::lexer::TokenKind;
use crate::parser::parse::{ParseError, Parser};

impl Parser {
    /// Parse one top-level declaration
    pub(crate) fn parse_top_level_declaration(&mut self) -> Result<AstNode, ParseError> {
        let loc = self.current_location();

        if self.match_token(&TokenKind::Module) {
            let name = self.expect_identifier()?;
            self.expect_semicolon("after module name")?;
            return Ok(AstNode::Module {
                name,
                location: loc,
            });
        }

        if self.match_token(&TokenKind::Import) {
            return self.parse_import(loc);
        }

        if self.match_token(&TokenKind::Export) {
            let name = self.expect_identifier()?;
            self.expect_semicolon("after exported name")?;
            return Ok(AstNode::Export {
                name,
                location: loc,
            });
        }

        let decl_type = self.parse_type()?;
        let name = self.expect_identifier()?;
        let name_loc = self.previous_location();

        if self.check(&TokenKind::LParen) {
            return self.parse_function_rest(decl_type, name, name_loc);
        }

        self.parse_variable_rest(decl_type, name, name_loc)
    }

    /// Parse `import name [from "path"];` after the keyword
    fn parse_import(&mut self, loc: SourceLocation) -> Result<AstNode, ParseError> {
        let name = self.expect_identifier()?;

        let path = if self.match_token(&TokenKind::From) {
            match &self.peek().kind {
                TokenKind::StringLiteral(path) => {
                    let path = path.clone();
                    self.advance();
                    Some(path)
                }
                _ => {
                    return Err(self.error_here(format!(
                        "Expected module path string after 'from', found {}",
                        self.peek()
                    )))
                }
            }
        } else {
            None
        };

        self.expect_semicolon("after import")?;
        Ok(AstNode::Import {
            name,
            path,
            location: loc,
        })
    }

    /// Parse the parameter list and body (or `;`) of a function
    fn parse_function_rest(
        &mut self,
        return_type: Type,
        name: String,
        loc: SourceLocation,
    ) -> Result<AstNode, ParseError> {
        self.expect_lparen("after function name")?;
        let params = self.parse_parameter_list()?;
        self.expect_rparen("after parameters")?;

        let body = if self.match_token(&TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_block()?))
        };

        Ok(AstNode::FunctionDecl {
            name,
            return_type,
            params,
            body,
            location: loc,
        })
    }

    /// Parse parameter list: (type name, type name, ...)
    pub(crate) fn parse_parameter_list(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();

        if self.check(&TokenKind::RParen) {
            return Ok(params);
        }

        // Special case: (void) means no parameters in C
        if self.check(&TokenKind::Void)
            && matches!(self.peek_ahead(1).map(|t| &t.kind), Some(TokenKind::RParen))
        {
            self.advance();
            return Ok(params);
        }

        loop {
            if self.match_token(&TokenKind::Ellipsis) {
                // Variadic tail carries no named parameters
                break;
            }

            let param_type = self.parse_type()?;
            let name = match &self.peek().kind {
                TokenKind::Ident(name) => {
                    let name = name.clone();
                    self.advance();
                    name
                }
                // Unnamed parameter in a prototype
                _ => String::new(),
            };
            params.push(Param { name, param_type });

            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }

        Ok(params)
    }

    /// Parse type: qualifier* base_type ("*" "const"?)*
    pub(crate) fn parse_type(&mut self) -> Result<Type, ParseError> {
        let mut is_const = false;
        let mut is_unsigned = false;
        let mut saw_sign = false;

        loop {
            if self.match_token(&TokenKind::Const) {
                is_const = true;
            } else if self.match_token(&TokenKind::Unsigned) {
                is_unsigned = true;
                saw_sign = true;
            } else if self.match_token(&TokenKind::Signed) {
                saw_sign = true;
            } else if self.match_token(&TokenKind::Static) || self.match_token(&TokenKind::Extern) {
                // Storage class has no effect on code generation
            } else {
                break;
            }
        }

        let base = match self.peek().kind.clone() {
            TokenKind::Int => {
                self.advance();
                BaseType::Int
            }
            TokenKind::Char => {
                self.advance();
                BaseType::Char
            }
            TokenKind::Void => {
                self.advance();
                BaseType::Void
            }
            TokenKind::Float => {
                self.advance();
                BaseType::Float
            }
            TokenKind::Double => {
                self.advance();
                BaseType::Double
            }
            TokenKind::Short => {
                self.advance();
                self.match_token(&TokenKind::Int);
                BaseType::Short
            }
            TokenKind::Long => {
                self.advance();
                self.match_token(&TokenKind::Long);
                if self.match_token(&TokenKind::Double) {
                    BaseType::Double
                } else {
                    self.match_token(&TokenKind::Int);
                    BaseType::Long
                }
            }
            TokenKind::Struct => {
                self.advance();
                BaseType::Struct(self.expect_identifier()?)
            }
            _ if saw_sign => BaseType::Int,
            _ => return Err(self.error_here(format!("Expected type, found {}", self.peek()))),
        };

        // Trailing qualifier: `int const x`
        if self.match_token(&TokenKind::Const) {
            is_const = true;
        }

        let mut ty = Type::new(base);
        ty.is_const = is_const;
        ty.is_unsigned = is_unsigned;
        while self.match_token(&TokenKind::Star) {
            ty = ty.with_pointer();
            self.match_token(&TokenKind::Const);
        }

        Ok(ty)
    }

    /// Parse the optional initializer and `;` of a variable declaration
    pub(crate) fn parse_variable_rest(
        &mut self,
        var_type: Type,
        name: String,
        loc: SourceLocation,
    ) -> Result<AstNode, ParseError> {
        let init = if self.match_token(&TokenKind::Eq) {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };

        self.expect_semicolon("after variable declaration")?;

        Ok(AstNode::VarDecl {
            name,
            var_type,
            init,
            location: loc,
        })
    }

    /// Parse variable declaration: type name [= init];
    pub(crate) fn parse_variable_declaration(&mut self) -> Result<AstNode, ParseError> {
        let var_type = self.parse_type()?;
        let name = self.expect_identifier()?;
        let loc = self.previous_location();
        self.parse_variable_rest(var_type, name, loc)
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::ast::*;
    use crate::parser::parse::Parser;

    fn parse(source: &str) -> Vec<AstNode> {
        match Parser::new(source).parse_translation_unit() {
            Ok(AstNode::TranslationUnit { declarations, .. }) => declarations,
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_module_import_export() {
        let decls = parse("module math;\nimport io from \"libc.rt\";\nimport util;\nexport add;");

        assert!(matches!(&decls[0], AstNode::Module { name, .. } if name == "math"));
        assert!(matches!(
            &decls[1],
            AstNode::Import { name, path: Some(p), .. } if name == "io" && p == "libc.rt"
        ));
        assert!(matches!(&decls[2], AstNode::Import { path: None, .. }));
        assert!(matches!(&decls[3], AstNode::Export { name, .. } if name == "add"));
    }

    #[test]
    fn test_prototype_and_global() {
        let decls = parse("int add(int a, int b);\nunsigned long counter = 3;\nconst char *name;");

        match &decls[0] {
            AstNode::FunctionDecl { params, body, .. } => {
                assert_eq!(params.len(), 2);
                assert!(body.is_none());
            }
            other => panic!("Expected prototype, got {:?}", other),
        }
        match &decls[1] {
            AstNode::VarDecl { var_type, init, .. } => {
                assert_eq!(var_type.base, BaseType::Long);
                assert!(var_type.is_unsigned);
                assert!(init.is_some());
            }
            other => panic!("Expected global, got {:?}", other),
        }
        match &decls[2] {
            AstNode::VarDecl { var_type, .. } => {
                assert_eq!(var_type.base, BaseType::Char);
                assert!(var_type.is_const);
                assert_eq!(var_type.pointer_depth, 1);
            }
            other => panic!("Expected global, got {:?}", other),
        }
    }

    #[test]
    fn test_void_and_variadic_params() {
        let decls = parse("int f(void);\nint printf(const char *fmt, ...);");

        assert!(matches!(&decls[0], AstNode::FunctionDecl { params, .. } if params.is_empty()));
        assert!(matches!(&decls[1], AstNode::FunctionDecl { params, .. } if params.len() == 1));
    }
}
