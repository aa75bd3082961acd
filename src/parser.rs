use thiserror::Error;

use crate::ast::{
    ArrowBody, BinaryOp, Expr, ExprKind, LogicalOp, MethodDef, Program, Route, SceneElement, Stmt,
    StmtKind, UnaryOp,
};
use crate::token::{Span, Token, TokenKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("Expected {expected}, found {found} at {span}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },
    #[error("Invalid assignment target at {span}")]
    InvalidAssignmentTarget { span: Span },
}

pub type ParseResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::Eof, Span::default()));
        }
        Self { tokens, pos: 0 }
    }

    pub fn parse_program(mut self) -> ParseResult<Program> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if self.skip_newlines() {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Program { statements })
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        match &self.current().kind {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Function => self.parse_function(),
            TokenKind::Async => {
                // `async` is reserved: the declaration compiles like its
                // synchronous form.
                self.advance();
                self.parse_function()
            }
            TokenKind::Return => self.parse_return(),
            TokenKind::Class => self.parse_class(),
            TokenKind::Try => self.parse_try(),
            TokenKind::Throw => self.parse_throw(),
            TokenKind::Match => self.parse_match(),
            TokenKind::Scene => self.parse_scene(),
            TokenKind::Import => self.parse_import(),
            TokenKind::From => self.parse_from_import(),
            TokenKind::Const => self.parse_const(),
            TokenKind::Export => {
                self.advance();
                self.parse_statement()
            }
            TokenKind::Break => {
                self.advance();
                self.end_statement();
                Ok(Stmt::new(StmtKind::Break, span))
            }
            TokenKind::Continue => {
                self.advance();
                self.end_statement();
                Ok(Stmt::new(StmtKind::Continue, span))
            }
            TokenKind::LBrace => {
                let body = self.parse_block()?;
                Ok(Stmt::new(StmtKind::Block(body), span))
            }
            TokenKind::Identifier(name) if name == "web" && self.is_web_app() => self.parse_web_app(),
            _ => {
                let expr = self.parse_expression()?;
                self.end_statement();
                Ok(Stmt::new(StmtKind::Expr(expr), span))
            }
        }
    }

    /// `web.app {` introduces a declaration; any other use of `web` is an
    /// ordinary expression.
    fn is_web_app(&self) -> bool {
        matches!(self.peek_kind(1), TokenKind::Dot)
            && matches!(self.peek_kind(2), TokenKind::Identifier(name) if name == "app")
            && matches!(self.peek_kind(3), TokenKind::LBrace)
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.skip_newlines() {
                continue;
            }
            body.push(self.parse_statement()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(body)
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance(); // if / elif
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;

        self.skip_newlines();
        let else_body = if self.check(&TokenKind::Elif) {
            // An elif chain nests: `elif c {}` is `else { if c {} }`.
            let nested = self.parse_if()?;
            Some(vec![nested])
        } else if self.check(&TokenKind::Else) {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };

        Ok(Stmt::new(
            StmtKind::If {
                condition,
                then_body,
                else_body,
            },
            span,
        ))
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        Ok(Stmt::new(StmtKind::While { condition, body }, span))
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let variable = self.expect_identifier()?;
        self.expect(TokenKind::In)?;
        let iterable = self.parse_expression()?;
        let body = self.parse_block()?;
        Ok(Stmt::new(
            StmtKind::For {
                variable,
                iterable,
                body,
            },
            span,
        ))
    }

    fn parse_function(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.expect(TokenKind::Function)?;
        let name = self.expect_identifier()?;
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(Stmt::new(StmtKind::FunctionDef { name, params, body }, span))
    }

    fn parse_params(&mut self) -> ParseResult<Vec<String>> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            params.push(self.expect_identifier()?);
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_return(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let value = if matches!(
            self.current().kind,
            TokenKind::Newline | TokenKind::RBrace | TokenKind::Eof | TokenKind::Semicolon
        ) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.end_statement();
        Ok(Stmt::new(StmtKind::Return(value), span))
    }

    fn parse_class(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let name = self.expect_identifier()?;
        let base = if self.check(&TokenKind::Extends) {
            self.advance();
            Some(self.expect_identifier()?)
        } else {
            None
        };

        self.expect(TokenKind::LBrace)?;
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.skip_newlines() {
                continue;
            }
            let method_span = self.current().span;
            self.expect(TokenKind::Function)?;
            let method_name = self.expect_identifier()?;
            let params = self.parse_params()?;
            let body = self.parse_block()?;
            methods.push(MethodDef {
                name: method_name,
                params,
                body,
                span: method_span,
            });
        }
        self.expect(TokenKind::RBrace)?;

        Ok(Stmt::new(
            StmtKind::ClassDef {
                name,
                base,
                methods,
            },
            span,
        ))
    }

    fn parse_try(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let body = self.parse_block()?;

        self.skip_newlines();
        let catch = if self.check(&TokenKind::Catch) {
            self.advance();
            let binding = if let TokenKind::Identifier(_) = self.current().kind {
                Some(self.expect_identifier()?)
            } else {
                None
            };
            Some((binding, self.parse_block()?))
        } else {
            None
        };

        self.skip_newlines();
        let finally = if self.check(&TokenKind::Finally) {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };

        if catch.is_none() && finally.is_none() {
            return Err(self.unexpected("'catch' or 'finally'"));
        }

        Ok(Stmt::new(
            StmtKind::Try {
                body,
                catch,
                finally,
            },
            span,
        ))
    }

    fn parse_throw(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let value = self.parse_expression()?;
        self.end_statement();
        Ok(Stmt::new(StmtKind::Throw(value), span))
    }

    fn parse_match(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let subject = self.parse_expression()?;
        self.expect(TokenKind::LBrace)?;

        let mut arms = Vec::new();
        let mut default = None;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.skip_newlines() {
                continue;
            }
            if self.check(&TokenKind::Case) {
                self.advance();
                let case = self.parse_expression()?;
                let body = self.parse_block()?;
                arms.push((case, body));
            } else if self.check(&TokenKind::Default) {
                self.advance();
                default = Some(self.parse_block()?);
            } else {
                return Err(self.unexpected("'case' or 'default'"));
            }
        }
        self.expect(TokenKind::RBrace)?;

        Ok(Stmt::new(
            StmtKind::Match {
                subject,
                arms,
                default,
            },
            span,
        ))
    }

    fn parse_scene(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let name = self.expect_identifier()?;
        self.expect(TokenKind::LBrace)?;

        let mut elements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.skip_newlines() {
                continue;
            }
            let element_type = self.expect_identifier()?;
            let mut properties = Vec::new();
            // Properties belong to this element while `IDENT :` follows; a
            // bare identifier starts the next element instead.
            while matches!(self.current().kind, TokenKind::Identifier(_))
                && matches!(self.peek_kind(1), TokenKind::Colon)
            {
                let key = self.expect_identifier()?;
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expression()?;
                properties.push((key, value));
            }
            elements.push(SceneElement {
                element_type,
                properties,
            });
        }
        self.expect(TokenKind::RBrace)?;

        Ok(Stmt::new(StmtKind::Scene { name, elements }, span))
    }

    fn parse_web_app(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance(); // web
        self.expect(TokenKind::Dot)?;
        self.expect_identifier()?; // app
        self.expect(TokenKind::LBrace)?;

        let mut routes = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.skip_newlines() {
                continue;
            }
            let route_span = self.current().span;
            self.expect(TokenKind::Route)?;
            let path = self.expect_string()?;
            let body = self.parse_block()?;
            routes.push(Route {
                path,
                body,
                span: route_span,
            });
        }
        self.expect(TokenKind::RBrace)?;

        Ok(Stmt::new(StmtKind::WebApp { routes }, span))
    }

    fn parse_import(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let module = self.expect_identifier()?;
        self.end_statement();
        Ok(Stmt::new(
            StmtKind::Import {
                module,
                names: Vec::new(),
            },
            span,
        ))
    }

    fn parse_from_import(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let module = self.expect_identifier()?;
        self.expect(TokenKind::Import)?;
        let mut names = vec![self.expect_identifier()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            names.push(self.expect_identifier()?);
        }
        self.end_statement();
        Ok(Stmt::new(StmtKind::Import { module, names }, span))
    }

    /// `const NAME = expr` lowers to a plain assignment; the binding kind is
    /// not tracked at runtime.
    fn parse_const(&mut self) -> ParseResult<Stmt> {
        let span = self.current().span;
        self.advance();
        let name_span = self.current().span;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::Assign)?;
        let value = self.parse_expression()?;
        self.end_statement();
        let target = Expr::new(ExprKind::Identifier(name), name_span);
        Ok(Stmt::new(
            StmtKind::Expr(Expr::new(
                ExprKind::Assign {
                    target: Box::new(target),
                    op: None,
                    value: Box::new(value),
                },
                span,
            )),
            span,
        ))
    }

    // Expressions, lowest precedence first.

    pub fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        let expr = self.parse_or()?;

        let op = match self.current().kind {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Sub),
            TokenKind::StarAssign => Some(BinaryOp::Mul),
            TokenKind::SlashAssign => Some(BinaryOp::Div),
            _ => return Ok(expr),
        };

        if !matches!(
            expr.kind,
            ExprKind::Identifier(_) | ExprKind::Member { .. } | ExprKind::Index { .. }
        ) {
            return Err(ParseError::InvalidAssignmentTarget { span: expr.span });
        }

        let span = self.current().span;
        self.advance();
        let value = self.parse_assignment()?; // right-associative
        Ok(Expr::new(
            ExprKind::Assign {
                target: Box::new(expr),
                op,
                value: Box::new(value),
            },
            span,
        ))
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            let span = self.current().span;
            self.advance();
            let right = self.parse_and()?;
            expr = Expr::new(
                ExprKind::Logical {
                    op: LogicalOp::Or,
                    left: Box::new(expr),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_not()?;
        while self.check(&TokenKind::And) {
            let span = self.current().span;
            self.advance();
            let right = self.parse_not()?;
            expr = Expr::new(
                ExprKind::Logical {
                    op: LogicalOp::And,
                    left: Box::new(expr),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.check(&TokenKind::Not) {
            let span = self.current().span;
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = match self.current().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                _ => break,
            };
            let span = self.current().span;
            self.advance();
            let right = self.parse_comparison()?;
            expr = binary(op, expr, right, span);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_addition()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::LessEq => BinaryOp::Le,
                TokenKind::GreaterEq => BinaryOp::Ge,
                _ => break,
            };
            let span = self.current().span;
            self.advance();
            let right = self.parse_addition()?;
            expr = binary(op, expr, right, span);
        }
        Ok(expr)
    }

    fn parse_addition(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_multiplication()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let span = self.current().span;
            self.advance();
            let right = self.parse_multiplication()?;
            expr = binary(op, expr, right, span);
        }
        Ok(expr)
    }

    fn parse_multiplication(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_power()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let span = self.current().span;
            self.advance();
            let right = self.parse_power()?;
            expr = binary(op, expr, right, span);
        }
        Ok(expr)
    }

    fn parse_power(&mut self) -> ParseResult<Expr> {
        let expr = self.parse_unary()?;
        if self.check(&TokenKind::Caret) {
            let span = self.current().span;
            self.advance();
            let right = self.parse_power()?; // right-associative
            return Ok(binary(BinaryOp::Pow, expr, right, span));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.check(&TokenKind::Minus) {
            let span = self.current().span;
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        if self.check(&TokenKind::Await) {
            let span = self.current().span;
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Await(Box::new(operand)), span));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current().kind {
                TokenKind::LParen => {
                    let span = self.current().span;
                    let args = self.parse_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                TokenKind::Dot => {
                    let span = self.current().span;
                    self.advance();
                    let name = self.expect_identifier()?;
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            name,
                        },
                        span,
                    );
                }
                TokenKind::LBracket => {
                    let span = self.current().span;
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.check(&TokenKind::RParen) {
            args.push(self.parse_expression()?);
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let span = self.current().span;
        match self.current().kind.clone() {
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Number(value), span))
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(value), span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::Null, span))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Identifier(name), span))
            }
            TokenKind::This => {
                self.advance();
                Ok(Expr::new(ExprKind::This, span))
            }
            TokenKind::New => self.parse_new(),
            TokenKind::Super => self.parse_super_call(),
            TokenKind::LParen => {
                if let Some(arrow) = self.try_parse_arrow() {
                    return arrow;
                }
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    elements.push(self.parse_expression()?);
                    if self.check(&TokenKind::Comma) {
                        self.advance();
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::new(ExprKind::Array(elements), span))
            }
            TokenKind::LBrace => self.parse_object_literal(),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_new(&mut self) -> ParseResult<Expr> {
        let span = self.current().span;
        self.advance();
        // The class reference may be a dotted path, but not itself a call.
        let mut class = {
            let class_span = self.current().span;
            let name = self.expect_identifier()?;
            Expr::new(ExprKind::Identifier(name), class_span)
        };
        while self.check(&TokenKind::Dot) {
            let dot_span = self.current().span;
            self.advance();
            let name = self.expect_identifier()?;
            class = Expr::new(
                ExprKind::Member {
                    object: Box::new(class),
                    name,
                },
                dot_span,
            );
        }
        let args = self.parse_args()?;
        Ok(Expr::new(
            ExprKind::New {
                class: Box::new(class),
                args,
            },
            span,
        ))
    }

    fn parse_super_call(&mut self) -> ParseResult<Expr> {
        let span = self.current().span;
        self.advance();
        self.expect(TokenKind::Dot)?;
        let method = self.expect_identifier()?;
        let args = self.parse_args()?;
        Ok(Expr::new(ExprKind::SuperCall { method, args }, span))
    }

    /// Attempts `(params) -> body`. Returns `None` (with the cursor rewound)
    /// when the parenthesis turns out to open a grouped expression instead.
    fn try_parse_arrow(&mut self) -> Option<ParseResult<Expr>> {
        let start = self.pos;
        let span = self.current().span;
        self.advance(); // (

        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            match self.current().kind.clone() {
                TokenKind::Identifier(name) => {
                    self.advance();
                    params.push(name);
                }
                _ => {
                    self.pos = start;
                    return None;
                }
            }
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else if !self.check(&TokenKind::RParen) {
                self.pos = start;
                return None;
            }
        }
        self.advance(); // )

        if !self.check(&TokenKind::Arrow) {
            self.pos = start;
            return None;
        }
        self.advance(); // -> : committed from here on

        let body = if self.check(&TokenKind::LBrace) {
            match self.parse_block() {
                Ok(body) => ArrowBody::Block(body),
                Err(err) => return Some(Err(err)),
            }
        } else {
            match self.parse_assignment() {
                Ok(expr) => ArrowBody::Expr(Box::new(expr)),
                Err(err) => return Some(Err(err)),
            }
        };

        Some(Ok(Expr::new(ExprKind::Arrow { params, body }, span)))
    }

    fn parse_object_literal(&mut self) -> ParseResult<Expr> {
        let span = self.current().span;
        self.expect(TokenKind::LBrace)?;
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = match self.current().kind.clone() {
                TokenKind::Identifier(name) => {
                    self.advance();
                    name
                }
                TokenKind::Str(value) => {
                    self.advance();
                    value
                }
                _ => return Err(self.unexpected("object key")),
            };
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expression()?;
            entries.push((key, value));
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Object(entries), span))
    }

    // Token plumbing.

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|token| &token.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn skip_newlines(&mut self) -> bool {
        let mut skipped = false;
        while self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) {
            self.advance();
            skipped = true;
        }
        skipped
    }

    /// Statements terminate at a newline, semicolon, closing brace or EOF;
    /// separators are consumed, boundaries are left for the caller.
    fn end_statement(&mut self) {
        while self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.current().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.describe()))
        }
    }

    fn expect_identifier(&mut self) -> ParseResult<String> {
        match self.current().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expect_string(&mut self) -> ParseResult<String> {
        match self.current().kind.clone() {
            TokenKind::Str(value) => {
                self.advance();
                Ok(value)
            }
            _ => Err(self.unexpected("string literal")),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: self.current().kind.describe(),
            span: self.current().span,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, span: Span) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

pub fn parse_tokens(tokens: Vec<Token>) -> ParseResult<Program> {
    Parser::new(tokens).parse_program()
}

/// Convenience entry used by tests and the REPL: lex then parse.
pub fn parse_source(source: &str) -> anyhow::Result<Program> {
    let tokens = crate::lexer::tokenize(source)?;
    Ok(parse_tokens(tokens)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(source: &str) -> Program {
        parse_source(source).expect("parse should succeed")
    }

    fn first_expr(program: &Program) -> &Expr {
        match &program.statements[0].kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn parses_assignment_and_call() {
        let program = parse("x = 10\nprint(x + 1)\n");
        assert_eq!(program.statements.len(), 2);
        let assign = first_expr(&program);
        assert!(matches!(assign.kind, ExprKind::Assign { op: None, .. }));
        match &program.statements[1].kind {
            StmtKind::Expr(expr) => assert!(matches!(expr.kind, ExprKind::Call { .. })),
            other => panic!("expected call statement, got {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let program = parse("1 + 2 * 3");
        let expr = first_expr(&program);
        let ExprKind::Binary { op, right, .. } = &expr.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn power_is_right_associative() {
        let program = parse("2 ^ 3 ^ 2");
        let expr = first_expr(&program);
        let ExprKind::Binary { op, left, right } = &expr.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::Pow);
        assert!(matches!(left.kind, ExprKind::Number(_)));
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOp::Pow,
                ..
            }
        ));
    }

    #[test]
    fn not_binds_looser_than_equality() {
        let program = parse("not a == b");
        let expr = first_expr(&program);
        let ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } = &expr.kind
        else {
            panic!("expected unary not");
        };
        assert!(matches!(
            operand.kind,
            ExprKind::Binary {
                op: BinaryOp::Eq,
                ..
            }
        ));
    }

    #[test]
    fn parses_arrow_function_with_expression_body() {
        let program = parse("add = (a, b) -> a + b");
        let expr = first_expr(&program);
        let ExprKind::Assign { value, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        let ExprKind::Arrow { params, body } = &value.kind else {
            panic!("expected arrow function");
        };
        assert_eq!(params, &vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(body, ArrowBody::Expr(_)));
    }

    #[test]
    fn parenthesized_expression_is_not_an_arrow() {
        let program = parse("y = (x + 1) * 2");
        let expr = first_expr(&program);
        let ExprKind::Assign { value, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            value.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn parses_object_literal_in_expression_position() {
        let program = parse("o = {name: \"Alice\", age: 30}");
        let expr = first_expr(&program);
        let ExprKind::Assign { value, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        let ExprKind::Object(entries) = &value.kind else {
            panic!("expected object literal");
        };
        assert_eq!(entries[0].0, "name");
        assert_eq!(entries[1].0, "age");
    }

    #[test]
    fn brace_at_statement_position_is_a_block() {
        let program = parse("{\nx = 1\n}\n");
        assert!(matches!(program.statements[0].kind, StmtKind::Block(_)));
    }

    #[test]
    fn parses_if_elif_else_chain() {
        let program = parse(indoc! {"
            if a { x = 1 }
            elif b { x = 2 }
            else { x = 3 }
        "});
        assert_eq!(program.statements.len(), 1);
        let StmtKind::If { else_body, .. } = &program.statements[0].kind else {
            panic!("expected if statement");
        };
        let nested = else_body.as_ref().expect("expected elif branch");
        let StmtKind::If { else_body, .. } = &nested[0].kind else {
            panic!("expected nested if for elif");
        };
        assert!(else_body.is_some());
    }

    #[test]
    fn parses_class_with_base_and_methods() {
        let program = parse(indoc! {"
            class Dog extends Animal {
                function constructor(name) { this.name = name }
                function speak() { return \"woof\" }
            }
        "});
        let StmtKind::ClassDef {
            name,
            base,
            methods,
        } = &program.statements[0].kind
        else {
            panic!("expected class definition");
        };
        assert_eq!(name, "Dog");
        assert_eq!(base.as_deref(), Some("Animal"));
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].name, "constructor");
    }

    #[test]
    fn parses_try_catch_finally() {
        let program = parse(indoc! {"
            try { risky() }
            catch err { print(err) }
            finally { cleanup() }
        "});
        let StmtKind::Try {
            catch, finally, ..
        } = &program.statements[0].kind
        else {
            panic!("expected try statement");
        };
        assert_eq!(catch.as_ref().unwrap().0.as_deref(), Some("err"));
        assert!(finally.is_some());
    }

    #[test]
    fn try_requires_catch_or_finally() {
        let err = parse_source("try { x = 1 }\n").expect_err("expected parse failure");
        assert!(err.to_string().contains("'catch' or 'finally'"));
    }

    #[test]
    fn parses_match_with_default() {
        let program = parse(indoc! {"
            match x {
                case 1 { print(\"one\") }
                case 2 { print(\"two\") }
                default { print(\"other\") }
            }
        "});
        let StmtKind::Match { arms, default, .. } = &program.statements[0].kind else {
            panic!("expected match statement");
        };
        assert_eq!(arms.len(), 2);
        assert!(default.is_some());
    }

    #[test]
    fn parses_for_in_loop() {
        let program = parse("for i in range(3) { print(i) }\n");
        let StmtKind::For { variable, .. } = &program.statements[0].kind else {
            panic!("expected for statement");
        };
        assert_eq!(variable, "i");
    }

    #[test]
    fn parses_new_and_super() {
        let program = parse("d = new Dog(\"rex\")\n");
        let expr = first_expr(&program);
        let ExprKind::Assign { value, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(value.kind, ExprKind::New { .. }));

        let program = parse(indoc! {"
            class Dog extends Animal {
                function speak() { return super.speak() + \"!\" }
            }
        "});
        assert!(matches!(
            program.statements[0].kind,
            StmtKind::ClassDef { .. }
        ));
    }

    #[test]
    fn parses_web_app_routes_and_scene() {
        let program = parse(indoc! {"
            web.app {
                route \"/\" { print(\"home\") }
                route \"/about\" { print(\"about\") }
            }
            scene Main {
                cube size: 2 color: \"red\"
                light intensity: 0.5
            }
        "});
        let StmtKind::WebApp { routes } = &program.statements[0].kind else {
            panic!("expected web app declaration");
        };
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].path, "/");
        let StmtKind::Scene { name, elements } = &program.statements[1].kind else {
            panic!("expected scene declaration");
        };
        assert_eq!(name, "Main");
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].properties.len(), 2);
    }

    #[test]
    fn web_identifier_alone_is_an_expression() {
        let program = parse("web = 1\n");
        assert!(matches!(program.statements[0].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn parses_imports() {
        let program = parse("import math\nfrom physics import gravity, friction\n");
        let StmtKind::Import { module, names } = &program.statements[0].kind else {
            panic!("expected import");
        };
        assert_eq!(module, "math");
        assert!(names.is_empty());
        let StmtKind::Import { module, names } = &program.statements[1].kind else {
            panic!("expected from-import");
        };
        assert_eq!(module, "physics");
        assert_eq!(names, &vec!["gravity".to_string(), "friction".to_string()]);
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        let err = parse_source("1 + 2 = 3\n").expect_err("expected parse failure");
        assert!(err.to_string().contains("Invalid assignment target"));
    }

    #[test]
    fn reports_expected_and_found_tokens() {
        let err = parse_source("function (x) { }\n").expect_err("expected parse failure");
        let message = err.to_string();
        assert!(message.contains("Expected identifier"), "got: {message}");
        assert!(message.contains("'('"), "got: {message}");
    }

    #[test]
    fn compound_assignment_targets_members_and_indexes() {
        let program = parse("o.count += 1\na[0] -= 2\n");
        for statement in &program.statements {
            let StmtKind::Expr(expr) = &statement.kind else {
                panic!("expected expression statement");
            };
            assert!(matches!(expr.kind, ExprKind::Assign { op: Some(_), .. }));
        }
    }

    #[test]
    fn print_parse_print_is_stable() {
        let source = indoc! {"
            x = 10
            function f(a, b) {
                return (a * b) + 1
            }
            if x > 5 {
                print(f(x, 2))
            } else {
                print([1, 2, {k: \"v\"}])
            }
        "};
        let first = crate::ast::to_source(&parse(source));
        let second = crate::ast::to_source(&parse(&first));
        assert_eq!(first, second);
    }
}
