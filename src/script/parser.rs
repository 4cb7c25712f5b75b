//! Recursive-descent parser for warden script.
//!
//! The same expression grammar serves two callers: whole programs
//! (generated code) and single predicate expressions (capability
//! `scope_restriction` constraints). Only predicates may use `$name`
//! context references.

use serde_json::{json, Value};

use super::ast::{BinOp, CallTarget, Expr, Program, Stmt, UnaryOp};
use super::lexer::{tokenize, Spanned, Tok};
use crate::error::WardenError;

/// Functions implemented by the interpreter itself. Calling any other
/// bare name is a tool call.
pub const BUILTINS: &[&str] = &["len", "str", "int", "keys", "range", "push", "has"];

/// Nesting limit; deeper input is rejected rather than risking the stack.
const MAX_DEPTH: usize = 64;

pub fn parse_program(src: &str) -> Result<Program, WardenError> {
    let mut parser = Parser::new(tokenize(src)?, false);
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

pub fn parse_predicate(src: &str) -> Result<Expr, WardenError> {
    let mut parser = Parser::new(tokenize(src)?, true);
    let expr = parser.expression()?;
    if !parser.at(&Tok::Eof) {
        return Err(parser.unexpected("end of predicate"));
    }
    Ok(expr)
}

struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
    allow_context: bool,
    depth: usize,
}

impl Parser {
    fn new(toks: Vec<Spanned>, allow_context: bool) -> Self {
        Self {
            toks,
            pos: 0,
            allow_context,
            depth: 0,
        }
    }

    // ── Token helpers ─────────────────────────────────

    fn peek(&self) -> &Tok {
        &self.toks[self.pos.min(self.toks.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.toks[(self.pos + offset).min(self.toks.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.toks[self.pos.min(self.toks.len() - 1)].line
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), WardenError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, WardenError> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn unexpected(&self, expected: &str) -> WardenError {
        WardenError::script(
            self.line(),
            format!("expected {expected}, found {}", self.peek().describe()),
        )
    }

    fn enter(&mut self) -> Result<(), WardenError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(WardenError::script(self.line(), "nesting too deep"));
        }
        Ok(())
    }

    /// Semicolons may be omitted before `}` and at end of input.
    fn end_statement(&mut self) -> Result<(), WardenError> {
        if self.eat(&Tok::Semi) || self.at(&Tok::RBrace) || self.at(&Tok::Eof) {
            Ok(())
        } else {
            Err(self.unexpected("';'"))
        }
    }

    // ── Statements ────────────────────────────────────

    fn statement(&mut self) -> Result<Stmt, WardenError> {
        self.enter()?;
        let stmt = self.statement_inner();
        self.depth -= 1;
        stmt
    }

    fn statement_inner(&mut self) -> Result<Stmt, WardenError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Let => {
                self.advance();
                let name = self.ident("a variable name after 'let'")?;
                self.expect(&Tok::Assign, "'=' after variable name")?;
                let value = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Let { name, value, line })
            }
            Tok::Ident(name) if self.peek_at(1) == &Tok::Assign => {
                self.advance();
                self.advance();
                let value = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Assign { name, value, line })
            }
            Tok::If => self.if_statement(),
            Tok::While => {
                self.advance();
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While { cond, body, line })
            }
            Tok::Loop => {
                self.advance();
                let body = self.block()?;
                Ok(Stmt::Loop { body, line })
            }
            Tok::For => {
                self.advance();
                let var = self.ident("a loop variable after 'for'")?;
                self.expect(&Tok::In, "'in' after loop variable")?;
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    var,
                    iter,
                    body,
                    line,
                })
            }
            Tok::Break => {
                self.advance();
                self.end_statement()?;
                Ok(Stmt::Break { line })
            }
            Tok::Continue => {
                self.advance();
                self.end_statement()?;
                Ok(Stmt::Continue { line })
            }
            Tok::Return => {
                self.advance();
                let value = if self.at(&Tok::Semi) || self.at(&Tok::RBrace) || self.at(&Tok::Eof)
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_statement()?;
                Ok(Stmt::Return { value, line })
            }
            _ => {
                let expr = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Expr { expr, line })
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, WardenError> {
        let line = self.line();
        self.expect(&Tok::If, "'if'")?;
        let cond = self.expression()?;
        let then_body = self.block()?;
        let else_body = if self.eat(&Tok::Else) {
            if self.at(&Tok::If) {
                Some(vec![self.if_statement()?])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
            line,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, WardenError> {
        self.expect(&Tok::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.at(&Tok::RBrace) {
            if self.at(&Tok::Eof) {
                return Err(self.unexpected("'}'"));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    // ── Expressions ───────────────────────────────────

    fn expression(&mut self) -> Result<Expr, WardenError> {
        self.enter()?;
        let expr = self.or();
        self.depth -= 1;
        expr
    }

    fn binary_level(
        &mut self,
        ops: &[(Tok, BinOp)],
        next: fn(&mut Self) -> Result<Expr, WardenError>,
    ) -> Result<Expr, WardenError> {
        let mut lhs = next(self)?;
        let outer = self.depth;
        loop {
            let line = self.line();
            let Some(op) = ops
                .iter()
                .find(|(tok, _)| self.at(tok))
                .map(|(_, op)| *op)
            else {
                self.depth = outer;
                return Ok(lhs);
            };
            self.advance();
            // Each operator nests the left operand one level deeper.
            self.enter()?;
            let rhs = next(self)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
    }

    fn or(&mut self) -> Result<Expr, WardenError> {
        self.binary_level(&[(Tok::Or, BinOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, WardenError> {
        self.binary_level(&[(Tok::And, BinOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, WardenError> {
        self.binary_level(
            &[(Tok::Eq, BinOp::Eq), (Tok::Ne, BinOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, WardenError> {
        self.binary_level(
            &[
                (Tok::Lt, BinOp::Lt),
                (Tok::Le, BinOp::Le),
                (Tok::Gt, BinOp::Gt),
                (Tok::Ge, BinOp::Ge),
                (Tok::In, BinOp::In),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, WardenError> {
        self.binary_level(
            &[(Tok::Plus, BinOp::Add), (Tok::Minus, BinOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, WardenError> {
        self.binary_level(
            &[
                (Tok::Star, BinOp::Mul),
                (Tok::Slash, BinOp::Div),
                (Tok::Percent, BinOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, WardenError> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Not => UnaryOp::Not,
            Tok::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
            line,
        })
    }

    fn postfix(&mut self) -> Result<Expr, WardenError> {
        let mut expr = self.primary()?;
        let outer = self.depth;
        loop {
            let line = self.line();
            if matches!(self.peek(), Tok::Dot | Tok::LBracket | Tok::LParen) {
                self.enter()?;
            }
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let field = self.ident("a field name after '.'")?;
                    expr = Expr::Field {
                        target: Box::new(expr),
                        field,
                        line,
                    };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                Tok::LParen => {
                    let callee = dotted_path(&expr).ok_or_else(|| {
                        WardenError::script(line, "only named tools and builtins can be called")
                    })?;
                    self.advance();
                    let args = self.comma_list(&Tok::RParen)?;
                    expr = self.call(callee, args, line)?;
                }
                _ => {
                    self.depth = outer;
                    return Ok(expr);
                }
            }
        }
    }

    fn call(&self, callee: String, mut args: Vec<Expr>, line: usize) -> Result<Expr, WardenError> {
        if callee == "call" {
            if args.is_empty() || args.len() > 2 {
                return Err(WardenError::script(
                    line,
                    "call() takes a tool name and an optional argument object",
                ));
            }
            let call_args = if args.len() == 2 { args.pop() } else { None };
            let name = args.remove(0);
            let target = match name {
                Expr::Literal(Value::String(s)) => CallTarget::Static(s),
                other => CallTarget::Dynamic(Box::new(other)),
            };
            return Ok(Expr::ToolCall {
                target,
                args: call_args.map(Box::new),
                line,
            });
        }

        if BUILTINS.contains(&callee.as_str()) {
            return Ok(Expr::Builtin {
                name: callee,
                args,
                line,
            });
        }

        if args.len() > 1 {
            return Err(WardenError::script(
                line,
                format!("tool '{callee}' takes a single argument object"),
            ));
        }
        Ok(Expr::ToolCall {
            target: CallTarget::Static(callee),
            args: args.pop().map(Box::new),
            line,
        })
    }

    fn comma_list(&mut self, close: &Tok) -> Result<Vec<Expr>, WardenError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.expression()?);
            if !self.eat(&Tok::Comma) {
                if self.eat(close) {
                    break;
                }
                return Err(self.unexpected("',' or closing bracket"));
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, WardenError> {
        let line = self.line();
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Literal(json!(n))),
            Tok::Float(f) => Ok(Expr::Literal(json!(f))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::Ident(name) => Ok(Expr::Var { name, line }),
            Tok::Context(name) => {
                if self.allow_context {
                    Ok(Expr::Context { name, line })
                } else {
                    Err(WardenError::script(
                        line,
                        format!("'${name}' is not available in generated code"),
                    ))
                }
            }
            Tok::LParen => {
                let expr = self.expression()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(expr)
            }
            Tok::LBracket => Ok(Expr::Array(self.comma_list(&Tok::RBracket)?)),
            Tok::LBrace => self.object_literal(),
            Tok::Parallel => {
                self.expect(&Tok::LBracket, "'[' after 'parallel'")?;
                let items = self.comma_list(&Tok::RBracket)?;
                Ok(Expr::Parallel { items, line })
            }
            other => {
                Err(WardenError::script(
                    line,
                    format!("expected an expression, found {}", other.describe()),
                ))
            }
        }
    }

    fn object_literal(&mut self) -> Result<Expr, WardenError> {
        let mut fields: Vec<(String, Expr)> = Vec::new();
        while !self.eat(&Tok::RBrace) {
            let key = match self.advance() {
                Tok::Ident(k) | Tok::Str(k) => k,
                other => {
                    return Err(WardenError::script(
                        self.line(),
                        format!("expected an object key, found {}", other.describe()),
                    ))
                }
            };
            self.expect(&Tok::Colon, "':' after object key")?;
            let value = self.expression()?;
            // Later duplicates win, as in JSON.
            fields.retain(|(k, _)| k != &key);
            fields.push((key, value));
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RBrace, "',' or '}'")?;
                break;
            }
        }
        Ok(Expr::Object(fields))
    }
}

/// `a` → `"a"`, `a.b.c` → `"a.b.c"`; anything else is not callable.
fn dotted_path(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Var { name, .. } => Some(name.clone()),
        Expr::Field { target, field, .. } => {
            let mut path = dotted_path(target)?;
            path.push('.');
            path.push_str(field);
            Some(path)
        }
        _ => None,
    }
}
