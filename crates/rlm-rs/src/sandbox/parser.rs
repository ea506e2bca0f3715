//! Recursive-descent parser for the snippet language.
//!
//! Precedence, loosest first: assignment, `?:`, `|| ??`, `&&`, equality,
//! relational, additive, multiplicative, `**`, unary, postfix, call/member.

use super::ast::*;
use super::lexer::{TemplatePiece, Tok, Token, tokenize};
use std::sync::Arc;

/// Parse a whole snippet.
pub fn parse_program(src: &str) -> Result<Vec<Stmt>, String> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut stmts = Vec::new();
    while !parser.at_eof() {
        stmts.push(parser.statement()?);
    }
    Ok(stmts)
}

/// Parse `src` as exactly one expression.
pub fn parse_expression(src: &str) -> Result<Expr, String> {
    let mut parser = Parser::new(tokenize(src)?);
    let expr = parser.expression()?;
    parser.eat_punct(";");
    if !parser.at_eof() {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

const ASSIGN_OPS: &[(&str, Option<BinaryOp>)] = &[
    ("=", None),
    ("+=", Some(BinaryOp::Add)),
    ("-=", Some(BinaryOp::Sub)),
    ("*=", Some(BinaryOp::Mul)),
    ("/=", Some(BinaryOp::Div)),
    ("%=", Some(BinaryOp::Rem)),
    ("**=", Some(BinaryOp::Pow)),
];

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    // ── Token helpers ──────────────────────────────────────────────

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map_or(&Tok::Eof, |t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |t| t.line)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Tok::Punct(q) if *q == p)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(name) if name == kw)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), String> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(format!(
                "line {}: expected '{p}' but found {}",
                self.line(),
                self.peek()
            ))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.pos += 1;
                Ok(name)
            }
            other => Err(format!(
                "line {}: expected identifier but found {other}",
                self.line()
            )),
        }
    }

    fn unexpected(&self) -> String {
        format!("line {}: unexpected {}", self.line(), self.peek())
    }

    // ── Statements ─────────────────────────────────────────────────

    fn statement(&mut self) -> Result<Stmt, String> {
        let stmt = self.statement_inner()?;
        self.eat_punct(";");
        Ok(stmt)
    }

    fn statement_inner(&mut self) -> Result<Stmt, String> {
        if self.is_punct("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        let Tok::Ident(word) = self.peek().clone() else {
            return Ok(Stmt::Expr(self.expression()?));
        };
        match word.as_str() {
            "let" | "const" | "var" => self.declaration(),
            "if" => {
                self.pos += 1;
                self.expect_punct("(")?;
                let cond = self.expression()?;
                self.expect_punct(")")?;
                let then = self.body()?;
                self.eat_punct(";");
                let otherwise = if self.eat_keyword("else") {
                    Some(self.body()?)
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            "while" => {
                self.pos += 1;
                self.expect_punct("(")?;
                let cond = self.expression()?;
                self.expect_punct(")")?;
                Ok(Stmt::While {
                    cond,
                    body: self.body()?,
                })
            }
            "for" => self.for_statement(),
            "function" => {
                self.pos += 1;
                Ok(Stmt::Function(self.function_rest(true)?))
            }
            "async" if matches!(self.peek_at(1), Tok::Ident(n) if n == "function") => {
                self.pos += 2;
                Ok(Stmt::Function(self.function_rest(true)?))
            }
            "return" => {
                self.pos += 1;
                if self.is_punct(";") || self.is_punct("}") || self.at_eof() {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.expression()?)))
                }
            }
            "break" => {
                self.pos += 1;
                Ok(Stmt::Break)
            }
            "continue" => {
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            "throw" => {
                self.pos += 1;
                Ok(Stmt::Throw(self.expression()?))
            }
            "try" => self.try_statement(),
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    fn declaration(&mut self) -> Result<Stmt, String> {
        self.pos += 1; // let / const / var
        let mut decls = Vec::new();
        loop {
            let pattern = self.pattern()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push((pattern, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Stmt::Declare(decls))
    }

    fn pattern(&mut self) -> Result<Pattern, String> {
        if self.eat_punct("[") {
            let names = self.name_list("]")?;
            return Ok(Pattern::Array(names));
        }
        if self.eat_punct("{") {
            let names = self.name_list("}")?;
            return Ok(Pattern::Object(names));
        }
        Ok(Pattern::Name(self.ident()?))
    }

    fn name_list(&mut self, close: &str) -> Result<Vec<String>, String> {
        let mut names = Vec::new();
        while !self.eat_punct(close) {
            names.push(self.ident()?);
            if !self.eat_punct(",") {
                self.expect_punct(close)?;
                break;
            }
        }
        Ok(names)
    }

    fn for_statement(&mut self) -> Result<Stmt, String> {
        self.pos += 1; // for
        self.expect_punct("(")?;

        // for (const x of xs) / for (x in obj)
        let decl_offset = usize::from(matches!(
            self.peek(),
            Tok::Ident(k) if k == "let" || k == "const" || k == "var"
        ));
        let save = self.pos;
        self.pos += decl_offset;
        if let Ok(pattern) = self.pattern() {
            let keys = self.is_keyword("in");
            if keys || self.is_keyword("of") {
                self.pos += 1;
                let iterable = self.expression()?;
                self.expect_punct(")")?;
                return Ok(Stmt::ForOf {
                    pattern,
                    iterable,
                    body: self.body()?,
                    keys,
                });
            }
        }
        self.pos = save;

        let init = if self.is_punct(";") {
            None
        } else {
            Some(Box::new(self.statement_inner()?))
        };
        self.expect_punct(";")?;
        let cond = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let step = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body: self.body()?,
        })
    }

    fn try_statement(&mut self) -> Result<Stmt, String> {
        self.pos += 1; // try
        let body = self.block()?;
        let mut catch_name = None;
        let mut handler = Vec::new();
        if self.eat_keyword("catch") {
            if self.eat_punct("(") {
                catch_name = Some(self.ident()?);
                self.expect_punct(")")?;
            }
            handler = self.block()?;
        }
        let finally = if self.eat_keyword("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::Try {
            body,
            catch_name,
            handler,
            finally,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, String> {
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(format!("line {}: missing '}}'", self.line()));
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    /// A braced block or a single statement.
    fn body(&mut self) -> Result<Vec<Stmt>, String> {
        if self.is_punct("{") {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    /// Parameters and body after the `function` keyword.
    fn function_rest(&mut self, require_name: bool) -> Result<Arc<FunctionDef>, String> {
        let name = match self.peek() {
            Tok::Ident(_) => Some(self.ident()?),
            _ if require_name => return Err(self.unexpected()),
            _ => None,
        };
        self.expect_punct("(")?;
        let params = self.name_list(")")?;
        let body = FunctionBody::Block(self.block()?);
        Ok(Arc::new(FunctionDef { name, params, body }))
    }

    // ── Expressions ────────────────────────────────────────────────

    fn expression(&mut self) -> Result<Expr, String> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, String> {
        if self.is_keyword("async")
            && matches!(self.peek_at(1), Tok::Ident(_) | Tok::Punct("("))
        {
            self.pos += 1;
        }
        if let Some(arrow) = self.arrow_function()? {
            return Ok(arrow);
        }

        let target = self.conditional()?;
        let op = ASSIGN_OPS
            .iter()
            .find(|(p, _)| self.is_punct(p))
            .map(|(_, op)| *op);
        let Some(op) = op else {
            return Ok(target);
        };
        if !matches!(
            target,
            Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
        ) {
            return Err(format!("line {}: invalid assignment target", self.line()));
        }
        self.pos += 1;
        let value = self.assignment()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        })
    }

    /// `x => ...` or `(a, b) => ...`; `None` when the tokens ahead are not
    /// an arrow function.
    fn arrow_function(&mut self) -> Result<Option<Expr>, String> {
        let arrow_next = matches!(self.peek_at(1), Tok::Punct("=>"));
        let params = match (self.peek().clone(), arrow_next) {
            (Tok::Ident(name), true) => {
                self.pos += 2;
                vec![name]
            }
            (Tok::Punct("("), _) => {
                let Some(close) = self.matching_paren(self.pos) else {
                    return Ok(None);
                };
                if !matches!(self.tokens.get(close + 1).map(|t| &t.tok), Some(Tok::Punct("=>")))
                {
                    return Ok(None);
                }
                self.pos += 1;
                let params = self.name_list(")")?;
                self.expect_punct("=>")?;
                params
            }
            _ => return Ok(None),
        };
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expr(self.assignment()?)
        };
        Ok(Some(Expr::Function(Arc::new(FunctionDef {
            name: None,
            params,
            body,
        }))))
    }

    fn matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, token) in self.tokens.iter().enumerate().skip(open) {
            match token.tok {
                Tok::Punct("(") => depth += 1,
                Tok::Punct(")") => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                Tok::Eof => return None,
                _ => {}
            }
        }
        None
    }

    fn conditional(&mut self) -> Result<Expr, String> {
        let cond = self.logical_or()?;
        if !self.eat_punct("?") {
            return Ok(cond);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.assignment()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        let mut left = next(self)?;
        loop {
            let Some((_, op)) = ops.iter().find(|(p, _)| self.is_punct(p)) else {
                return Ok(left);
            };
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary(*op, Box::new(left), Box::new(right));
        }
    }

    fn logical_or(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[("||", BinaryOp::Or), ("??", BinaryOp::Nullish)],
            Self::logical_and,
        )
    }

    fn logical_and(&mut self) -> Result<Expr, String> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNotEq),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::NotEq),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                ("<=", BinaryOp::LtEq),
                (">=", BinaryOp::GtEq),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::exponent,
        )
    }

    fn exponent(&mut self) -> Result<Expr, String> {
        let base = self.unary()?;
        if self.eat_punct("**") {
            let power = self.exponent()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(power)));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek() {
            Tok::Punct("!") => Some(UnaryOp::Not),
            Tok::Punct("-") => Some(UnaryOp::Neg),
            Tok::Punct("+") => Some(UnaryOp::Plus),
            Tok::Ident(k) if k == "typeof" => Some(UnaryOp::TypeOf),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            return Ok(Expr::Unary(op, Box::new(self.unary()?)));
        }
        if self.eat_keyword("await") {
            return Ok(Expr::Await(Box::new(self.unary()?)));
        }
        // `new X(...)` is treated as a plain call.
        if self.is_keyword("new") && matches!(self.peek_at(1), Tok::Ident(_)) {
            self.pos += 1;
        }
        for (p, delta) in [("++", 1.0), ("--", -1.0)] {
            if self.eat_punct(p) {
                let target = self.unary()?;
                return Ok(Expr::Update {
                    target: Box::new(target),
                    delta,
                    prefix: true,
                });
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let expr = self.call_member()?;
        for (p, delta) in [("++", 1.0), ("--", -1.0)] {
            if self.eat_punct(p) {
                return Ok(Expr::Update {
                    target: Box::new(expr),
                    delta,
                    prefix: false,
                });
            }
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") || self.is_punct("?.") {
                let optional = self.eat_punct("?.");
                if optional && self.is_punct("(") {
                    // `f?.()` behaves like `f()`.
                    continue;
                }
                if optional && self.eat_punct("[") {
                    let index = self.expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                    continue;
                }
                let name = self.ident()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                    optional,
                };
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_punct("(") {
                let args = self.list(")")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions (with spreads) up to `close`.
    fn list(&mut self, close: &str) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        while !self.eat_punct(close) {
            if self.eat_punct("...") {
                items.push(Expr::Spread(Box::new(self.assignment()?)));
            } else {
                items.push(self.assignment()?);
            }
            if !self.eat_punct(",") {
                self.expect_punct(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let line = self.line();
        match self.advance() {
            Tok::Number(n) => Ok(Expr::Number(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Regex { pattern, flags } => Ok(Expr::Regex { pattern, flags }),
            Tok::Template(pieces) => {
                let mut parts = Vec::with_capacity(pieces.len());
                for piece in pieces {
                    parts.push(match piece {
                        TemplatePiece::Text(t) => TemplatePart::Text(t),
                        TemplatePiece::Expr(src) => TemplatePart::Expr(
                            parse_expression(&src).map_err(|e| format!("line {line}: {e}"))?,
                        ),
                    });
                }
                Ok(Expr::Template(parts))
            }
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" | "undefined" => Ok(Expr::Null),
                "function" => Ok(Expr::Function(self.function_rest(false)?)),
                _ => Ok(Expr::Ident(name)),
            },
            Tok::Punct("(") => {
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Tok::Punct("[") => Ok(Expr::Array(self.list("]")?)),
            Tok::Punct("{") => self.object_literal(),
            other => Err(format!("line {line}: unexpected {other}")),
        }
    }

    fn object_literal(&mut self) -> Result<Expr, String> {
        let mut props = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                props.push(ObjectProp::Spread(self.assignment()?));
            } else {
                let line = self.line();
                let key = match self.advance() {
                    Tok::Ident(name) => name,
                    Tok::Str(s) => s,
                    Tok::Number(n) => super::value::format_number(n),
                    other => return Err(format!("line {line}: bad object key {other}")),
                };
                let value = if self.eat_punct(":") {
                    self.assignment()?
                } else {
                    Expr::Ident(key.clone())
                };
                props.push(ObjectProp::Pair(key, value));
            }
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(props))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        let expr = parse_expression("1 + 2 * 3 ** 2").unwrap();
        let Expr::Binary(BinaryOp::Add, _, rhs) = expr else {
            panic!("expected addition at the root");
        };
        assert!(matches!(*rhs, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn arrow_functions() {
        let expr = parse_expression("xs.map((a, b) => a + b)").unwrap();
        let Expr::Call { args, .. } = expr else {
            panic!("expected call");
        };
        let Expr::Function(def) = &args[0] else {
            panic!("expected arrow");
        };
        assert_eq!(def.params, vec!["a".to_string(), "b".to_string()]);

        assert!(matches!(
            parse_expression("x => { return x }").unwrap(),
            Expr::Function(_)
        ));
        // Parenthesised expressions are not mistaken for arrows.
        assert!(matches!(
            parse_expression("(a + b) * 2").unwrap(),
            Expr::Binary(BinaryOp::Mul, _, _)
        ));
    }

    #[test]
    fn object_literal_forms() {
        let expr = parse_expression("{answer: 'x', \"confidence\": 0.5, reasoning,}").unwrap();
        let Expr::Object(props) = expr else {
            panic!("expected object");
        };
        assert_eq!(props.len(), 3);
        assert_eq!(
            props[2],
            ObjectProp::Pair("reasoning".into(), Expr::Ident("reasoning".into()))
        );
    }

    #[test]
    fn statements_without_semicolons() {
        let program = parse_program(
            "let total = 0\nfor (const x of [1, 2, 3]) { total += x }\nif (total > 5) print(total) else print('small')",
        )
        .unwrap();
        assert_eq!(program.len(), 3);
        assert!(matches!(program[1], Stmt::ForOf { keys: false, .. }));
    }

    #[test]
    fn c_style_for_and_destructuring() {
        let program =
            parse_program("for (let i = 0; i < 3; i++) { }\nconst [a, b] = pair; const {x} = o;")
                .unwrap();
        assert!(matches!(program[0], Stmt::For { .. }));
        assert!(matches!(
            &program[1],
            Stmt::Declare(d) if d[0].0 == Pattern::Array(vec!["a".into(), "b".into()])
        ));
    }

    #[test]
    fn try_catch_and_functions() {
        let program =
            parse_program("function f(a) { return a * 2 }\ntry { f(1) } catch (e) { print(e) }")
                .unwrap();
        assert!(matches!(&program[0], Stmt::Function(def) if def.name.as_deref() == Some("f")));
        assert!(matches!(
            &program[1],
            Stmt::Try { catch_name: Some(n), .. } if n == "e"
        ));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = parse_program("let x = 1\nlet = 2").unwrap_err();
        assert!(err.starts_with("line 2"), "{err}");
    }

    #[test]
    fn regex_literals_versus_division() {
        let expr = parse_expression("text.match(/a\\/b+/gi)").unwrap();
        let Expr::Call { args, .. } = expr else {
            panic!("expected call");
        };
        assert_eq!(
            args[0],
            Expr::Regex {
                pattern: "a\\/b+".into(),
                flags: "gi".into()
            }
        );
        assert!(matches!(
            parse_expression("total / count / 2").unwrap(),
            Expr::Binary(BinaryOp::Div, _, _)
        ));
    }

    #[test]
    fn await_and_spread() {
        let expr = parse_expression("await Promise.all([...parts, llm_query('q')])").unwrap();
        assert!(matches!(expr, Expr::Await(_)));
    }
}
