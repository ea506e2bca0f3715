//! Syntax tree for the snippet language.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let` / `const` / `var`, possibly several comma-separated bindings.
    Declare(Vec<(Pattern, Option<Expr>)>),
    Expr(Expr),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    /// `for (x of xs)`, or `for (k in obj)` when `keys` is set.
    ForOf {
        pattern: Pattern,
        iterable: Expr,
        body: Vec<Stmt>,
        keys: bool,
    },
    Try {
        body: Vec<Stmt>,
        catch_name: Option<String>,
        handler: Vec<Stmt>,
        finally: Vec<Stmt>,
    },
    Throw(Expr),
    Block(Vec<Stmt>),
    Function(Arc<FunctionDef>),
    Return(Option<Expr>),
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Name(String),
    Array(Vec<String>),
    Object(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Regex {
        pattern: String,
        flags: String,
    },
    Template(Vec<TemplatePart>),
    Bool(bool),
    Null,
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<ObjectProp>),
    /// `...e`, only valid inside call arguments and array literals.
    Spread(Box<Expr>),
    Member {
        object: Box<Expr>,
        name: String,
        optional: bool,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    Update {
        target: Box<Expr>,
        delta: f64,
        prefix: bool,
    },
    Function(Arc<FunctionDef>),
    /// `await e` evaluates `e` and resolves any deferred recursive calls in it.
    Await(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectProp {
    Pair(String, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: FunctionBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Expr(Expr),
    Block(Vec<Stmt>),
}
