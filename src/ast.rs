//! Syntax tree consumed by the code generator
//!
//! Producing the tree is up to the caller; nothing in this crate parses
//! source text into it.

use std::collections::BTreeMap;

/// A whole program: function definitions keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub functions: BTreeMap<String, Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function definition, replacing one with the same name.
    pub fn with_function(mut self, name: impl Into<String>, function: Function) -> Self {
        self.functions.insert(name.into(), function);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub params: Vec<String>,
    pub body: FunctionBody,
}

impl Function {
    pub fn new<S: Into<String>>(params: impl IntoIterator<Item = S>, body: FunctionBody) -> Self {
        Function {
            params: params.into_iter().map(Into::into).collect(),
            body,
        }
    }
}

/// A function body is either a statement or a bare expression whose value
/// is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Stmt),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { target: LValue, value: Expr },
    /// A call whose result is discarded
    Call { callee: Expr, args: Vec<Expr> },
    While { cond: Expr, body: Box<Stmt> },
    /// `if` / `elif` chain with an optional `else`
    If {
        branches: Vec<(Expr, Stmt)>,
        otherwise: Option<Box<Stmt>>,
    },
    Block(Vec<Stmt>),
    Return(Expr),
}

/// Assignment target
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Var(String),
    Index(Box<LValue>, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i32),
    Float(f32),
    Str(String),
    Var(String),
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    List(Vec<Expr>),
    Index { target: Box<Expr>, index: Box<Expr> },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn str(text: impl Into<String>) -> Self {
        Expr::Str(text.into())
    }

    /// Call of the function or operator named `name`
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            callee: Box::new(Expr::var(name)),
            args,
        }
    }

    pub fn index(target: Expr, index: Expr) -> Self {
        Expr::Index {
            target: Box::new(target),
            index: Box::new(index),
        }
    }

    pub fn ternary(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }
}

impl LValue {
    pub fn var(name: impl Into<String>) -> Self {
        LValue::Var(name.into())
    }

    pub fn index(self, index: Expr) -> Self {
        LValue::Index(Box::new(self), index)
    }
}

impl Stmt {
    pub fn assign(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            target: LValue::var(name),
            value,
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Stmt::Call {
            callee: Expr::var(name),
            args,
        }
    }

    pub fn while_loop(cond: Expr, body: Stmt) -> Self {
        Stmt::While {
            cond,
            body: Box::new(body),
        }
    }
}
