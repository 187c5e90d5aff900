//! Lowering of the syntax tree into assembly text
//!
//! Every function becomes a `.func` block entered through a `fn_<name>`
//! label. Int, float and string literals are pooled into a constants
//! section after the last function, one entry per distinct value.
//!
//! Arguments are evaluated right to left, so the first argument ends up on
//! top of the operand stack. That is where binary opcodes expect their left
//! operand, and it lets a function prologue pop its parameters in
//! declaration order.

use std::collections::HashMap;
use std::fmt::Display;

use crate::{
    ast::{Expr, Function, FunctionBody, LValue, Module, Stmt},
    bytecode::{escape, ENTRY_POINT},
    config::VmConfig,
    encoding::Opcode,
    error::GenError,
};

/// Assembly generator for one [`Module`]
pub struct Codegen<'m> {
    module: &'m Module,
    local_slots: usize,
    out: String,
    constants: ConstantPool,
    labels: usize,
}

impl<'m> Codegen<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self::with_config(module, &VmConfig::default())
    }

    /// Generator whose functions must fit in `config.local_slots` slots
    pub fn with_config(module: &'m Module, config: &VmConfig) -> Self {
        Codegen {
            module,
            local_slots: config.local_slots,
            out: String::new(),
            constants: ConstantPool::default(),
            labels: 0,
        }
    }

    /// Emit the whole module. Functions come out in name order.
    pub fn generate(mut self) -> Result<String, GenError> {
        for (name, function) in &self.module.functions {
            self.function(name, function)?;
        }

        if !self.constants.entries.is_empty() {
            self.out.push_str("\n; constants\n");
            for (i, constant) in self.constants.entries.iter().enumerate() {
                let line = match constant {
                    Constant::Int(value) => format!("const{i}: {value}\n"),
                    Constant::Float(bits) => {
                        let value = f32::from_bits(*bits);
                        if value.is_finite() {
                            format!("const{i}: {value:?}\n")
                        } else {
                            // No literal syntax for these, store the pattern
                            format!("const{i}: {}\n", *bits as i32)
                        }
                    }
                    Constant::Str(text) => format!("const{i}: \"{}\"\n", escape(text)),
                };
                self.out.push_str(&line);
            }
        }

        Ok(self.out)
    }

    fn function(&mut self, name: &str, function: &Function) -> Result<(), GenError> {
        let is_entry = name == ENTRY_POINT;
        if is_entry && !function.params.is_empty() {
            return Err(GenError::EntryTakesParameters {
                function: name.to_string(),
            });
        }

        self.out.push_str(&format!(
            ".func {name} {}\nfn_{name}:\n",
            function.params.len()
        ));

        let mut frame = Frame::new(name, self.local_slots);
        for param in &function.params {
            let slot = frame.bind(param)?;
            self.op_with(Opcode::StoreVar, slot);
        }

        match &function.body {
            FunctionBody::Expr(expr) => {
                self.expr(&mut frame, expr)?;
                self.op(Opcode::Return);
            }
            FunctionBody::Block(body) => {
                self.stmt(&mut frame, body)?;
                if is_entry {
                    self.op(Opcode::End);
                } else {
                    self.op_with(Opcode::LoadInt, 0);
                    self.op(Opcode::Return);
                }
            }
        }

        self.out.push('\n');
        Ok(())
    }

    fn stmt(&mut self, frame: &mut Frame, stmt: &Stmt) -> Result<(), GenError> {
        match stmt {
            Stmt::Assign {
                target: LValue::Var(name),
                value,
            } => {
                self.expr(frame, value)?;
                let slot = frame.bind(name)?;
                self.op_with(Opcode::StoreVar, slot);
            }
            Stmt::Assign {
                target: LValue::Index(container, index),
                value,
            } => {
                self.lvalue_ptr(frame, container)?;
                self.expr(frame, index)?;
                self.op(Opcode::ListAccessPtr);
                self.expr(frame, value)?;
                self.op(Opcode::StoreMem);
            }
            Stmt::Call { callee, args } => {
                self.call(frame, callee, args)?;
                self.op(Opcode::Pop);
            }
            Stmt::While { cond, body } => {
                let start = self.new_label();
                let end = self.new_label();
                self.label(&start);
                self.expr(frame, cond)?;
                self.op_with(Opcode::IfNJump, &end);
                self.stmt(frame, body)?;
                self.op_with(Opcode::Jump, &start);
                self.label(&end);
            }
            Stmt::If {
                branches,
                otherwise,
            } => {
                let end = self.new_label();
                for (cond, body) in branches {
                    let next = self.new_label();
                    self.expr(frame, cond)?;
                    self.op_with(Opcode::IfNJump, &next);
                    self.stmt(frame, body)?;
                    self.op_with(Opcode::Jump, &end);
                    self.label(&next);
                }
                if let Some(body) = otherwise {
                    self.stmt(frame, body)?;
                }
                self.label(&end);
            }
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.stmt(frame, stmt)?;
                }
            }
            Stmt::Return(value) => {
                self.expr(frame, value)?;
                self.op(Opcode::Return);
            }
        }
        Ok(())
    }

    fn expr(&mut self, frame: &mut Frame, expr: &Expr) -> Result<(), GenError> {
        match expr {
            Expr::Int(value) => {
                let name = self.constants.intern(Constant::Int(*value));
                self.op_with(Opcode::LoadInt, name);
            }
            Expr::Float(value) => {
                let name = self.constants.intern(Constant::Float(value.to_bits()));
                self.op_with(Opcode::LoadFloat, name);
            }
            Expr::Str(text) => {
                let name = self.constants.intern(Constant::Str(text.clone()));
                self.op_with(Opcode::LoadStr, name);
            }
            Expr::Var(name) => {
                let slot = frame.slot(name)?;
                self.op_with(Opcode::LoadVar, slot);
            }
            Expr::Call { callee, args } => self.call(frame, callee, args)?,
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let other = self.new_label();
                let end = self.new_label();
                self.expr(frame, cond)?;
                self.op_with(Opcode::IfNJump, &other);
                self.expr(frame, then)?;
                self.op_with(Opcode::Jump, &end);
                self.label(&other);
                self.expr(frame, otherwise)?;
                self.label(&end);
            }
            Expr::List(items) => {
                for item in items.iter().rev() {
                    self.expr(frame, item)?;
                }
                self.op_with(Opcode::ListCreate, items.len());
            }
            Expr::Index { target, index } => {
                self.container(frame, target)?;
                self.expr(frame, index)?;
                self.op(Opcode::ListAccess);
            }
        }
        Ok(())
    }

    /// Push a list operand. Variables and index chains rooted in one are
    /// addressed through a pointer instead of being copied.
    fn container(&mut self, frame: &mut Frame, expr: &Expr) -> Result<(), GenError> {
        if is_place(expr) {
            self.place_ptr(frame, expr)
        } else {
            self.expr(frame, expr)
        }
    }

    fn place_ptr(&mut self, frame: &mut Frame, expr: &Expr) -> Result<(), GenError> {
        match expr {
            Expr::Var(name) => {
                let slot = frame.slot(name)?;
                self.op_with(Opcode::LoadVarAddr, slot);
            }
            Expr::Index { target, index } => {
                self.place_ptr(frame, target)?;
                self.expr(frame, index)?;
                self.op(Opcode::ListAccessPtr);
            }
            other => self.expr(frame, other)?,
        }
        Ok(())
    }

    fn lvalue_ptr(&mut self, frame: &mut Frame, target: &LValue) -> Result<(), GenError> {
        match target {
            LValue::Var(name) => {
                let slot = frame.slot(name)?;
                self.op_with(Opcode::LoadVarAddr, slot);
            }
            LValue::Index(container, index) => {
                self.lvalue_ptr(frame, container)?;
                self.expr(frame, index)?;
                self.op(Opcode::ListAccessPtr);
            }
        }
        Ok(())
    }

    fn call(&mut self, frame: &mut Frame, callee: &Expr, args: &[Expr]) -> Result<(), GenError> {
        let Expr::Var(name) = callee else {
            return Err(GenError::MalformedCallTarget {
                function: frame.function.clone(),
            });
        };

        if name == "len" {
            check_arity(name, 1, args.len())?;
            self.container(frame, &args[0])?;
            self.op(Opcode::ListLength);
            return Ok(());
        }

        if let Some(op) = operator(name, args.len()) {
            check_arity(name, operator_arity(op), args.len())?;
            self.args(frame, args)?;
            self.op(op);
            return Ok(());
        }

        if let Some(function) = self.module.functions.get(name) {
            check_arity(name, function.params.len(), args.len())?;
            self.args(frame, args)?;
            self.op_with(Opcode::Call, format!("fn_{name}"));
            return Ok(());
        }

        // Anything else is left to the linker to resolve as a host routine
        self.args(frame, args)?;
        self.op_with(Opcode::CallExt, name);
        Ok(())
    }

    fn args(&mut self, frame: &mut Frame, args: &[Expr]) -> Result<(), GenError> {
        for arg in args.iter().rev() {
            self.expr(frame, arg)?;
        }
        Ok(())
    }

    fn new_label(&mut self) -> String {
        let label = format!("lbl{}", self.labels);
        self.labels += 1;
        label
    }

    fn label(&mut self, label: &str) {
        self.out.push_str(label);
        self.out.push_str(":\n");
    }

    fn op(&mut self, op: Opcode) {
        self.out.push_str(&format!("    {}\n", op.mnemonic()));
    }

    fn op_with(&mut self, op: Opcode, operand: impl Display) {
        self.out.push_str(&format!("    {} {operand}\n", op.mnemonic()));
    }
}

/// Local slot assignment of the function being generated
struct Frame {
    function: String,
    slots: HashMap<String, usize>,
    limit: usize,
}

impl Frame {
    fn new(function: &str, limit: usize) -> Self {
        Frame {
            function: function.to_string(),
            slots: HashMap::new(),
            limit,
        }
    }

    /// Slot of `name`, assigning the next free one on first use
    fn bind(&mut self, name: &str) -> Result<usize, GenError> {
        if let Some(&slot) = self.slots.get(name) {
            return Ok(slot);
        }
        let slot = self.slots.len();
        if slot == self.limit {
            return Err(GenError::TooManyLocals {
                function: self.function.clone(),
                limit: self.limit,
            });
        }
        self.slots.insert(name.to_string(), slot);
        Ok(slot)
    }

    fn slot(&self, name: &str) -> Result<usize, GenError> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| GenError::UndefinedLocal {
                function: self.function.clone(),
                name: name.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Constant {
    Int(i32),
    Float(u32),
    Str(String),
}

#[derive(Default)]
struct ConstantPool {
    entries: Vec<Constant>,
    index: HashMap<Constant, usize>,
}

impl ConstantPool {
    /// Name of the entry holding `constant`, adding it if it is new
    fn intern(&mut self, constant: Constant) -> String {
        let next = self.entries.len();
        let i = *self.index.entry(constant.clone()).or_insert(next);
        if i == next {
            self.entries.push(constant);
        }
        format!("const{i}")
    }
}

fn operator(name: &str, argc: usize) -> Option<Opcode> {
    let op = match name {
        "-" if argc == 1 => Opcode::Usub,
        "+" => Opcode::Add,
        "-" => Opcode::Sub,
        "*" => Opcode::Mul,
        "/" => Opcode::Div,
        "%" => Opcode::Mod,
        "<" => Opcode::Lt,
        "<=" => Opcode::Lteq,
        ">" => Opcode::Gt,
        ">=" => Opcode::Gteq,
        "==" => Opcode::Eq,
        "!=" => Opcode::Neq,
        "and" => Opcode::And,
        "or" => Opcode::Or,
        "not" => Opcode::Not,
        _ => return None,
    };
    Some(op)
}

fn operator_arity(op: Opcode) -> usize {
    match op {
        Opcode::Usub | Opcode::Not => 1,
        _ => 2,
    }
}

fn check_arity(callee: &str, expected: usize, found: usize) -> Result<(), GenError> {
    if expected == found {
        Ok(())
    } else {
        Err(GenError::ArityMismatch {
            callee: callee.to_string(),
            expected,
            found,
        })
    }
}

fn is_place(expr: &Expr) -> bool {
    match expr {
        Expr::Var(_) => true,
        Expr::Index { target, .. } => is_place(target),
        _ => false,
    }
}
