//! Expression and statement trees, and their precompilation into steps.
//!
//! Hosts build these trees programmatically (or from their own front end)
//! and compile them once per function. Precompilation is a depth-first
//! linearization emitting child steps before parent steps, so `a + b * c`
//! becomes `a, b, c, mul, add` and the engine never recurses through the
//! tree at run time. Short-circuit operators and conditionals insert gate
//! steps carrying precomputed sequence ids; loops emit backward jumps.

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Fault;
use crate::function::{Function, FunctionBody, build_signature};
use crate::names::Name;
use crate::step::{Const, Step};

/// Literal values.
#[derive(Debug, Clone)]
pub enum Lit {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(Rc<str>),
}

/// Binary operators with ordinary (non-short-circuit) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    ExactEq,
}

/// An assignable place.
#[derive(Debug, Clone)]
pub enum Target {
    Sym(Name),
    Prop(Box<Expr>, Name),
    Index(Box<Expr>, Box<Expr>),
}

/// Expressions.
#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Lit),
    Sym(Name),
    SelfRef,
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Short-circuit conjunction; the right operand is never evaluated
    /// when the left is false.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Ternary conditional.
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        other: Box<Expr>,
    },
    PreInc(Target),
    PreDec(Target),
    PostInc(Target),
    PostDec(Target),
    Prop(Box<Expr>, Name),
    Index(Box<Expr>, Box<Expr>),
    /// Assignment; evaluates to the assigned value.
    Assign(Target, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(Name, Expr)>),
    /// Closure creation over a previously compiled function.
    Closure(Rc<Function>),
    /// Suspend the context with the operand's value; evaluates to the
    /// value sent by the resumer. Generators only.
    Yield(Box<Expr>),
}

impl Expr {
    pub fn nil() -> Expr {
        Expr::Lit(Lit::Nil)
    }

    pub fn bool(b: bool) -> Expr {
        Expr::Lit(Lit::Bool(b))
    }

    pub fn int(n: i64) -> Expr {
        Expr::Lit(Lit::Int(n))
    }

    pub fn real(n: f64) -> Expr {
        Expr::Lit(Lit::Real(n))
    }

    pub fn str(s: &str) -> Expr {
        Expr::Lit(Lit::Str(s.into()))
    }

    pub fn sym(name: &str) -> Expr {
        Expr::Sym(Name::from(name))
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::Or(Box::new(left), Box::new(right))
    }

    pub fn ternary(cond: Expr, then: Expr, other: Expr) -> Expr {
        Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            other: Box::new(other),
        }
    }

    pub fn prop(object: Expr, name: &str) -> Expr {
        Expr::Prop(Box::new(object), Name::from(name))
    }

    pub fn index(object: Expr, idx: Expr) -> Expr {
        Expr::Index(Box::new(object), Box::new(idx))
    }

    pub fn assign_sym(name: &str, value: Expr) -> Expr {
        Expr::Assign(Target::Sym(Name::from(name)), Box::new(value))
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call(Box::new(callee), args)
    }

    pub fn call_sym(name: &str, args: Vec<Expr>) -> Expr {
        Expr::call(Expr::sym(name), args)
    }
}

/// Statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Evaluate and discard.
    Expr(Expr),
    /// Declare a local (function-scoped) and initialize it.
    Let(Name, Expr),
    /// Rebind the given names to the module table for the rest of the
    /// function, even where a local of the same name exists.
    Global(Vec<Name>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        other: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    /// Raise a condition; unwinds to the nearest try/catch.
    Raise(Expr),
    /// Suspend the context, handing the value to the resumer.
    Yield(Expr),
    Try {
        body: Vec<Stmt>,
        /// Local that receives the caught condition.
        catch_name: Name,
        handler: Vec<Stmt>,
    },
}

impl Stmt {
    pub fn let_(name: &str, value: Expr) -> Stmt {
        Stmt::Let(Name::from(name), value)
    }

    pub fn global(names: &[&str]) -> Stmt {
        Stmt::Global(names.iter().map(|n| Name::from(*n)).collect())
    }

    pub fn ret(value: Expr) -> Stmt {
        Stmt::Return(Some(value))
    }
}

/// A function under construction.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Name,
    pub params: Vec<Name>,
    /// Names closed over from the defining frame. Only meaningful when the
    /// compiled function is used through [`Expr::Closure`].
    pub captures: Vec<Name>,
    pub eta: bool,
    pub generator: bool,
    pub body: Vec<Stmt>,
}

impl FunctionDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: Name::from(name),
            params: Vec::new(),
            captures: Vec::new(),
            eta: false,
            generator: false,
            body: Vec::new(),
        }
    }

    pub fn params(mut self, names: &[&str]) -> Self {
        self.params = names.iter().map(|n| Name::from(*n)).collect();
        self
    }

    pub fn captures(mut self, names: &[&str]) -> Self {
        self.captures = names.iter().map(|n| Name::from(*n)).collect();
        self
    }

    pub fn eta(mut self) -> Self {
        self.eta = true;
        self
    }

    pub fn generator(mut self) -> Self {
        self.generator = true;
        self
    }

    pub fn body(mut self, stmts: Vec<Stmt>) -> Self {
        self.body = stmts;
        self
    }

    /// Flatten the body into a step sequence.
    pub fn compile(&self) -> Result<Rc<Function>, Fault> {
        let mut compiler = Compiler::new(self)?;
        compiler.emit_stmts(&self.body)?;
        let signature = build_signature(&self.name, &self.params);
        Ok(Rc::new(Function {
            name: self.name.clone(),
            params: self.params.clone().into(),
            captures: self.captures.clone().into(),
            locals: compiler.locals.into(),
            eta: self.eta,
            generator: self.generator,
            signature,
            body: FunctionBody::Steps(compiler.steps.into()),
        }))
    }
}

// ============================================================================
// Compiler - depth-first linearization
// ============================================================================

struct Compiler<'a> {
    def: &'a FunctionDef,
    steps: Vec<Step>,
    /// Frame slot for every known name: params, then captures, then
    /// hoisted locals.
    slots: FxHashMap<Name, u16>,
    locals: Vec<Name>,
    /// Names rebound to the module table by a `global` declaration.
    globals: FxHashSet<Name>,
}

impl<'a> Compiler<'a> {
    fn new(def: &'a FunctionDef) -> Result<Self, Fault> {
        let mut slots = FxHashMap::default();
        let mut next: u16 = 0;
        for name in def.params.iter().chain(def.captures.iter()) {
            if slots.insert(name.clone(), next).is_some() {
                return Err(Fault::compile(format!(
                    "duplicate parameter or capture '{}' in {}",
                    name, def.name
                )));
            }
            bump(&mut next, &def.name)?;
        }

        // Locals are function-scoped: hoist every `let` and catch binding
        // so a symbol resolves the same way before and after its
        // declaration statement.
        let mut locals = Vec::new();
        hoist_locals(&def.body, &mut slots, &mut locals, &mut next, &def.name)?;

        Ok(Self {
            def,
            steps: Vec::new(),
            slots,
            locals,
            globals: FxHashSet::default(),
        })
    }

    fn here(&self) -> u32 {
        self.steps.len() as u32
    }

    fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    // ── symbols ──────────────────────────────────────────────────────────

    fn emit_load_sym(&mut self, name: &Name) {
        if !self.globals.contains(name) {
            if let Some(slot) = self.slots.get(name) {
                self.push(Step::LoadLocal(*slot));
                return;
            }
        }
        self.push(Step::LoadGlobal(name.clone()));
    }

    /// Store the top of stack into the symbol, consuming it.
    fn emit_store_sym(&mut self, name: &Name) {
        if !self.globals.contains(name) {
            if let Some(slot) = self.slots.get(name) {
                self.push(Step::StoreLocal(*slot));
                return;
            }
        }
        self.push(Step::StoreGlobal(name.clone()));
    }

    // ── expressions ──────────────────────────────────────────────────────

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), Fault> {
        match expr {
            Expr::Lit(lit) => {
                match lit {
                    Lit::Nil => self.push(Step::PushConst(Const::Nil)),
                    Lit::Bool(b) => self.push(Step::PushConst(Const::Bool(*b))),
                    Lit::Int(n) => self.push(Step::PushConst(Const::Int(*n))),
                    Lit::Real(n) => self.push(Step::PushConst(Const::Real(*n))),
                    Lit::Str(s) => self.push(Step::PushStr(s.clone())),
                }
                Ok(())
            }

            Expr::Sym(name) => {
                self.emit_load_sym(name);
                Ok(())
            }

            Expr::SelfRef => {
                self.push(Step::LoadSelf);
                Ok(())
            }

            Expr::Not(inner) => {
                self.emit_expr(inner)?;
                self.push(Step::Not);
                Ok(())
            }

            Expr::Neg(inner) => {
                self.emit_expr(inner)?;
                self.push(Step::Neg);
                Ok(())
            }

            Expr::Binary { op, left, right } => {
                self.emit_expr(left)?;
                self.emit_expr(right)?;
                self.push(match op {
                    BinOp::Add => Step::Add,
                    BinOp::Sub => Step::Sub,
                    BinOp::Mul => Step::Mul,
                    BinOp::Div => Step::Div,
                    BinOp::Mod => Step::Mod,
                    BinOp::Lt => Step::Lt,
                    BinOp::Le => Step::Le,
                    BinOp::Gt => Step::Gt,
                    BinOp::Ge => Step::Ge,
                    BinOp::Eq => Step::Eq,
                    BinOp::Ne => Step::Ne,
                    BinOp::ExactEq => Step::ExactEq,
                });
                Ok(())
            }

            Expr::And(left, right) => {
                // left, gate, right, booleanize; the gate jumps past the
                // booleanize when the left operand already decides.
                self.emit_expr(left)?;
                let gate = self.steps.len();
                self.push(Step::AndGate { exit: 0 });
                self.emit_expr(right)?;
                self.push(Step::Booleanize);
                let exit = self.here();
                if let Step::AndGate { exit: slot } = &mut self.steps[gate] {
                    *slot = exit;
                }
                Ok(())
            }

            Expr::Or(left, right) => {
                self.emit_expr(left)?;
                let gate = self.steps.len();
                self.push(Step::OrGate { exit: 0 });
                self.emit_expr(right)?;
                self.push(Step::Booleanize);
                let exit = self.here();
                if let Step::OrGate { exit: slot } = &mut self.steps[gate] {
                    *slot = exit;
                }
                Ok(())
            }

            Expr::Ternary { cond, then, other } => {
                self.emit_expr(cond)?;
                let branch = self.steps.len();
                self.push(Step::CondBranch { on_false: 0 });
                self.emit_expr(then)?;
                let jump = self.steps.len();
                self.push(Step::Jump { to: 0 });
                let false_id = self.here();
                if let Step::CondBranch { on_false } = &mut self.steps[branch] {
                    *on_false = false_id;
                }
                self.emit_expr(other)?;
                let end = self.here();
                if let Step::Jump { to } = &mut self.steps[jump] {
                    *to = end;
                }
                Ok(())
            }

            Expr::PreInc(target) => self.emit_step_by(target, Step::Inc, true),
            Expr::PreDec(target) => self.emit_step_by(target, Step::Dec, true),
            Expr::PostInc(target) => self.emit_step_by(target, Step::Inc, false),
            Expr::PostDec(target) => self.emit_step_by(target, Step::Dec, false),

            Expr::Prop(object, name) => {
                self.emit_expr(object)?;
                self.push(Step::GetProp(name.clone()));
                Ok(())
            }

            Expr::Index(object, idx) => {
                self.emit_expr(object)?;
                self.emit_expr(idx)?;
                self.push(Step::GetIndex);
                Ok(())
            }

            Expr::Assign(target, value) => {
                self.emit_expr(value)?;
                self.emit_store_keeping(target)
            }

            Expr::Call(callee, args) => {
                if args.len() > u8::MAX as usize {
                    return Err(Fault::compile("too many call arguments"));
                }
                self.emit_expr(callee)?;
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.push(Step::Call {
                    argc: args.len() as u8,
                });
                Ok(())
            }

            Expr::Array(elements) => {
                if elements.len() > u16::MAX as usize {
                    return Err(Fault::compile("array literal too large"));
                }
                for element in elements {
                    self.emit_expr(element)?;
                }
                self.push(Step::MakeArray {
                    len: elements.len() as u16,
                });
                Ok(())
            }

            Expr::Object(entries) => {
                let keys: Vec<Name> = entries.iter().map(|(k, _)| k.clone()).collect();
                for (_, value) in entries {
                    self.emit_expr(value)?;
                }
                self.push(Step::MakeObject { keys: keys.into() });
                Ok(())
            }

            Expr::Yield(value) => {
                if !self.def.generator {
                    return Err(Fault::compile(format!(
                        "yield outside a generator in {}",
                        self.def.name
                    )));
                }
                self.emit_expr(value)?;
                self.push(Step::Yield);
                Ok(())
            }

            Expr::Closure(func) => {
                let mut capture_slots = Vec::with_capacity(func.captures.len());
                for name in func.captures.iter() {
                    let slot = self.slots.get(name).ok_or_else(|| {
                        Fault::compile(format!(
                            "closure capture '{}' is not a parameter or local of {}",
                            name, self.def.name
                        ))
                    })?;
                    capture_slots.push(*slot);
                }
                self.push(Step::MakeClosure {
                    func: func.clone(),
                    capture_slots: capture_slots.into(),
                });
                Ok(())
            }
        }
    }

    /// Store the top of stack into `target`, leaving the value on the
    /// stack as the expression result.
    fn emit_store_keeping(&mut self, target: &Target) -> Result<(), Fault> {
        match target {
            Target::Sym(name) => {
                self.push(Step::Dup);
                self.emit_store_sym(name);
                Ok(())
            }
            Target::Prop(object, name) => {
                self.emit_expr(object)?;
                self.push(Step::SetProp(name.clone()));
                Ok(())
            }
            Target::Index(object, idx) => {
                self.emit_expr(object)?;
                self.emit_expr(idx)?;
                self.push(Step::SetIndex);
                Ok(())
            }
        }
    }

    /// Increment/decrement a target; leaves the new value (`pre`) or the
    /// old value (post) as the expression result.
    fn emit_step_by(&mut self, target: &Target, op: Step, pre: bool) -> Result<(), Fault> {
        match target {
            Target::Sym(name) => {
                self.emit_load_sym(name);
                if pre {
                    self.push(op);
                    self.push(Step::Dup);
                } else {
                    self.push(Step::Dup);
                    self.push(op);
                }
                self.emit_store_sym(name);
                Ok(())
            }
            Target::Prop(object, name) => {
                self.emit_expr(object)?;
                self.push(Step::GetProp(name.clone()));
                if pre {
                    self.push(op);
                    self.push(Step::Dup);
                } else {
                    self.push(Step::Dup);
                    self.push(op);
                }
                // store the updated value back; the object is re-evaluated
                self.emit_expr(object)?;
                self.push(Step::SetProp(name.clone()));
                self.push(Step::Discard);
                Ok(())
            }
            Target::Index(object, idx) => {
                self.emit_expr(object)?;
                self.emit_expr(idx)?;
                self.push(Step::GetIndex);
                if pre {
                    self.push(op);
                    self.push(Step::Dup);
                } else {
                    self.push(Step::Dup);
                    self.push(op);
                }
                self.emit_expr(object)?;
                self.emit_expr(idx)?;
                self.push(Step::SetIndex);
                self.push(Step::Discard);
                Ok(())
            }
        }
    }

    // ── statements ───────────────────────────────────────────────────────

    fn emit_stmts(&mut self, stmts: &[Stmt]) -> Result<(), Fault> {
        for stmt in stmts {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), Fault> {
        match stmt {
            Stmt::Expr(expr) => {
                self.emit_expr(expr)?;
                self.push(Step::Discard);
                Ok(())
            }

            Stmt::Let(name, value) => {
                self.emit_expr(value)?;
                // hoisted in `new`; `global` cannot retarget a let
                if let Some(slot) = self.slots.get(name) {
                    self.push(Step::StoreLocal(*slot));
                    Ok(())
                } else {
                    Err(Fault::compile(format!("unhoisted local '{}'", name)))
                }
            }

            Stmt::Global(names) => {
                for name in names {
                    self.globals.insert(name.clone());
                }
                Ok(())
            }

            Stmt::If { cond, then, other } => {
                self.emit_expr(cond)?;
                let branch = self.steps.len();
                self.push(Step::CondBranch { on_false: 0 });
                self.emit_stmts(then)?;
                if other.is_empty() {
                    let end = self.here();
                    if let Step::CondBranch { on_false } = &mut self.steps[branch] {
                        *on_false = end;
                    }
                } else {
                    let jump = self.steps.len();
                    self.push(Step::Jump { to: 0 });
                    let false_id = self.here();
                    if let Step::CondBranch { on_false } = &mut self.steps[branch] {
                        *on_false = false_id;
                    }
                    self.emit_stmts(other)?;
                    let end = self.here();
                    if let Step::Jump { to } = &mut self.steps[jump] {
                        *to = end;
                    }
                }
                Ok(())
            }

            Stmt::While { cond, body } => {
                let start = self.here();
                self.emit_expr(cond)?;
                let branch = self.steps.len();
                self.push(Step::CondBranch { on_false: 0 });
                self.emit_stmts(body)?;
                self.push(Step::Jump { to: start });
                let end = self.here();
                if let Step::CondBranch { on_false } = &mut self.steps[branch] {
                    *on_false = end;
                }
                Ok(())
            }

            Stmt::Return(value) => {
                match value {
                    Some(expr) => self.emit_expr(expr)?,
                    None => self.push(Step::PushConst(Const::Nil)),
                }
                self.push(Step::Ret);
                Ok(())
            }

            Stmt::Raise(expr) => {
                self.emit_expr(expr)?;
                self.push(Step::Raise);
                Ok(())
            }

            Stmt::Yield(expr) => {
                // statement form: the resumer's value is discarded
                self.emit_expr(&Expr::Yield(Box::new(expr.clone())))?;
                self.push(Step::Discard);
                Ok(())
            }

            Stmt::Try {
                body,
                catch_name,
                handler,
            } => {
                let enter = self.steps.len();
                self.push(Step::EnterHandler {
                    catch_id: 0,
                    resume_id: 0,
                });
                self.emit_stmts(body)?;
                self.push(Step::PopFrame);
                let catch_id = self.here();
                // the unwinder leaves the condition on the stack
                if let Some(slot) = self.slots.get(catch_name) {
                    self.push(Step::StoreLocal(*slot));
                } else {
                    return Err(Fault::compile(format!("unhoisted catch binding '{}'", catch_name)));
                }
                self.emit_stmts(handler)?;
                self.push(Step::PopFrame);
                let resume_id = self.here();
                if let Step::EnterHandler {
                    catch_id: c,
                    resume_id: r,
                } = &mut self.steps[enter]
                {
                    *c = catch_id;
                    *r = resume_id;
                }
                Ok(())
            }
        }
    }
}

fn bump(next: &mut u16, fname: &Name) -> Result<(), Fault> {
    *next = next
        .checked_add(1)
        .ok_or_else(|| Fault::compile(format!("too many frame slots in {}", fname)))?;
    Ok(())
}

/// Collect every `let` and catch binding into the frame's local list.
fn hoist_locals(
    stmts: &[Stmt],
    slots: &mut FxHashMap<Name, u16>,
    locals: &mut Vec<Name>,
    next: &mut u16,
    fname: &Name,
) -> Result<(), Fault> {
    for stmt in stmts {
        match stmt {
            Stmt::Let(name, _) => {
                if !slots.contains_key(name) {
                    slots.insert(name.clone(), *next);
                    locals.push(name.clone());
                    bump(next, fname)?;
                }
            }
            Stmt::If { then, other, .. } => {
                hoist_locals(then, slots, locals, next, fname)?;
                hoist_locals(other, slots, locals, next, fname)?;
            }
            Stmt::While { body, .. } => {
                hoist_locals(body, slots, locals, next, fname)?;
            }
            Stmt::Try {
                body,
                catch_name,
                handler,
            } => {
                if !slots.contains_key(catch_name) {
                    slots.insert(catch_name.clone(), *next);
                    locals.push(catch_name.clone());
                    bump(next, fname)?;
                }
                hoist_locals(body, slots, locals, next, fname)?;
                hoist_locals(handler, slots, locals, next, fname)?;
            }
            _ => {}
        }
    }
    Ok(())
}
