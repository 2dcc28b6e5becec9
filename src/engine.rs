//! The runtime engine: step loop, call protocol, fault unwinding.
//!
//! A [`Runtime`] owns the collector, the global module table, the builtin
//! class handlers and the context pool. Execution is a flat loop: fetch
//! the next step of the top code frame, execute it, repeat. Steps may push
//! frames (calls), pop them (returns), jump inside the current sequence
//! (gates), or suspend the context (yield). There is no native recursion
//! anywhere on the execution path, which is what lets generators and deep
//! call chains run on a fixed native stack.

use std::any::Any;
use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::trace;

use crate::class::Class;
use crate::classes::{ArrayData, BuiltinClasses, ClosureData, GeneratorData, ObjectData, StringData};
use crate::collector::{Collector, CycleStats, GcLock, GcStats};
use crate::context::{CodeFrame, ExecutionContext, FrameKind};
use crate::error::Fault;
use crate::function::{Function, FunctionBody, NativeFn};
use crate::item::{InstanceRef, Item};
use crate::names::{Name, NameDict};
use crate::pool::Pool;
use crate::step::{Step, StepSeq};

/// Tunables applied at runtime construction.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeOptions {
    /// Net allocations between automatic collection cycles (0 disables).
    pub gc_threshold: usize,
    /// Execution contexts retained for reuse across calls and generators.
    pub context_pool: usize,
    /// Steps a single run may execute before aborting (0 = unlimited).
    pub step_limit: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            gc_threshold: 128,
            context_pool: 16,
            step_limit: 0,
        }
    }
}

/// Outcome of running a context until it can run no further.
#[derive(Debug)]
pub enum Progress {
    /// The context finished; the final value.
    Complete(Item),
    /// A step requested suspension; the yielded value. The context keeps
    /// its sequence position and partial data stack for resumption.
    Suspended(Item),
}

/// Outcome of advancing a generator.
#[derive(Debug)]
pub enum GenProgress {
    Yielded(Item),
    Done(Item),
}

/// What a single step asks the loop to do next.
enum Flow {
    Continue,
    Suspend(Item),
}

/// An independent runtime instance: collector, globals, builtins, pools.
///
/// Multiple runtimes in one process are fully independent; nothing is
/// process-global.
pub struct Runtime {
    collector: Collector,
    globals: IndexMap<Name, Item>,
    names: NameDict,
    builtins: BuiltinClasses,
    contexts: Pool<ExecutionContext>,
    options: RuntimeOptions,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        let collector = Collector::new();
        collector.set_threshold(options.gc_threshold);
        Self {
            collector,
            globals: IndexMap::new(),
            names: NameDict::with_common_names(),
            builtins: BuiltinClasses::new(),
            contexts: Pool::new(options.context_pool),
            options,
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Intern a name in the runtime dictionary.
    pub fn intern(&mut self, s: &str) -> Name {
        self.names.get_or_insert(s)
    }

    // ── globals (the module table) ───────────────────────────────────────

    pub fn set_global(&mut self, name: &str, item: Item) {
        let name = self.names.get_or_insert(name);
        self.globals.insert(name, item);
    }

    pub fn get_global(&self, name: &str) -> Option<Item> {
        self.globals.get(name).cloned()
    }

    /// Globals in insertion order.
    pub fn globals(&self) -> impl Iterator<Item = (&Name, &Item)> {
        self.globals.iter()
    }

    /// Register a native function under a global name.
    pub fn register_native(&mut self, name: &str, params: &[&str], entry: NativeFn) {
        let func = Function::native(name, params, entry);
        self.set_global(name, Item::Func(func));
    }

    /// Register a native combinator exempt from arity checking.
    pub fn register_native_eta(&mut self, name: &str, params: &[&str], entry: NativeFn) {
        let func = Function::native_eta(name, params, entry);
        self.set_global(name, Item::Func(func));
    }

    // ── allocation ───────────────────────────────────────────────────────

    /// Allocate an instance of an embedder-defined class.
    pub fn new_instance(&mut self, class: Rc<dyn Class>, data: Box<dyn Any>) -> Item {
        let token = self.collector.allocate(class.clone(), data);
        Item::Instance(InstanceRef { class, token })
    }

    pub fn new_string(&mut self, s: &str) -> Item {
        let class = self.builtins.string.clone();
        self.new_instance(
            class,
            Box::new(StringData {
                value: s.to_string(),
            }),
        )
    }

    pub fn new_array(&mut self, items: Vec<Item>) -> Item {
        let class = self.builtins.array.clone();
        self.new_instance(class, Box::new(ArrayData { items }))
    }

    pub fn new_object(&mut self) -> Item {
        let class = self.builtins.object.clone();
        self.new_instance(class, Box::new(ObjectData::default()))
    }

    pub(crate) fn new_closure(&mut self, func: Rc<Function>, captured: Vec<Item>) -> Item {
        let class = self.builtins.closure.clone();
        self.new_instance(class, Box::new(ClosureData { func, captured }))
    }

    fn new_generator(&mut self, data: GeneratorData) -> Item {
        let class = self.builtins.generator.clone();
        self.new_instance(class, Box::new(data))
    }

    /// Read back the text of a string instance.
    pub fn string_of(&self, item: &Item) -> Option<String> {
        let inst = item.as_instance()?;
        let data = inst.token.data::<StringData>()?;
        Some(data.value.clone())
    }

    /// Shallow-copy an instance through its class handler.
    pub fn clone_item(&mut self, item: &Item) -> Result<Item, Fault> {
        match item {
            Item::Instance(inst) => {
                let class = inst.class.clone();
                class.clone_instance(self, inst)
            }
            scalar => Ok(scalar.clone()),
        }
    }

    // ── collection ───────────────────────────────────────────────────────

    /// Run a collection cycle with the global table as roots.
    pub fn collect(&self) -> CycleStats {
        self.collector.collect(self.globals.values())
    }

    /// Collection with a running context's stacks as additional roots.
    fn collect_ctx(&self, ctx: &ExecutionContext) -> CycleStats {
        let roots = self
            .globals
            .values()
            .chain(ctx.data_items())
            .chain(ctx.frame_items());
        self.collector.collect(roots)
    }

    pub fn gc_stats(&self) -> GcStats {
        self.collector.stats()
    }

    pub fn set_gc_threshold(&self, threshold: usize) {
        self.collector.set_threshold(threshold);
    }

    /// Pin an instance for native code holding a raw reference. The lock
    /// must be released with [`Runtime::unlock`]; it does not release on
    /// drop.
    pub fn lock(&self, item: &Item) -> Option<GcLock> {
        self.collector.lock(item)
    }

    pub fn unlock(&self, lock: GcLock) {
        self.collector.unlock(lock)
    }

    // ── execution ────────────────────────────────────────────────────────

    /// Call a callable item with the given arguments and run it to
    /// completion. Calling a generator function returns the primed
    /// generator instance instead of running it.
    pub fn call_function(&mut self, callee: &Item, args: &[Item]) -> Result<Item, Fault> {
        let mut ctx = self.take_context();
        ctx.push_data(callee.clone());
        for arg in args {
            ctx.push_data(arg.clone());
        }
        let outcome = self.call_on(&mut ctx, args.len());
        ctx.reset();
        self.contexts.release(ctx);
        outcome
    }

    fn call_on(&mut self, ctx: &mut ExecutionContext, argc: usize) -> Result<Item, Fault> {
        self.begin_call(ctx, argc)?;
        if !ctx.has_frames() {
            // native call or generator creation: the result is on the stack
            return Ok(ctx.pop_data().unwrap_or(Item::Nil));
        }
        match self.run(ctx, None)? {
            Progress::Complete(value) => Ok(value),
            Progress::Suspended(_) => Err(Fault::Internal(
                "context suspended outside a generator".into(),
            )),
        }
    }

    /// Execute a raw step sequence on a fresh context. The sequence runs
    /// in a plain frame with no locals; the final value is whatever it
    /// leaves on top of the data stack.
    pub fn run_steps(&mut self, seq: Rc<StepSeq>) -> Result<Item, Fault> {
        let mut ctx = self.take_context();
        ctx.push_frame(CodeFrame {
            seq,
            seq_id: 0,
            kind: FrameKind::Plain,
            local_base: 0,
            data_depth: 0,
            self_item: Item::Nil,
        });
        let outcome = match self.run(&mut ctx, None) {
            Ok(Progress::Complete(value)) => Ok(value),
            Ok(Progress::Suspended(_)) => Err(Fault::Internal(
                "raw sequence suspended outside a generator".into(),
            )),
            Err(fault) => Err(fault),
        };
        ctx.reset();
        self.contexts.release(ctx);
        outcome
    }

    /// Resume a generator instance, sending `send` to its pending yield.
    /// The first advance primes the generator; its `send` value is
    /// discarded because no yield is pending yet.
    pub fn advance_generator(&mut self, target: &Item, send: Item) -> Result<GenProgress, Fault> {
        let inst = target
            .as_instance()
            .ok_or_else(|| Fault::invalid_operand("advance", target))?
            .clone();

        let (mut gctx, started) = {
            let mut data = inst
                .token
                .data_mut::<GeneratorData>()
                .ok_or_else(|| Fault::invalid_operand("advance", target))?;
            if data.finished {
                return Ok(GenProgress::Done(Item::Nil));
            }
            let ctx = data.ctx.take().ok_or_else(|| {
                Fault::Internal("generator is already being advanced".into())
            })?;
            (ctx, data.started)
        };

        // The instance itself is not on any stack while it runs; pin it so
        // a cycle triggered inside the generator cannot reclaim it.
        let pin = self.collector.lock(target);
        let resume = if started { Some(send) } else { None };
        let outcome = self.run(&mut gctx, resume);
        if let Some(pin) = pin {
            self.collector.unlock(pin);
        }

        match outcome {
            Ok(Progress::Suspended(value)) => {
                if let Some(mut data) = inst.token.data_mut::<GeneratorData>() {
                    data.started = true;
                    data.ctx = Some(gctx);
                }
                Ok(GenProgress::Yielded(value))
            }
            Ok(Progress::Complete(value)) => {
                if let Some(mut data) = inst.token.data_mut::<GeneratorData>() {
                    data.started = true;
                    data.finished = true;
                }
                gctx.reset();
                self.contexts.release(gctx);
                Ok(GenProgress::Done(value))
            }
            Err(fault) => {
                if let Some(mut data) = inst.token.data_mut::<GeneratorData>() {
                    data.started = true;
                    data.finished = true;
                }
                gctx.reset();
                self.contexts.release(gctx);
                Err(fault)
            }
        }
    }

    fn take_context(&mut self) -> ExecutionContext {
        let mut ctx = self.contexts.get().unwrap_or_default();
        ctx.reset();
        ctx
    }

    // ── the step loop ────────────────────────────────────────────────────

    /// Run a context until it completes, suspends, or faults with no
    /// handler in reach. Collection cycles run only between steps, where
    /// every stack is fully pushed and consistent.
    fn run(&mut self, ctx: &mut ExecutionContext, resume: Option<Item>) -> Result<Progress, Fault> {
        if let Some(value) = resume {
            ctx.push_data(value);
        }

        let step_limit = self.options.step_limit;
        let mut executed: u64 = 0;

        loop {
            if self.collector.should_collect() {
                self.collect_ctx(ctx);
            }

            let Some(frame) = ctx.current_frame_mut() else {
                return Ok(Progress::Complete(ctx.pop_data().unwrap_or(Item::Nil)));
            };

            if frame.finished() {
                // implicit return: a call frame that ran off its sequence
                // completes with nil
                let finished = match ctx.pop_frame() {
                    Some(f) => f,
                    None => continue,
                };
                if finished.is_call() {
                    ctx.data.truncate(finished.local_base);
                    ctx.push_data(Item::Nil);
                }
                continue;
            }

            let step = frame.seq[frame.seq_id].clone();
            trace!(seq_id = frame.seq_id, ?step, "step");
            frame.seq_id += 1;

            executed += 1;
            if step_limit > 0 && executed > step_limit {
                return Err(Fault::Internal("step limit exceeded".into()));
            }

            match self.exec_step(ctx, step) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Suspend(value)) => return Ok(Progress::Suspended(value)),
                Err(fault) => self.unwind(ctx, fault)?,
            }
        }
    }

    /// Walk the code stack outward to the nearest handler frame; transfer
    /// control to its catch sequence with the data stack rolled back and
    /// the condition pushed. Uncaught faults terminate the context.
    fn unwind(&mut self, ctx: &mut ExecutionContext, fault: Fault) -> Result<(), Fault> {
        if !fault.is_catchable() {
            return Err(fault);
        }
        loop {
            let handler = match ctx.current_frame() {
                None => return Err(fault),
                Some(frame) => match frame.kind {
                    FrameKind::Handler { catch_id } => Some((catch_id, frame.data_depth)),
                    _ => None,
                },
            };
            if let Some((catch_id, depth)) = handler {
                ctx.data.truncate(depth);
                let condition = self.fault_to_item(fault);
                ctx.push_data(condition);
                if let Some(frame) = ctx.current_frame_mut() {
                    frame.seq_id = catch_id as usize;
                    // a second fault in the catch body propagates outward
                    frame.kind = FrameKind::Plain;
                }
                return Ok(());
            }
            ctx.pop_frame();
        }
    }

    /// The item a catch handler receives for a condition.
    fn fault_to_item(&mut self, fault: Fault) -> Item {
        match fault {
            Fault::Raised(value) => value,
            other => self.new_string(&other.to_string()),
        }
    }

    fn exec_step(&mut self, ctx: &mut ExecutionContext, step: Step) -> Result<Flow, Fault> {
        match step {
            // ── data movement ────────────────────────────────────────────
            Step::PushConst(c) => {
                ctx.push_data(c.to_item());
                Ok(Flow::Continue)
            }

            Step::PushStr(s) => {
                let item = self.new_string(&s);
                ctx.push_data(item);
                Ok(Flow::Continue)
            }

            Step::Dup => {
                let top = self.top(ctx)?.clone();
                ctx.push_data(top);
                Ok(Flow::Continue)
            }

            Step::Discard => {
                ctx.pop_data();
                Ok(Flow::Continue)
            }

            // ── variables ────────────────────────────────────────────────
            Step::LoadLocal(slot) => {
                let base = self.local_base(ctx)?;
                let item = ctx
                    .data
                    .get(base + slot as usize)
                    .cloned()
                    .ok_or_else(|| Fault::internal("local slot out of frame"))?;
                ctx.push_data(item);
                Ok(Flow::Continue)
            }

            Step::StoreLocal(slot) => {
                let base = self.local_base(ctx)?;
                let value = self.pop(ctx)?;
                let place = ctx
                    .data
                    .get_mut(base + slot as usize)
                    .ok_or_else(|| Fault::internal("local slot out of frame"))?;
                *place = value;
                Ok(Flow::Continue)
            }

            Step::LoadGlobal(name) => {
                let item = self
                    .globals
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| Fault::access(name.as_str()))?;
                ctx.push_data(item);
                Ok(Flow::Continue)
            }

            Step::StoreGlobal(name) => {
                let value = self.pop(ctx)?;
                self.globals.insert(name, value);
                Ok(Flow::Continue)
            }

            Step::LoadSelf => {
                let receiver = ctx
                    .current_frame()
                    .map(|f| f.self_item.clone())
                    .unwrap_or(Item::Nil);
                ctx.push_data(receiver);
                Ok(Flow::Continue)
            }

            // ── arithmetic ───────────────────────────────────────────────
            Step::Add => self.arith(ctx, "add"),
            Step::Sub => self.arith(ctx, "sub"),
            Step::Mul => self.arith(ctx, "mul"),
            Step::Div => self.arith(ctx, "div"),
            Step::Mod => self.arith(ctx, "mod"),

            Step::Neg => {
                let new = match self.top(ctx)? {
                    Item::Int(n) => Item::Int(n.wrapping_neg()),
                    Item::Real(n) => Item::Real(-n),
                    Item::Instance(inst) => {
                        let inst = inst.clone();
                        let class = inst.class.clone();
                        class.op_neg(self, &inst)?
                    }
                    other => return Err(Fault::invalid_operand("neg", other)),
                };
                self.replace_top(ctx, new)
            }

            Step::Not => {
                let truth = self.top(ctx)?.is_true();
                self.replace_top(ctx, Item::Bool(!truth))
            }

            Step::Inc => self.step_by(ctx, "++"),
            Step::Dec => self.step_by(ctx, "--"),

            // ── comparison ───────────────────────────────────────────────
            Step::Lt => self.comparison(ctx, |ord| ord == Ordering::Less),
            Step::Le => self.comparison(ctx, |ord| ord != Ordering::Greater),
            Step::Gt => self.comparison(ctx, |ord| ord == Ordering::Greater),
            Step::Ge => self.comparison(ctx, |ord| ord != Ordering::Less),
            Step::Eq => self.comparison(ctx, |ord| ord == Ordering::Equal),
            Step::Ne => self.comparison(ctx, |ord| ord != Ordering::Equal),

            Step::ExactEq => {
                let (lhs, rhs) = self.top_two(ctx)?;
                let equal = lhs.exact_eq(&rhs);
                self.replace_two(ctx, Item::Bool(equal))
            }

            // ── control gates ────────────────────────────────────────────
            Step::Booleanize => {
                let truth = self.top(ctx)?.is_true();
                self.replace_top(ctx, Item::Bool(truth))
            }

            Step::AndGate { exit } => {
                if self.top(ctx)?.is_true() {
                    // the right operand will produce the result
                    ctx.pop_data();
                } else {
                    self.replace_top(ctx, Item::Bool(false))?;
                    self.jump(ctx, exit)?;
                }
                Ok(Flow::Continue)
            }

            Step::OrGate { exit } => {
                if self.top(ctx)?.is_true() {
                    self.replace_top(ctx, Item::Bool(true))?;
                    self.jump(ctx, exit)?;
                } else {
                    ctx.pop_data();
                }
                Ok(Flow::Continue)
            }

            Step::CondBranch { on_false } => {
                let cond = self.pop(ctx)?;
                if !cond.is_true() {
                    self.jump(ctx, on_false)?;
                }
                Ok(Flow::Continue)
            }

            Step::Jump { to } => {
                self.jump(ctx, to)?;
                Ok(Flow::Continue)
            }

            // ── instance access ──────────────────────────────────────────
            Step::GetProp(name) => {
                let top = self.top(ctx)?.clone();
                match top {
                    Item::Instance(inst) => {
                        let class = inst.class.clone();
                        let value = class.op_get_property(self, &inst, name.as_str())?;
                        self.replace_top(ctx, value)
                    }
                    _ => Err(Fault::access(name.as_str())),
                }
            }

            Step::SetProp(name) => {
                let object = self.pop(ctx)?;
                let value = self.top(ctx)?.clone();
                match object {
                    Item::Instance(inst) => {
                        let class = inst.class.clone();
                        class.op_set_property(self, &inst, name.as_str(), value)?;
                        Ok(Flow::Continue)
                    }
                    _ => Err(Fault::access(name.as_str())),
                }
            }

            Step::GetIndex => {
                let index = self.pop(ctx)?;
                let object = self.top(ctx)?.clone();
                match object {
                    Item::Instance(inst) => {
                        let class = inst.class.clone();
                        let value = class.op_get_index(self, &inst, &index)?;
                        self.replace_top(ctx, value)
                    }
                    other => Err(Fault::operand("index", &other)),
                }
            }

            Step::SetIndex => {
                let index = self.pop(ctx)?;
                let object = self.pop(ctx)?;
                let value = self.top(ctx)?.clone();
                match object {
                    Item::Instance(inst) => {
                        let class = inst.class.clone();
                        class.op_set_index(self, &inst, &index, value)?;
                        Ok(Flow::Continue)
                    }
                    other => Err(Fault::operand("index=", &other)),
                }
            }

            // ── construction ─────────────────────────────────────────────
            Step::MakeArray { len } => {
                let len = len as usize;
                let depth = ctx.data_depth();
                if depth < len {
                    return Err(Fault::internal("array literal underflow"));
                }
                let items: Vec<Item> = ctx.data.drain(depth - len..).collect();
                let array = self.new_array(items);
                ctx.push_data(array);
                Ok(Flow::Continue)
            }

            Step::MakeObject { keys } => {
                let len = keys.len();
                let depth = ctx.data_depth();
                if depth < len {
                    return Err(Fault::internal("object literal underflow"));
                }
                let values: Vec<Item> = ctx.data.drain(depth - len..).collect();
                let object = self.new_object();
                if let Item::Instance(inst) = &object {
                    if let Some(mut data) = inst.token.data_mut::<ObjectData>() {
                        for (key, value) in keys.iter().zip(values) {
                            data.props.insert(key.clone(), value);
                        }
                    }
                }
                ctx.push_data(object);
                Ok(Flow::Continue)
            }

            Step::MakeClosure {
                func,
                capture_slots,
            } => {
                if func.captures.is_empty() {
                    ctx.push_data(Item::Func(func));
                    return Ok(Flow::Continue);
                }
                let base = self.local_base(ctx)?;
                let mut captured = Vec::with_capacity(capture_slots.len());
                for slot in capture_slots.iter() {
                    let value = ctx
                        .data
                        .get(base + *slot as usize)
                        .cloned()
                        .ok_or_else(|| Fault::internal("capture slot out of frame"))?;
                    captured.push(value);
                }
                let closure = self.new_closure(func, captured);
                ctx.push_data(closure);
                Ok(Flow::Continue)
            }

            // ── calls and frames ─────────────────────────────────────────
            Step::Call { argc } => {
                self.begin_call(ctx, argc as usize)?;
                Ok(Flow::Continue)
            }

            Step::Ret => {
                let result = ctx.pop_data().unwrap_or(Item::Nil);
                loop {
                    match ctx.pop_frame() {
                        Some(frame) if frame.is_call() => {
                            ctx.data.truncate(frame.local_base);
                            ctx.push_data(result);
                            break;
                        }
                        Some(_) => continue,
                        None => {
                            // top-level plain sequence: the result is final
                            ctx.push_data(result);
                            break;
                        }
                    }
                }
                Ok(Flow::Continue)
            }

            Step::EnterHandler {
                catch_id,
                resume_id,
            } => {
                let (seq, body_start, local_base, self_item) = {
                    let frame = ctx
                        .current_frame()
                        .ok_or_else(|| Fault::internal("handler without a frame"))?;
                    (
                        frame.seq.clone(),
                        frame.seq_id,
                        frame.local_base,
                        frame.self_item.clone(),
                    )
                };
                if let Some(frame) = ctx.current_frame_mut() {
                    frame.seq_id = resume_id as usize;
                }
                ctx.push_frame(CodeFrame {
                    seq,
                    seq_id: body_start,
                    kind: FrameKind::Handler { catch_id },
                    local_base,
                    data_depth: ctx.data_depth(),
                    self_item,
                });
                Ok(Flow::Continue)
            }

            Step::PopFrame => {
                let popped = ctx.pop_frame();
                debug_assert!(
                    popped.as_ref().is_some_and(|f| !f.is_call()),
                    "PopFrame must not pop a call frame"
                );
                Ok(Flow::Continue)
            }

            // ── conditions and suspension ────────────────────────────────
            Step::Raise => {
                let value = self.pop(ctx)?;
                Err(Fault::Raised(value))
            }

            Step::Yield => {
                let value = self.pop(ctx)?;
                Ok(Flow::Suspend(value))
            }
        }
    }

    // ── call protocol ────────────────────────────────────────────────────

    /// Begin a call: the callee sits beneath the top `argc` arguments.
    ///
    /// Natives execute inline and push their result. Interpreted callees
    /// get a new code frame whose locals area starts at the first
    /// argument; the recorded data depth detects mismatched returns.
    /// Generator functions allocate a primed generator instance instead.
    fn begin_call(&mut self, ctx: &mut ExecutionContext, argc: usize) -> Result<(), Fault> {
        let depth = ctx.data_depth();
        if depth < argc + 1 {
            return Err(Fault::internal("call underflow"));
        }
        let callee_at = depth - argc - 1;
        let callee = ctx.data[callee_at].clone();

        let (func, self_item, captured) = match callee {
            Item::Func(f) => (f, Item::Nil, None),
            Item::Method(m) => (m.func.clone(), m.receiver.clone(), None),
            Item::Instance(inst) => {
                let closure = inst
                    .token
                    .data::<ClosureData>()
                    .map(|c| (c.func.clone(), c.captured.clone()));
                match closure {
                    Some((func, captured)) => (func, Item::Nil, Some(captured)),
                    None => {
                        return Err(Fault::invalid_operand("call", &Item::Instance(inst)));
                    }
                }
            }
            other => return Err(Fault::invalid_operand("call", &other)),
        };

        // Arity check before any stack mutation: a parameter fault leaves
        // the caller's depth intact for the unwinder to restore.
        if !func.eta && argc != func.param_count() {
            return Err(Fault::param(func.signature.clone()));
        }

        match &func.body {
            FunctionBody::Native(entry) => {
                let entry = *entry;
                let args: Vec<Item> = ctx.data.drain(callee_at + 1..).collect();
                ctx.data.truncate(callee_at);
                let result = entry(self, self_item, &args)?;
                ctx.push_data(result);
                Ok(())
            }
            FunctionBody::Steps(seq) => {
                if func.generator {
                    return self.begin_generator(ctx, func.clone(), seq.clone(), callee_at, self_item, captured);
                }
                let seq = seq.clone();
                ctx.data.remove(callee_at);
                let local_base = callee_at;
                self.bind_frame_slots(ctx, &func, local_base, argc, captured);
                ctx.push_frame(CodeFrame {
                    seq,
                    seq_id: 0,
                    kind: FrameKind::Call { func },
                    local_base,
                    data_depth: ctx.data_depth(),
                    self_item,
                });
                Ok(())
            }
        }
    }

    /// Pad or trim the arguments to the formal count (eta functions may
    /// differ), then push capture values and nil locals.
    fn bind_frame_slots(
        &mut self,
        ctx: &mut ExecutionContext,
        func: &Rc<Function>,
        local_base: usize,
        argc: usize,
        captured: Option<Vec<Item>>,
    ) {
        let formals = func.param_count();
        if argc > formals {
            ctx.data.truncate(local_base + formals);
        } else {
            for _ in argc..formals {
                ctx.push_data(Item::Nil);
            }
        }
        match captured {
            Some(values) => {
                debug_assert_eq!(values.len(), func.captures.len());
                ctx.data.extend(values);
            }
            None => {
                for _ in 0..func.captures.len() {
                    ctx.push_data(Item::Nil);
                }
            }
        }
        for _ in 0..func.locals.len() {
            ctx.push_data(Item::Nil);
        }
    }

    /// Calling a generator function: build its own context, bind the
    /// frame, and hand back a generator instance holding it.
    fn begin_generator(
        &mut self,
        ctx: &mut ExecutionContext,
        func: Rc<Function>,
        seq: Rc<StepSeq>,
        callee_at: usize,
        self_item: Item,
        captured: Option<Vec<Item>>,
    ) -> Result<(), Fault> {
        let mut inner = self.take_context();
        let args: Vec<Item> = ctx.data.drain(callee_at + 1..).collect();
        ctx.data.truncate(callee_at);
        let argc = args.len();
        inner.data.extend(args);
        self.bind_frame_slots(&mut inner, &func, 0, argc, captured);
        inner.push_frame(CodeFrame {
            seq,
            seq_id: 0,
            kind: FrameKind::Call { func },
            local_base: 0,
            data_depth: inner.data_depth(),
            self_item,
        });
        let instance = self.new_generator(GeneratorData {
            ctx: Some(inner),
            started: false,
            finished: false,
        });
        ctx.push_data(instance);
        Ok(())
    }

    // ── operators ────────────────────────────────────────────────────────

    /// Binary arithmetic over the top two items: int/int stays integral,
    /// mixed int/real promotes, instance operands defer to their class.
    fn arith(&mut self, ctx: &mut ExecutionContext, op: &'static str) -> Result<Flow, Fault> {
        let (lhs, rhs) = self.top_two(ctx)?;
        let result = match (&lhs, &rhs) {
            (Item::Int(a), Item::Int(b)) => int_arith(op, *a, *b)?,
            (Item::Int(_) | Item::Real(_), Item::Int(_) | Item::Real(_)) => {
                let a = lhs.force_real().unwrap_or(0.0);
                let b = rhs.force_real().unwrap_or(0.0);
                real_arith(op, a, b)
            }
            (Item::Instance(inst), _) => {
                let inst = inst.clone();
                let class = inst.class.clone();
                match op {
                    "add" => class.op_add(self, &inst, &rhs)?,
                    "sub" => class.op_sub(self, &inst, &rhs)?,
                    "mul" => class.op_mul(self, &inst, &rhs)?,
                    "div" => class.op_div(self, &inst, &rhs)?,
                    "mod" => class.op_mod(self, &inst, &rhs)?,
                    _ => return Err(Fault::internal("unknown arithmetic operator")),
                }
            }
            _ => return Err(Fault::invalid_operand(op_symbol(op), &lhs)),
        };
        self.replace_two(ctx, result)
    }

    fn comparison(
        &mut self,
        ctx: &mut ExecutionContext,
        decide: fn(Ordering) -> bool,
    ) -> Result<Flow, Fault> {
        let (lhs, rhs) = self.top_two(ctx)?;
        let ord = self.compare_items(&lhs, &rhs);
        self.replace_two(ctx, Item::Bool(decide(ord)))
    }

    /// Ordering with class dispatch: an instance operand is offered the
    /// comparison first; without a builtin order the default total order
    /// (identity for instances, type rank across types) applies.
    pub fn compare_items(&self, lhs: &Item, rhs: &Item) -> Ordering {
        if let Item::Instance(inst) = lhs {
            if let Some(ord) = inst.class.op_compare(inst, rhs) {
                return ord;
            }
        }
        if let Item::Instance(inst) = rhs {
            if let Some(ord) = inst.class.op_compare(inst, lhs) {
                return ord.reverse();
            }
        }
        lhs.compare(rhs)
    }

    /// Increment/decrement the top item in place.
    fn step_by(&mut self, ctx: &mut ExecutionContext, op: &'static str) -> Result<Flow, Fault> {
        let delta: i64 = if op == "++" { 1 } else { -1 };
        let new = match self.top(ctx)? {
            Item::Int(n) => Item::Int(n.wrapping_add(delta)),
            Item::Real(n) => Item::Real(n + delta as f64),
            Item::Instance(inst) => {
                let inst = inst.clone();
                let class = inst.class.clone();
                if delta > 0 {
                    class.op_inc(self, &inst)?
                } else {
                    class.op_dec(self, &inst)?
                }
            }
            other => return Err(Fault::invalid_operand(op, other)),
        };
        self.replace_top(ctx, new)
    }

    // ── small stack helpers ──────────────────────────────────────────────

    fn top<'c>(&self, ctx: &'c ExecutionContext) -> Result<&'c Item, Fault> {
        ctx.top_data()
            .ok_or_else(|| Fault::internal("data stack underflow"))
    }

    fn pop(&self, ctx: &mut ExecutionContext) -> Result<Item, Fault> {
        ctx.pop_data()
            .ok_or_else(|| Fault::internal("data stack underflow"))
    }

    fn top_two(&self, ctx: &ExecutionContext) -> Result<(Item, Item), Fault> {
        let depth = ctx.data_depth();
        if depth < 2 {
            return Err(Fault::internal("data stack underflow"));
        }
        Ok((ctx.data[depth - 2].clone(), ctx.data[depth - 1].clone()))
    }

    /// Write the result into the first operand's slot and pop the second,
    /// the usual net effect of a binary step.
    fn replace_two(&self, ctx: &mut ExecutionContext, result: Item) -> Result<Flow, Fault> {
        let depth = ctx.data_depth();
        if depth < 2 {
            return Err(Fault::internal("data stack underflow"));
        }
        ctx.data[depth - 2] = result;
        ctx.data.pop();
        Ok(Flow::Continue)
    }

    fn replace_top(&self, ctx: &mut ExecutionContext, result: Item) -> Result<Flow, Fault> {
        match ctx.top_data_mut() {
            Some(top) => {
                *top = result;
                Ok(Flow::Continue)
            }
            None => Err(Fault::internal("data stack underflow")),
        }
    }

    fn local_base(&self, ctx: &ExecutionContext) -> Result<usize, Fault> {
        ctx.current_frame()
            .map(|f| f.local_base)
            .ok_or_else(|| Fault::internal("no active frame"))
    }

    fn jump(&self, ctx: &mut ExecutionContext, to: u32) -> Result<(), Fault> {
        match ctx.current_frame_mut() {
            Some(frame) => {
                frame.seq_id = to as usize;
                Ok(())
            }
            None => Err(Fault::internal("jump without a frame")),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

fn op_symbol(op: &'static str) -> &'static str {
    match op {
        "add" => "+",
        "sub" => "-",
        "mul" => "*",
        "div" => "/",
        "mod" => "%",
        other => other,
    }
}

fn int_arith(op: &str, a: i64, b: i64) -> Result<Item, Fault> {
    Ok(match op {
        "add" => Item::Int(a.wrapping_add(b)),
        "sub" => Item::Int(a.wrapping_sub(b)),
        "mul" => Item::Int(a.wrapping_mul(b)),
        "div" => {
            if b == 0 {
                return Err(Fault::DivisionByZero);
            }
            Item::Int(a.wrapping_div(b))
        }
        "mod" => {
            if b == 0 {
                return Err(Fault::DivisionByZero);
            }
            Item::Int(a.wrapping_rem(b))
        }
        _ => return Err(Fault::internal("unknown arithmetic operator")),
    })
}

fn real_arith(op: &str, a: f64, b: f64) -> Item {
    Item::Real(match op {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" => a / b,
        "mod" => a % b,
        _ => f64::NAN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Const;

    fn seq(steps: Vec<Step>) -> Rc<StepSeq> {
        steps.into()
    }

    #[test]
    fn test_raw_sequence_arithmetic() {
        let mut rt = Runtime::new();
        let result = rt
            .run_steps(seq(vec![
                Step::PushConst(Const::Int(3)),
                Step::PushConst(Const::Int(4)),
                Step::Mul,
                Step::PushConst(Const::Int(2)),
                Step::Add,
            ]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(result, Item::Int(14));
    }

    #[test]
    fn test_int_plus_real_promotes() {
        let mut rt = Runtime::new();
        let result = rt
            .run_steps(seq(vec![
                Step::PushConst(Const::Int(1)),
                Step::PushConst(Const::Real(2.5)),
                Step::Add,
            ]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(result, Item::Real(3.5));
    }

    #[test]
    fn test_int_division_by_zero_faults() {
        let mut rt = Runtime::new();
        let err = rt.run_steps(seq(vec![
            Step::PushConst(Const::Int(1)),
            Step::PushConst(Const::Int(0)),
            Step::Div,
        ]));
        assert!(matches!(err, Err(Fault::DivisionByZero)));
    }

    #[test]
    fn test_native_call() {
        fn double(_rt: &mut Runtime, _this: Item, args: &[Item]) -> Result<Item, Fault> {
            match args.first() {
                Some(Item::Int(n)) => Ok(Item::Int(n * 2)),
                _ => Err(Fault::invalid_operand("double", &Item::Nil)),
            }
        }
        let mut rt = Runtime::new();
        rt.register_native("double", &["n"], double);
        let f = rt.get_global("double").unwrap_or_else(|| panic!("registered"));
        let result = rt
            .call_function(&f, &[Item::Int(21)])
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(result, Item::Int(42));
    }

    #[test]
    fn test_native_arity_checked() {
        fn noop(_rt: &mut Runtime, _this: Item, _args: &[Item]) -> Result<Item, Fault> {
            Ok(Item::Nil)
        }
        let mut rt = Runtime::new();
        rt.register_native("pair", &["a", "b"], noop);
        let f = rt.get_global("pair").unwrap_or_else(|| panic!("registered"));
        let err = rt.call_function(&f, &[Item::Int(1)]);
        match err {
            Err(Fault::Param { signature }) => assert_eq!(signature, "pair(a,b)"),
            other => panic!("expected parameter fault, got {other:?}"),
        }
    }

    #[test]
    fn test_eta_native_accepts_any_arity() {
        fn count(_rt: &mut Runtime, _this: Item, args: &[Item]) -> Result<Item, Fault> {
            Ok(Item::Int(args.len() as i64))
        }
        let mut rt = Runtime::new();
        rt.register_native_eta("count", &["items"], count);
        let f = rt.get_global("count").unwrap_or_else(|| panic!("registered"));
        let result = rt
            .call_function(&f, &[Item::Int(1), Item::Int(2), Item::Int(3)])
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(result, Item::Int(3));
    }

    #[test]
    fn test_globals_keep_insertion_order() {
        let mut rt = Runtime::new();
        rt.set_global("one", Item::Int(1));
        rt.set_global("two", Item::Int(2));
        rt.set_global("three", Item::Int(3));
        let names: Vec<String> = rt.globals().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, ["one", "two", "three"]);
    }

    #[test]
    fn test_step_limit_aborts_runaway_sequence() {
        let mut rt = Runtime::with_options(RuntimeOptions {
            step_limit: 1_000,
            ..RuntimeOptions::default()
        });
        // a sequence that jumps to itself forever
        let err = rt.run_steps(seq(vec![Step::Jump { to: 0 }]));
        assert!(matches!(err, Err(Fault::Internal(_))));
    }

    #[test]
    fn test_string_literal_step_allocates() {
        let mut rt = Runtime::new();
        let before = rt.gc_stats().live;
        let result = rt
            .run_steps(seq(vec![Step::PushStr("hello".into())]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(rt.string_of(&result).as_deref(), Some("hello"));
        assert_eq!(rt.gc_stats().live, before + 1);
    }
}
