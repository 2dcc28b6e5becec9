//! Function objects.
//!
//! A function couples a flattened step sequence (or a native entry point)
//! with its parameter metadata. Closures pair a function with the values
//! captured at closure-creation time; they live on the heap as
//! [`crate::classes::ClosureData`] instances.

use std::fmt;
use std::rc::Rc;

use crate::engine::Runtime;
use crate::error::Fault;
use crate::item::Item;
use crate::names::Name;
use crate::step::StepSeq;

/// Native entry point: `(runtime, self, args) -> result`.
///
/// Native functions bypass the frame machinery entirely; the engine calls
/// them directly and pushes the returned item.
pub type NativeFn = fn(&mut Runtime, Item, &[Item]) -> Result<Item, Fault>;

/// Executable body of a function.
#[derive(Debug, Clone)]
pub enum FunctionBody {
    /// Precompiled step sequence, executed frame by frame.
    Steps(Rc<StepSeq>),
    /// Native callback.
    Native(NativeFn),
}

/// The minimal execution unit: parameters, locals, capture list and a body.
#[derive(Debug)]
pub struct Function {
    pub name: Name,
    /// Formal parameters, bound to frame slots `0..params.len()`.
    pub params: Rc<[Name]>,
    /// Names closed over from the defining frame; bound to the slots after
    /// the parameters when the function is called as a closure.
    pub captures: Rc<[Name]>,
    /// Locals declared in the body; bound after the captures.
    pub locals: Rc<[Name]>,
    /// Eta functions are exempt from argument-count reduction: they accept
    /// any number of arguments (functional combinators).
    pub eta: bool,
    /// Generator functions produce a suspended context when called instead
    /// of running to completion.
    pub generator: bool,
    /// Rendered signature, e.g. `sum(a,b)`. Used by parameter faults.
    pub signature: String,
    pub body: FunctionBody,
}

impl Function {
    /// Wrap a native callback as a callable function item.
    pub fn native(name: &str, params: &[&str], entry: NativeFn) -> Rc<Function> {
        Self::native_with(name, params, entry, false)
    }

    /// Wrap a native combinator exempt from arity checking.
    pub fn native_eta(name: &str, params: &[&str], entry: NativeFn) -> Rc<Function> {
        Self::native_with(name, params, entry, true)
    }

    fn native_with(name: &str, params: &[&str], entry: NativeFn, eta: bool) -> Rc<Function> {
        let name = Name::from(name);
        let params: Vec<Name> = params.iter().map(|p| Name::from(*p)).collect();
        let signature = build_signature(&name, &params);
        Rc::new(Function {
            name,
            params: params.into(),
            captures: Rc::from([] as [Name; 0]),
            locals: Rc::from([] as [Name; 0]),
            eta,
            generator: false,
            signature,
            body: FunctionBody::Native(entry),
        })
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Frame slot count: parameters, then captures, then locals.
    pub fn frame_slots(&self) -> usize {
        self.params.len() + self.captures.len() + self.locals.len()
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native(_))
    }

    /// The step sequence of an interpreted function.
    pub fn steps(&self) -> Option<&Rc<StepSeq>> {
        match &self.body {
            FunctionBody::Steps(seq) => Some(seq),
            FunctionBody::Native(_) => None,
        }
    }
}

/// Render `name(a,b,c)` for diagnostics and parameter faults.
pub(crate) fn build_signature(name: &Name, params: &[Name]) -> String {
    let mut out = String::with_capacity(name.len() + 2 + params.len() * 8);
    out.push_str(name.as_str());
    out.push('(');
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(p.as_str());
    }
    out.push(')');
    out
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_rt: &mut Runtime, _this: Item, _args: &[Item]) -> Result<Item, Fault> {
        Ok(Item::Nil)
    }

    #[test]
    fn test_signature_rendering() {
        let f = Function::native("pair", &["a", "b"], noop);
        assert_eq!(f.signature, "pair(a,b)");
        assert_eq!(f.param_count(), 2);
        assert!(f.is_native());
        assert!(!f.eta);
    }

    #[test]
    fn test_signature_no_params() {
        let f = Function::native("tick", &[], noop);
        assert_eq!(f.signature, "tick()");
    }

    #[test]
    fn test_eta_flag() {
        let f = Function::native_eta("all", &["items"], noop);
        assert!(f.eta);
    }
}
