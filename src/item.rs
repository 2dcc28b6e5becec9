//! Runtime value representation.
//!
//! The core [`Item`] type: a fixed-size tagged value carrying either an
//! inline scalar or a reference to a collector-managed instance plus the
//! handler class responsible for it. Items are copied by value everywhere;
//! the copy is always shallow.

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use crate::class::Class;
use crate::collector::GcToken;
use crate::function::Function;

/// A runtime value.
#[derive(Clone, Default)]
pub enum Item {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    /// A plain function (no captured variables).
    Func(Rc<Function>),
    /// A function bound to a receiver.
    Method(Box<MethodItem>),
    /// A heap instance plus its handler class.
    Instance(InstanceRef),
}

/// A function bound to the value it was looked up on.
#[derive(Clone)]
pub struct MethodItem {
    pub receiver: Item,
    pub func: Rc<Function>,
}

/// Reference to a heap instance: the handler class and the collector token.
///
/// The instance itself is owned by the collector, never by any single item;
/// many items may alias the same instance.
#[derive(Clone)]
pub struct InstanceRef {
    pub class: Rc<dyn Class>,
    pub token: GcToken,
}

impl InstanceRef {
    /// Identity: whether two references name the same heap instance.
    pub fn same(&self, other: &InstanceRef) -> bool {
        self.token.same(&other.token)
    }
}

/// Rank used to order items of different types. Gives mixed-type
/// comparisons a total order so sorting never errors.
fn type_rank(item: &Item) -> u8 {
    match item {
        Item::Nil => 0,
        Item::Bool(_) => 1,
        Item::Int(_) | Item::Real(_) => 2,
        Item::Func(_) => 3,
        Item::Method(_) => 4,
        Item::Instance(_) => 5,
    }
}

impl Item {
    /// The name of this item's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Item::Nil => "nil",
            Item::Bool(_) => "boolean",
            Item::Int(_) => "integer",
            Item::Real(_) => "real",
            Item::Func(_) => "function",
            Item::Method(_) => "method",
            Item::Instance(_) => "instance",
        }
    }

    /// Type description including the concrete class of instances.
    pub fn type_desc(&self) -> String {
        match self {
            Item::Instance(inst) => inst.class.name().to_string(),
            other => other.type_name().to_string(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Item::Nil)
    }

    pub fn is_callable(&self) -> bool {
        match self {
            Item::Func(_) | Item::Method(_) => true,
            Item::Instance(inst) => inst.class.is_callable(),
            _ => false,
        }
    }

    /// Truth value. Nil is false, scalars by the usual zero tests,
    /// instances defer to their class.
    pub fn is_true(&self) -> bool {
        match self {
            Item::Nil => false,
            Item::Bool(b) => *b,
            Item::Int(n) => *n != 0,
            Item::Real(n) => *n != 0.0,
            Item::Func(_) | Item::Method(_) => true,
            Item::Instance(inst) => inst.class.is_true(inst),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Item::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Item::Real(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value with integer promotion, for mixed int/real math.
    pub fn force_real(&self) -> Option<f64> {
        match self {
            Item::Int(n) => Some(*n as f64),
            Item::Real(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceRef> {
        match self {
            Item::Instance(inst) => Some(inst),
            _ => None,
        }
    }

    /// Exact equality (`===`): same type tag and same value, instances by
    /// identity. Never consults class handlers and never errors.
    pub fn exact_eq(&self, other: &Item) -> bool {
        match (self, other) {
            (Item::Nil, Item::Nil) => true,
            (Item::Bool(a), Item::Bool(b)) => a == b,
            (Item::Int(a), Item::Int(b)) => a == b,
            // NaN is not exactly equal to itself
            (Item::Real(a), Item::Real(b)) => a == b,
            (Item::Func(a), Item::Func(b)) => Rc::ptr_eq(a, b),
            (Item::Method(a), Item::Method(b)) => {
                Rc::ptr_eq(&a.func, &b.func) && a.receiver.exact_eq(&b.receiver)
            }
            (Item::Instance(a), Item::Instance(b)) => a.same(b),
            _ => false,
        }
    }

    /// Default total order over items, used when no class handler claims
    /// the comparison. Mixed int/real promotes the integer operand; items
    /// of different types order by type rank; instances of the same type
    /// fall back to identity order.
    pub fn compare(&self, other: &Item) -> Ordering {
        match (self, other) {
            (Item::Int(a), Item::Int(b)) => a.cmp(b),
            (Item::Int(a), Item::Real(b)) => total_real_cmp(*a as f64, *b),
            (Item::Real(a), Item::Int(b)) => total_real_cmp(*a, *b as f64),
            (Item::Real(a), Item::Real(b)) => total_real_cmp(*a, *b),
            (Item::Bool(a), Item::Bool(b)) => a.cmp(b),
            (Item::Func(a), Item::Func(b)) => {
                (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
            }
            (Item::Method(a), Item::Method(b)) => {
                (Rc::as_ptr(&a.func) as usize).cmp(&(Rc::as_ptr(&b.func) as usize))
            }
            (Item::Instance(a), Item::Instance(b)) => {
                if a.same(b) {
                    Ordering::Equal
                } else {
                    (a.class.name(), a.token.index()).cmp(&(b.class.name(), b.token.index()))
                }
            }
            _ => type_rank(self).cmp(&type_rank(other)),
        }
    }
}

fn total_real_cmp(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.exact_eq(other)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Nil => write!(f, "nil"),
            Item::Bool(b) => write!(f, "{}", b),
            Item::Int(n) => write!(f, "{}", n),
            Item::Real(n) => write!(f, "{}", n),
            Item::Func(func) => write!(f, "{}", func.signature),
            Item::Method(m) => write!(f, "<method {}>", m.func.name),
            Item::Instance(inst) => write!(f, "{}", inst.class.describe(inst)),
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Nil => write!(f, "nil"),
            Item::Bool(b) => write!(f, "{}", b),
            Item::Int(n) => write!(f, "{}", n),
            Item::Real(n) => write!(f, "{}r", n),
            Item::Func(func) => write!(f, "[{}]", func.signature),
            Item::Method(m) => write!(f, "[method {}]", m.func.name),
            Item::Instance(inst) => {
                write!(f, "[{}#{}]", inst.class.name(), inst.token.index())
            }
        }
    }
}

// Conversions from Rust scalars

impl From<bool> for Item {
    fn from(b: bool) -> Self {
        Item::Bool(b)
    }
}

impl From<i64> for Item {
    fn from(n: i64) -> Self {
        Item::Int(n)
    }
}

impl From<i32> for Item {
    fn from(n: i32) -> Self {
        Item::Int(n as i64)
    }
}

impl From<f64> for Item {
    fn from(n: f64) -> Self {
        Item::Real(n)
    }
}

impl From<Rc<Function>> for Item {
    fn from(func: Rc<Function>) -> Self {
        Item::Func(func)
    }
}
