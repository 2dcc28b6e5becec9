//! Per-type behavior tables.
//!
//! Every heap instance is handled through a [`Class`]: the polymorphic
//! operation table consulted by steps when an operand is instance-typed.
//! A handler implements only what its type supports; every operator
//! defaults to an unsupported-operation fault rather than being omitted.

use std::any::Any;
use std::cmp::Ordering;

use crate::collector::Marker;
use crate::engine::Runtime;
use crate::error::Fault;
use crate::item::{InstanceRef, Item};

/// The handler table for one instance type.
///
/// `op_*` operators receive the runtime (operations may allocate), the
/// instance the operation dispatches on, and the other operand where one
/// exists. `gc_mark` and `dispose` are the collector hooks: `gc_mark` must
/// mark every item the payload references, `dispose` consumes the payload
/// when the instance is reclaimed.
pub trait Class {
    /// Type name shown in diagnostics and type descriptions.
    fn name(&self) -> &'static str;

    // ── operators ────────────────────────────────────────────────────────

    fn op_add(&self, _rt: &mut Runtime, inst: &InstanceRef, _other: &Item) -> Result<Item, Fault> {
        Err(unsupported("add", self.name(), inst))
    }

    fn op_sub(&self, _rt: &mut Runtime, inst: &InstanceRef, _other: &Item) -> Result<Item, Fault> {
        Err(unsupported("sub", self.name(), inst))
    }

    fn op_mul(&self, _rt: &mut Runtime, inst: &InstanceRef, _other: &Item) -> Result<Item, Fault> {
        Err(unsupported("mul", self.name(), inst))
    }

    fn op_div(&self, _rt: &mut Runtime, inst: &InstanceRef, _other: &Item) -> Result<Item, Fault> {
        Err(unsupported("div", self.name(), inst))
    }

    fn op_mod(&self, _rt: &mut Runtime, inst: &InstanceRef, _other: &Item) -> Result<Item, Fault> {
        Err(unsupported("mod", self.name(), inst))
    }

    fn op_neg(&self, _rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        Err(unsupported("neg", self.name(), inst))
    }

    fn op_inc(&self, _rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        Err(unsupported("++", self.name(), inst))
    }

    fn op_dec(&self, _rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        Err(unsupported("--", self.name(), inst))
    }

    /// Ordering against another item. `None` means the class has no
    /// builtin order for this pair; the engine falls back to identity /
    /// type-rank comparison.
    fn op_compare(&self, _inst: &InstanceRef, _other: &Item) -> Option<Ordering> {
        None
    }

    fn op_get_index(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        _index: &Item,
    ) -> Result<Item, Fault> {
        Err(unsupported("index", self.name(), inst))
    }

    fn op_set_index(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        _index: &Item,
        _value: Item,
    ) -> Result<(), Fault> {
        Err(unsupported("index=", self.name(), inst))
    }

    fn op_get_property(
        &self,
        _rt: &mut Runtime,
        _inst: &InstanceRef,
        name: &str,
    ) -> Result<Item, Fault> {
        Err(Fault::access(name))
    }

    fn op_set_property(
        &self,
        _rt: &mut Runtime,
        _inst: &InstanceRef,
        name: &str,
        _value: Item,
    ) -> Result<(), Fault> {
        Err(Fault::access(name))
    }

    // ── value protocol ───────────────────────────────────────────────────

    /// Truth value of an instance. Most types are unconditionally true.
    fn is_true(&self, _inst: &InstanceRef) -> bool {
        true
    }

    /// Whether instances of this type can be called. The engine consults
    /// this for closures; plain data types leave the default.
    fn is_callable(&self) -> bool {
        false
    }

    /// Human-readable rendering for display and diagnostics.
    fn describe(&self, _inst: &InstanceRef) -> String {
        format!("<{}>", self.name())
    }

    /// Shallow copy of the instance.
    fn clone_instance(&self, _rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        Err(unsupported("clone", self.name(), inst))
    }

    /// JSON rendering for the host bridge. `None` when the type has no
    /// natural JSON form. Container types render nested items through
    /// [`crate::api::item_to_json_at`] with `depth + 1`, which caps
    /// self-referential structures.
    fn to_json(&self, _inst: &InstanceRef, _depth: usize) -> Option<serde_json::Value> {
        None
    }

    // ── collector hooks ──────────────────────────────────────────────────

    /// Mark every item reachable from the payload. Called during the mark
    /// phase; implementations must forward each nested item to the marker
    /// and nothing else.
    fn gc_mark(&self, _data: &dyn Any, _marker: &mut Marker<'_>) {}

    /// Consume the payload when the instance is reclaimed. The default
    /// drops it.
    fn dispose(&self, data: Box<dyn Any>) {
        drop(data);
    }
}

fn unsupported(op: &'static str, class_name: &'static str, _inst: &InstanceRef) -> Fault {
    Fault::Operand {
        op,
        operand: class_name.to_string(),
    }
}
