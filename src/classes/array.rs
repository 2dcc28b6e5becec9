//! Array instances: ordered, growable item sequences.

use std::any::Any;
use std::rc::Rc;

use crate::api;
use crate::class::Class;
use crate::collector::Marker;
use crate::engine::Runtime;
use crate::error::Fault;
use crate::function::Function;
use crate::item::{InstanceRef, Item, MethodItem};

#[derive(Default)]
pub struct ArrayData {
    pub items: Vec<Item>,
}

pub struct ArrayClass {
    push_fn: Rc<Function>,
    pop_fn: Rc<Function>,
}

impl ArrayClass {
    pub fn new() -> Self {
        Self {
            push_fn: Function::native("push", &["value"], array_push),
            pop_fn: Function::native("pop", &[], array_pop),
        }
    }
}

impl Default for ArrayClass {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a (possibly negative) index against the length.
fn resolve_index(raw: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let at = if raw < 0 { raw + len } else { raw };
    if at < 0 || at >= len {
        None
    } else {
        Some(at as usize)
    }
}

fn array_push(_rt: &mut Runtime, this: Item, args: &[Item]) -> Result<Item, Fault> {
    let inst = this
        .as_instance()
        .ok_or_else(|| Fault::invalid_operand("push", &this))?;
    let mut data = inst
        .token
        .data_mut::<ArrayData>()
        .ok_or_else(|| Fault::invalid_operand("push", &this))?;
    data.items.push(args.first().cloned().unwrap_or(Item::Nil));
    Ok(Item::Int(data.items.len() as i64))
}

fn array_pop(_rt: &mut Runtime, this: Item, _args: &[Item]) -> Result<Item, Fault> {
    let inst = this
        .as_instance()
        .ok_or_else(|| Fault::invalid_operand("pop", &this))?;
    let mut data = inst
        .token
        .data_mut::<ArrayData>()
        .ok_or_else(|| Fault::invalid_operand("pop", &this))?;
    Ok(data.items.pop().unwrap_or(Item::Nil))
}

impl Class for ArrayClass {
    fn name(&self) -> &'static str {
        "array"
    }

    /// Array + array concatenates shallowly.
    fn op_add(&self, rt: &mut Runtime, inst: &InstanceRef, other: &Item) -> Result<Item, Fault> {
        let rhs: Vec<Item> = other
            .as_instance()
            .and_then(|o| o.token.data::<ArrayData>().map(|d| d.items.clone()))
            .ok_or_else(|| Fault::operand("add", other))?;
        let mut items = inst
            .token
            .data::<ArrayData>()
            .map(|d| d.items.clone())
            .ok_or_else(|| Fault::internal("array instance without payload"))?;
        items.extend(rhs);
        Ok(rt.new_array(items))
    }

    fn op_get_index(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        index: &Item,
    ) -> Result<Item, Fault> {
        let Item::Int(raw) = index else {
            return Err(Fault::invalid_operand("index", index));
        };
        let data = inst
            .token
            .data::<ArrayData>()
            .ok_or_else(|| Fault::internal("array instance without payload"))?;
        let at = resolve_index(*raw, data.items.len())
            .ok_or_else(|| Fault::access(format!("index {}", raw)))?;
        Ok(data.items[at].clone())
    }

    fn op_set_index(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        index: &Item,
        value: Item,
    ) -> Result<(), Fault> {
        let Item::Int(raw) = index else {
            return Err(Fault::invalid_operand("index=", index));
        };
        let mut data = inst
            .token
            .data_mut::<ArrayData>()
            .ok_or_else(|| Fault::internal("array instance without payload"))?;
        let at = resolve_index(*raw, data.items.len())
            .ok_or_else(|| Fault::access(format!("index {}", raw)))?;
        data.items[at] = value;
        Ok(())
    }

    fn op_get_property(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        name: &str,
    ) -> Result<Item, Fault> {
        match name {
            "len" => {
                let data = inst
                    .token
                    .data::<ArrayData>()
                    .ok_or_else(|| Fault::internal("array instance without payload"))?;
                Ok(Item::Int(data.items.len() as i64))
            }
            "push" => Ok(Item::Method(Box::new(MethodItem {
                receiver: Item::Instance(inst.clone()),
                func: self.push_fn.clone(),
            }))),
            "pop" => Ok(Item::Method(Box::new(MethodItem {
                receiver: Item::Instance(inst.clone()),
                func: self.pop_fn.clone(),
            }))),
            _ => Err(Fault::access(name)),
        }
    }

    fn is_true(&self, inst: &InstanceRef) -> bool {
        inst.token
            .data::<ArrayData>()
            .map(|d| !d.items.is_empty())
            .unwrap_or(false)
    }

    fn describe(&self, inst: &InstanceRef) -> String {
        match inst.token.data::<ArrayData>() {
            Some(data) => format!("<array[{}]>", data.items.len()),
            None => "<array>".to_string(),
        }
    }

    fn clone_instance(&self, rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        let items = inst
            .token
            .data::<ArrayData>()
            .map(|d| d.items.clone())
            .ok_or_else(|| Fault::internal("array instance without payload"))?;
        Ok(rt.new_array(items))
    }

    fn to_json(&self, inst: &InstanceRef, depth: usize) -> Option<serde_json::Value> {
        let data = inst.token.data::<ArrayData>()?;
        Some(serde_json::Value::Array(
            data.items
                .iter()
                .map(|item| api::item_to_json_at(item, depth + 1))
                .collect(),
        ))
    }

    fn gc_mark(&self, data: &dyn Any, marker: &mut Marker<'_>) {
        if let Some(data) = data.downcast_ref::<ArrayData>() {
            for item in &data.items {
                marker.mark(item);
            }
        }
    }
}
