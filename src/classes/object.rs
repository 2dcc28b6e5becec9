//! Plain objects: property bags with method binding.

use std::any::Any;

use rustc_hash::FxHashMap;

use crate::api;
use crate::class::Class;
use crate::collector::Marker;
use crate::engine::Runtime;
use crate::error::Fault;
use crate::item::{InstanceRef, Item, MethodItem};
use crate::names::Name;

use super::string::StringData;

#[derive(Default)]
pub struct ObjectData {
    pub props: FxHashMap<Name, Item>,
}

pub struct ObjectClass;

/// A string-instance index doubles as a property key.
fn key_of(index: &Item) -> Option<String> {
    let inst = index.as_instance()?;
    let data = inst.token.data::<StringData>()?;
    Some(data.value.clone())
}

impl Class for ObjectClass {
    fn name(&self) -> &'static str {
        "object"
    }

    /// Property lookup. Function-valued properties bind the object as the
    /// receiver, so `obj.f(...)` calls see it as `self`. A missing
    /// property is an access condition, not nil.
    fn op_get_property(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        name: &str,
    ) -> Result<Item, Fault> {
        let data = inst
            .token
            .data::<ObjectData>()
            .ok_or_else(|| Fault::internal("object instance without payload"))?;
        match data.props.get(name) {
            Some(Item::Func(func)) => Ok(Item::Method(Box::new(MethodItem {
                receiver: Item::Instance(inst.clone()),
                func: func.clone(),
            }))),
            Some(value) => Ok(value.clone()),
            None => Err(Fault::access(name)),
        }
    }

    fn op_set_property(
        &self,
        rt: &mut Runtime,
        inst: &InstanceRef,
        name: &str,
        value: Item,
    ) -> Result<(), Fault> {
        let key = rt.intern(name);
        let mut data = inst
            .token
            .data_mut::<ObjectData>()
            .ok_or_else(|| Fault::internal("object instance without payload"))?;
        data.props.insert(key, value);
        Ok(())
    }

    fn op_get_index(
        &self,
        rt: &mut Runtime,
        inst: &InstanceRef,
        index: &Item,
    ) -> Result<Item, Fault> {
        let key = key_of(index).ok_or_else(|| Fault::invalid_operand("index", index))?;
        self.op_get_property(rt, inst, &key)
    }

    fn op_set_index(
        &self,
        rt: &mut Runtime,
        inst: &InstanceRef,
        index: &Item,
        value: Item,
    ) -> Result<(), Fault> {
        let key = key_of(index).ok_or_else(|| Fault::invalid_operand("index=", index))?;
        self.op_set_property(rt, inst, &key, value)
    }

    fn is_true(&self, inst: &InstanceRef) -> bool {
        inst.token
            .data::<ObjectData>()
            .map(|d| !d.props.is_empty())
            .unwrap_or(false)
    }

    fn describe(&self, inst: &InstanceRef) -> String {
        match inst.token.data::<ObjectData>() {
            Some(data) => format!("<object[{}]>", data.props.len()),
            None => "<object>".to_string(),
        }
    }

    fn clone_instance(&self, rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        let props = inst
            .token
            .data::<ObjectData>()
            .map(|d| d.props.clone())
            .ok_or_else(|| Fault::internal("object instance without payload"))?;
        let copy = rt.new_object();
        if let Some(target) = copy.as_instance() {
            if let Some(mut data) = target.token.data_mut::<ObjectData>() {
                data.props = props;
            }
        }
        Ok(copy)
    }

    fn to_json(&self, inst: &InstanceRef, depth: usize) -> Option<serde_json::Value> {
        let data = inst.token.data::<ObjectData>()?;
        let mut map = serde_json::Map::with_capacity(data.props.len());
        for (key, value) in &data.props {
            map.insert(key.to_string(), api::item_to_json_at(value, depth + 1));
        }
        Some(serde_json::Value::Object(map))
    }

    fn gc_mark(&self, data: &dyn Any, marker: &mut Marker<'_>) {
        if let Some(data) = data.downcast_ref::<ObjectData>() {
            for value in data.props.values() {
                marker.mark(value);
            }
        }
    }
}
