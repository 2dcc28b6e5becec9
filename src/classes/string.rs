//! String instances.
//!
//! Strings are mutable heap instances, not scalars: every literal push
//! allocates a fresh one, and concatenation produces a new instance.

use std::cmp::Ordering;

use crate::class::Class;
use crate::engine::Runtime;
use crate::error::Fault;
use crate::item::{InstanceRef, Item};

pub struct StringData {
    pub value: String,
}

pub struct StringClass;

/// Read the text of a string-typed item, if it is one.
fn text_of(item: &Item) -> Option<String> {
    let inst = item.as_instance()?;
    let data = inst.token.data::<StringData>()?;
    Some(data.value.clone())
}

impl StringClass {
    fn own_text(inst: &InstanceRef) -> Result<String, Fault> {
        inst.token
            .data::<StringData>()
            .map(|d| d.value.clone())
            .ok_or_else(|| Fault::internal("string instance without payload"))
    }
}

impl Class for StringClass {
    fn name(&self) -> &'static str {
        "string"
    }

    fn op_add(&self, rt: &mut Runtime, inst: &InstanceRef, other: &Item) -> Result<Item, Fault> {
        let Some(rhs) = text_of(other) else {
            return Err(Fault::operand("add", other));
        };
        let mut lhs = Self::own_text(inst)?;
        lhs.push_str(&rhs);
        Ok(rt.new_string(&lhs))
    }

    fn op_compare(&self, inst: &InstanceRef, other: &Item) -> Option<Ordering> {
        let rhs = text_of(other)?;
        let lhs = inst.token.data::<StringData>()?;
        Some(lhs.value.as_str().cmp(rhs.as_str()))
    }

    /// Character access; negative indices count from the end.
    fn op_get_index(
        &self,
        rt: &mut Runtime,
        inst: &InstanceRef,
        index: &Item,
    ) -> Result<Item, Fault> {
        let Item::Int(raw) = index else {
            return Err(Fault::invalid_operand("index", index));
        };
        let text = Self::own_text(inst)?;
        let len = text.chars().count() as i64;
        let at = if *raw < 0 { raw + len } else { *raw };
        if at < 0 || at >= len {
            return Err(Fault::access(format!("index {}", raw)));
        }
        let ch: String = text.chars().skip(at as usize).take(1).collect();
        Ok(rt.new_string(&ch))
    }

    fn op_get_property(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        name: &str,
    ) -> Result<Item, Fault> {
        match name {
            "len" => {
                let text = Self::own_text(inst)?;
                Ok(Item::Int(text.chars().count() as i64))
            }
            _ => Err(Fault::access(name)),
        }
    }

    fn is_true(&self, inst: &InstanceRef) -> bool {
        inst.token
            .data::<StringData>()
            .map(|d| !d.value.is_empty())
            .unwrap_or(false)
    }

    fn describe(&self, inst: &InstanceRef) -> String {
        match inst.token.data::<StringData>() {
            Some(data) => format!("\"{}\"", data.value),
            None => "<string>".to_string(),
        }
    }

    fn clone_instance(&self, rt: &mut Runtime, inst: &InstanceRef) -> Result<Item, Fault> {
        let text = Self::own_text(inst)?;
        Ok(rt.new_string(&text))
    }

    fn to_json(&self, inst: &InstanceRef, _depth: usize) -> Option<serde_json::Value> {
        let data = inst.token.data::<StringData>()?;
        Some(serde_json::Value::String(data.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat() {
        let mut rt = Runtime::new();
        let a = rt.new_string("run");
        let b = rt.new_string("time");
        let inst = a.as_instance().map(|i| i.clone());
        let inst = inst.unwrap_or_else(|| panic!("instance"));
        let joined = StringClass
            .op_add(&mut rt, &inst, &b)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(rt.string_of(&joined).as_deref(), Some("runtime"));
    }

    #[test]
    fn test_concat_non_string_faults() {
        let mut rt = Runtime::new();
        let a = rt.new_string("x");
        let inst = a.as_instance().cloned().unwrap_or_else(|| panic!("instance"));
        let err = StringClass.op_add(&mut rt, &inst, &Item::Int(3));
        assert!(matches!(err, Err(Fault::Operand { op: "add", .. })));
    }

    #[test]
    fn test_ordering() {
        let mut rt = Runtime::new();
        let a = rt.new_string("apple");
        let b = rt.new_string("pear");
        let inst = a.as_instance().cloned().unwrap_or_else(|| panic!("instance"));
        assert_eq!(StringClass.op_compare(&inst, &b), Some(Ordering::Less));
        assert_eq!(StringClass.op_compare(&inst, &Item::Int(1)), None);
    }

    #[test]
    fn test_char_index_wraps_negative() {
        let mut rt = Runtime::new();
        let s = rt.new_string("abc");
        let inst = s.as_instance().cloned().unwrap_or_else(|| panic!("instance"));
        let last = StringClass
            .op_get_index(&mut rt, &inst, &Item::Int(-1))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(rt.string_of(&last).as_deref(), Some("c"));

        let err = StringClass.op_get_index(&mut rt, &inst, &Item::Int(3));
        assert!(matches!(err, Err(Fault::Access { .. })));
    }

    #[test]
    fn test_truth_and_len() {
        let mut rt = Runtime::new();
        let empty = rt.new_string("");
        let full = rt.new_string("hi");
        assert!(!empty.is_true());
        assert!(full.is_true());

        let inst = full.as_instance().cloned().unwrap_or_else(|| panic!("instance"));
        let len = StringClass
            .op_get_property(&mut rt, &inst, "len")
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(len, Item::Int(2));
    }
}
