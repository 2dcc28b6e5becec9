//! Closure instances: a function plus its captured values.
//!
//! Capture is a by-value snapshot taken when the closure is created, so
//! captured bindings reflect their value at creation time. The snapshot
//! lives on the heap because closures routinely outlive the frame that
//! made them.

use std::any::Any;
use std::rc::Rc;

use crate::class::Class;
use crate::collector::Marker;
use crate::function::Function;
use crate::item::{InstanceRef, Item};

pub struct ClosureData {
    pub func: Rc<Function>,
    /// One value per name in `func.captures`, same order.
    pub captured: Vec<Item>,
}

pub struct ClosureClass;

impl Class for ClosureClass {
    fn name(&self) -> &'static str {
        "closure"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn describe(&self, inst: &InstanceRef) -> String {
        match inst.token.data::<ClosureData>() {
            Some(data) => format!("<closure {}>", data.func.signature),
            None => "<closure>".to_string(),
        }
    }

    fn gc_mark(&self, data: &dyn Any, marker: &mut Marker<'_>) {
        if let Some(data) = data.downcast_ref::<ClosureData>() {
            for item in &data.captured {
                marker.mark(item);
            }
        }
    }
}
