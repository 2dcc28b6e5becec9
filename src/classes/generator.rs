//! Generator instances: a suspended execution context on the heap.
//!
//! Calling a generator-flagged function does not run it; it allocates one
//! of these, holding a context primed at the function's first step. Each
//! advance resumes that context until the next yield. The handler traces
//! the suspended context's stacks, so everything a paused generator still
//! references stays alive.

use std::any::Any;

use crate::class::Class;
use crate::collector::Marker;
use crate::context::ExecutionContext;
use crate::engine::Runtime;
use crate::error::Fault;
use crate::item::{InstanceRef, Item};

pub struct GeneratorData {
    /// The suspended context; taken out while an advance is running.
    pub ctx: Option<ExecutionContext>,
    /// Whether the first advance has happened (its send value is
    /// discarded; no yield is pending yet).
    pub started: bool,
    pub finished: bool,
}

pub struct GeneratorClass;

impl Class for GeneratorClass {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn op_get_property(
        &self,
        _rt: &mut Runtime,
        inst: &InstanceRef,
        name: &str,
    ) -> Result<Item, Fault> {
        match name {
            "done" => {
                let data = inst
                    .token
                    .data::<GeneratorData>()
                    .ok_or_else(|| Fault::internal("generator instance without payload"))?;
                Ok(Item::Bool(data.finished))
            }
            _ => Err(Fault::access(name)),
        }
    }

    fn describe(&self, inst: &InstanceRef) -> String {
        match inst.token.data::<GeneratorData>() {
            Some(data) if data.finished => "<generator done>".to_string(),
            Some(_) => "<generator>".to_string(),
            None => "<generator>".to_string(),
        }
    }

    fn gc_mark(&self, data: &dyn Any, marker: &mut Marker<'_>) {
        let Some(data) = data.downcast_ref::<GeneratorData>() else {
            return;
        };
        let Some(ctx) = &data.ctx else {
            return;
        };
        for item in ctx.data_items().chain(ctx.frame_items()) {
            marker.mark(item);
        }
    }
}
