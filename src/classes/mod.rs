//! Builtin class handlers.
//!
//! Each builtin instance type gets its own handler implementing the
//! [`Class`] operation table: strings, arrays, property-bag objects,
//! closures and generators. Embedders plug additional types in through
//! the same trait.

pub mod array;
pub mod closure;
pub mod generator;
pub mod object;
pub mod string;

pub use array::{ArrayClass, ArrayData};
pub use closure::{ClosureClass, ClosureData};
pub use generator::{GeneratorClass, GeneratorData};
pub use object::{ObjectClass, ObjectData};
pub use string::{StringClass, StringData};

use std::rc::Rc;

use crate::class::Class;

/// The handler set a runtime is born with.
pub(crate) struct BuiltinClasses {
    pub string: Rc<dyn Class>,
    pub array: Rc<dyn Class>,
    pub object: Rc<dyn Class>,
    pub closure: Rc<dyn Class>,
    pub generator: Rc<dyn Class>,
}

impl BuiltinClasses {
    pub(crate) fn new() -> Self {
        Self {
            string: Rc::new(StringClass),
            array: Rc::new(ArrayClass::new()),
            object: Rc::new(ObjectClass),
            closure: Rc::new(ClosureClass),
            generator: Rc::new(GeneratorClass),
        }
    }
}
