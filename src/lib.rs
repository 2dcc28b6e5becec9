//! An embeddable dynamic-language runtime core.
//!
//! The crate provides the three tightly coupled pieces a dynamic-language
//! engine is built around: a tagged value representation ([`Item`]), a
//! non-recursive stepwise execution engine (contexts running flattened
//! step sequences, so generators and deep call chains never grow the
//! native stack), and a tracing mark-and-sweep collector owning every
//! heap instance. Parsing is out of scope: hosts build [`ast`] trees (or
//! raw step sequences) and hand them to a [`Runtime`].
//!
//! # Example
//!
//! ```
//! use veld::ast::{BinOp, Expr, FunctionDef, Stmt};
//! use veld::{Item, Runtime};
//!
//! let mut rt = Runtime::new();
//! let sum = FunctionDef::new("sum")
//!     .params(&["a", "b"])
//!     .body(vec![Stmt::ret(Expr::binary(
//!         BinOp::Add,
//!         Expr::sym("a"),
//!         Expr::sym("b"),
//!     ))])
//!     .compile()
//!     .unwrap();
//!
//! let result = rt
//!     .call_function(&Item::Func(sum), &[Item::Int(1), Item::Int(2)])
//!     .unwrap();
//! assert_eq!(result, Item::Int(3));
//! ```

pub mod api;
pub mod ast;
pub mod class;
pub mod classes;
pub mod collector;
pub mod context;
pub mod engine;
pub mod error;
pub mod function;
pub mod item;
pub mod names;
pub mod pool;
pub mod step;

pub use class::Class;
pub use collector::{Collector, CycleStats, GcLock, GcStats, GcToken, Marker};
pub use context::{CodeFrame, ExecutionContext, FrameKind};
pub use engine::{GenProgress, Progress, Runtime, RuntimeOptions};
pub use error::Fault;
pub use function::{Function, FunctionBody, NativeFn};
pub use item::{InstanceRef, Item, MethodItem};
pub use names::{Name, NameDict};
pub use pool::Pool;
pub use step::{Const, Step, StepSeq};
