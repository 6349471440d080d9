//! `stackfold` resolves merge operands for replicated key-value stores.
//!
//! Writes append small named operands instead of rewriting a whole
//! value. On read or compaction the store hands every accumulated
//! version of a key to a [`Merger`], which folds the operands onto the
//! last full value, or pre-reduces them if no full value exists yet,
//! using the [`Operator`]s registered under their names.
//!
//! ```
//! use stackfold::{builtin, Config, Engine, Operand, Registry, Value};
//!
//! let registry = Registry::from_instructions([builtin::instruction()])?;
//! let engine = Engine::new(Config::default(), registry)?;
//!
//! let a = Value::stack(vec![Operand::new("increment", &b"2"[..])]);
//! let b = Value::stack(vec![Operand::new("increment", &b"3"[..])]);
//!
//! let combined = engine.combine(&[a, b])?;
//! let resolved = engine.resolve(&combined.value()?)?;
//! assert_eq!(resolved.full(), Some(&b"5"[..]));
//! # Ok::<(), stackfold::Error>(())
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

macro_rules! supported {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err($crate::Error::Unsupported($msg.to_owned()));
        }
    };
}

pub mod builtin;
mod codec;
mod computer;
mod config;
mod engine;
mod merger;
mod operator;
mod pool;
mod result;
pub mod varint;

pub use inline_array::InlineArray;

pub use crate::{
    codec::{walk, Kind, Operand, Stack, Value, STACK_VERSION, VALUE_VERSION},
    computer::{Computed, Computer},
    config::Config,
    engine::{Engine, Stats},
    merger::{Merger, ValueMerger},
    operator::{ApplyFn, CombineFn, Instruction, Operator, Registry},
    pool::{Buf, BufferPool, Pooled, Reset},
    result::{Error, Result},
};
