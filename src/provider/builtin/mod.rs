//! Providers compiled into the engine.
//!
//! `local` manages files on the machine running the engine and `null`
//! manages nothing at all. Both are enough to drive a full plan/apply
//! cycle without credentials.

mod local;
mod null;

pub use local::LocalProvider;
pub use null::NullProvider;

use crate::value::{Attributes, Value};

fn attr_str<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a str> {
    attrs.get(name).and_then(Value::as_str)
}
