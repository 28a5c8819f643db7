//! Statement parameters and named-placeholder rewriting.
//!
//! Templates use `:name` placeholders. [`NamedQuery`] rewrites them into the
//! positional syntax of the target [`Dialect`](crate::source::Dialect) and
//! pulls the matching values out of a [`Params`] map. A task's parameters are
//! held as a [`ParamSource`], which is either a concrete map or a producer
//! evaluated at execution time.

mod error;
mod map;
mod named;

pub use error::{BindError, BindResult};
pub use map::{ParamFn, ParamSource, Params};
pub use named::{BoundQuery, NamedQuery};
