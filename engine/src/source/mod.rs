//! Source resolution: turn a resource's source descriptor into a compose
//! document, with the working directory living on the execution target's
//! filesystem.

mod resolver;

pub use resolver::SourceResolver;
