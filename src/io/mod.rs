//! File output owned by a tracking session.

pub mod varlog;

pub use varlog::{VarLog, VarLogColumns, VarRecord};
