//! API middleware stack.
//!
//! Execution order (outermost → innermost):
//! 1. Actor resolver (staff/patient routes) or signature verifier (webhook)
//! 2. Audit logger: logs after identity is known

pub mod actor;
pub mod audit;
pub mod signature;
