//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - [load balancing](load_balancing), which orders the nodes a request is sent to,
//! - [retry](retry), which decides what to do after a failed attempt.

pub mod load_balancing;
pub mod retry;
