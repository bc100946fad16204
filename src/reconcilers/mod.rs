//! Reconciliation logic for the ImageRegistry CRD
//!
//! Split into three pure layers:
//! - `normalize` turns the declared storage spec into a fully resolved target
//! - `conditions` owns condition bookkeeping and the top-level rollup
//! - `registry` plans a pass: next status plus the side effects to fire

pub mod conditions;
pub mod normalize;
pub mod registry;
