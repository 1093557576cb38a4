//! DwOperator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the dw-operator controller.

pub mod dw_operator;

pub use dw_operator::*;
