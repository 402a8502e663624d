//! # Service module
//!
//! This module provides the operator services, the custom resource, the
//! kubernetes helpers and the zuul reconciliation engine

pub mod cfg;
pub mod crd;
pub mod dependency;
pub mod http;
pub mod k8s;
pub mod zuul;
