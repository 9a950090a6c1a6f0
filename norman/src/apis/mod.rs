//! Typed kinds served through the facade, one module per API group
pub mod management;
