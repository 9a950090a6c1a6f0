//! The `management.cattle.io` group
pub mod v3;
