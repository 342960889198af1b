pub mod backoff;
pub mod serde_compat;
