pub mod loops;
pub mod metrics;
pub mod workflows;
