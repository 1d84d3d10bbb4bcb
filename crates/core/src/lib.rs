pub mod enums;
pub mod error;
pub mod ids;
pub mod job;
pub mod pricing;
