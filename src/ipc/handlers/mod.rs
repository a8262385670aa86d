pub mod accounts;
pub mod core;
pub mod entities;
pub mod maintenance;
pub mod progress;
pub mod setup;
pub mod sis_imports;
