pub mod async_teardown;

pub use async_teardown::*;
