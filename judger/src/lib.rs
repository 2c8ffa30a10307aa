pub mod client;
pub mod config;
pub mod evaluator;
pub mod model;
pub mod prelude;
pub mod queue;
pub mod sandbox;
pub mod server;
pub mod util;
pub mod worker;

#[cfg(test)]
mod test;
