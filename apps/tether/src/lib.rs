pub mod config;
pub mod discovery;
pub mod metrics;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;
