pub mod args;
pub mod config;
pub mod daemon;
pub mod device;
pub mod lease;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;
