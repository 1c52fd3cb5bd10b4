#![forbid(unsafe_code)]

pub mod control;
pub mod host;
pub mod orchestrator;
pub mod pool;

#[cfg(test)]
mod test_support;
