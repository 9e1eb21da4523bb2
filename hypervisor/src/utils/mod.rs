pub mod logger;
pub mod processor;
