pub mod cli;
pub mod monitor;
pub mod squash;
