// Pure sizing and decision logic; I/O only through the adapter contract
pub mod execution;
pub mod sizer;
pub mod trailing;
pub mod types;
