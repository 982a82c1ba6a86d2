pub mod abi_manager;
pub mod endpoints;
