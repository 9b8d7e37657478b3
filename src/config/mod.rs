// Re-export all items from submodules
mod constants;
mod credential;
mod policy;
mod polygate_config;

pub use constants::*;
pub use credential::*;
pub use policy::*;
pub use polygate_config::*;
