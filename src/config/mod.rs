//! Configuration module: prompts shared by every model profile.

mod prompts;

pub use prompts::get_system_prompt;
