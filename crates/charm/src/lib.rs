pub mod agent;
pub mod aggregate;
pub mod artifacts;
pub mod errors;
pub mod events;
pub mod formatter;
pub mod invoker;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod registry;
pub mod servers;
