pub mod archetype;
pub mod claim;
pub mod config;
pub mod context;
pub mod course;
pub mod errors;
pub mod gate;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod planning;
pub mod progress;
pub mod provider;
pub mod store;
pub mod transcript;
