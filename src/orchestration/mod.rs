pub mod infuse_orchestrator;

pub use infuse_orchestrator::InfuseOrchestrator;
