pub mod action;
pub mod bootstrap;
pub mod context;
pub mod env;
pub mod error;
pub mod instance;
pub mod io;
pub mod model;
pub mod model_file;
pub mod orchestrator;
pub mod paths;
pub mod provision;
pub mod resolver;
pub mod resources;
pub mod selector;
pub mod stage;
pub mod template;
pub mod topology;
pub mod transport;
pub mod variables;

pub use context::RunContext;
pub use error::{LabError, Result};
pub use model::Model;
pub use model_file::ModelFile;
pub use orchestrator::Orchestrator;
