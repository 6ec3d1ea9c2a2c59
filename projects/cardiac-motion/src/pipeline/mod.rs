// Motion-quantification pipeline stages

pub mod aggregate;
pub mod crop;
pub mod extract;
pub mod finalize;
pub mod oracle;
pub mod orchestrator;
pub mod plot;
pub mod registration;
pub mod types;
