//! Validation engine.
//!
//! Pluggable validators, concurrent dispatch with failure isolation,
//! weighted scoring, the human-review gate, and report rendering.

#![warn(missing_docs)]

pub mod validator;
pub mod registry;
pub mod engine;
pub mod aggregator;
pub mod gate;
pub mod report;
pub mod human;
pub mod parser;
pub mod builtin;

#[cfg(test)]
mod testing;

pub use validator::{Validator, ValidatorDescriptor};
pub use registry::{RegistryError, ValidatorRegistry};
pub use engine::{EngineError, ValidationEngine};
pub use aggregator::ResultsAggregator;
pub use gate::GateDecision;
pub use report::{Report, ReportBatch, ReportError, ReportGenerator};
pub use human::ReviewPacket;
pub use builtin::{
    registry_from_config, AiJudgmentValidator, ExternalCommandValidator, PatternRulesValidator,
};
pub use parser::ParseError;
