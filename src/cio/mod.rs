//! CIO - final per-cycle trading decision

pub mod decision;

pub use decision::{Cio, CioConfig, CioDecision, DroppedProposal, EmergencyLevel, PriceMode};
