//! Orchestration graph
//!
//! A minimal DAG executor, not a general workflow engine: nodes are
//! registered by name, edges are declared explicitly, and a breadth-first
//! walk threads a shared [`GraphState`] through the stages, merging each
//! stage's partial update under fixed rules.
//!
//! The standard incident pipeline wires
//! START → detection → analysis → consensus → resolution → communication → END,
//! where analysis fans out into diagnosis and prediction running
//! concurrently.

mod executor;
mod pipeline;
mod state;

pub use executor::{GraphRunOutcome, IncidentGraph, StageNode, END_NODE, START_NODE};
pub use pipeline::{
    standard_pipeline, AnalysisNode, CommunicationSummary, ConsensusNode, PipelineAgents,
    ResolutionNode, StageAdapter, SummaryPublisher,
};
pub use state::{GraphState, StageUpdate, TimelineEvent};

#[cfg(test)]
mod tests;
