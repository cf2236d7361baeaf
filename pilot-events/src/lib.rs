//! ABOUTME: Event bus producer for Pilot workflow execution events
//! ABOUTME: Grounded on llmspell-events — a single in-process broadcast bus, not a full pub/sub mesh

pub mod bus;
pub mod event;

pub use bus::EventBus;
pub use event::{EventKind, WorkflowEvent};
