//! Core library for the workflow choreography coordinator: the compiler
//! (C2), the counter protocol (C3), the artifact store (C1), the patch
//! materializer (C5), and the coordinator (C4) that ties them together
//! around a completion-signal stream.

pub mod artifact;
pub mod completion_supervisor;
pub mod compiler;
pub mod condition;
pub mod coordinator;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod hotstore;
pub mod ids;
pub mod model;
pub mod patch;

pub use artifact::ArtifactStore;
pub use completion_supervisor::CompletionSupervisor;
pub use coordinator::Coordinator;
pub use counter::CounterProtocol;
pub use hotstore::HotStore;
pub use patch::PatchMaterializer;
