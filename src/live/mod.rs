pub mod protocol;
mod answers;
mod lifecycle;
mod presence;
mod registry;
mod scoring;
mod server;

pub use presence::{ParticipantUpdate, SaveOutcome};
pub use server::LiveServer;
