pub mod journal;
pub mod keys;
pub mod outcomes;
pub mod prompts;
pub mod requests;

pub use journal::{JournalEntry, JournalEvent, RequestJournal, Workflow};
pub use keys::cache_key;
pub use outcomes::{PipelineOutcome, Stage};
pub use requests::VehicleImageRequest;
