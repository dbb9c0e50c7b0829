//! Repository traits for metadata operations.

pub mod channels;
pub mod events;
pub mod files;
pub mod shares;
pub mod uploads;
pub mod users;

pub use channels::{BotRepo, ChannelRepo};
pub use events::EventRepo;
pub use files::{ContentSource, FileContent, FileRepo, FileUpdate};
pub use shares::ShareRepo;
pub use uploads::UploadRepo;
pub use users::{CounterRepo, UserRepo};
