pub mod chats;
pub mod content_sources;
pub mod jobs;
pub mod metrics;
pub mod realms;
pub mod reflections;
pub mod smart;
pub mod synthesis;
pub mod texts;
pub mod versions;
