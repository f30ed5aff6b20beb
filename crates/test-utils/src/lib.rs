pub mod builders;
pub mod fake_backend;

pub use builders::TargetBuilder;
pub use fake_backend::{FakeBackend, FakePoll, FakeStart};
