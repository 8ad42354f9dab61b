mod guard;

pub use guard::CleanupGuard;
