pub mod retry;
pub mod timers;

pub use retry::RetryPolicy;
pub use timers::TimerRegistry;
