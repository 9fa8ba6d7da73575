pub mod registry;
pub mod scheduler;
pub mod watchdog;

pub use registry::SessionRegistry;
pub use scheduler::{TimerHandle, schedule};
pub use watchdog::{IdleConfig, IdleHandle, IdleState, IdleWatchdog, TimeoutHook};
