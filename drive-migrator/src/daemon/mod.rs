//! Process supervision and signal handling.

pub mod child;
pub mod shutdown;
pub mod watchdog;

pub use child::{ChildLauncher, ProcessLauncher, SupervisedChild};
pub use shutdown::ShutdownCoordinator;
pub use watchdog::{FileProbe, Watchdog, WatchdogOutcome, WatchdogSettings};
