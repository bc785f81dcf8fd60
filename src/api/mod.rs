// Public surface for hosts embedding the controller.

pub mod logging;
pub mod runtime;

pub use logging::init_tracing;
pub use runtime::ExtensionRuntime;
