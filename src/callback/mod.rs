//! Asynchronous result correlation: durable records of armed watchers, the
//! watchers themselves, and startup restoration.

mod registry;
mod restore;
mod watcher;

pub use registry::{CallbackRecord, CallbackRegistry, RegistryError};
pub use restore::{HandlerFactory, RestoreCoordinator};
pub use watcher::{CallbackHandler, CallbackWatcher, WatcherHandle};
