mod manager;

pub use manager::{BackendBuilder, ProviderBackends, SynchronizerFactory};
