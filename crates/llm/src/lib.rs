pub mod error;
pub mod providers;
pub mod registry;
pub mod retry;

pub use error::{classify, ErrorCategory, ErrorClassification};
pub use registry::{
    global, register_builtin_providers, ProviderConfig, ProviderFeatures, ProviderMetadata,
    ProviderRegistry, ProviderRegistryError,
};
pub use retry::retry_delay;
