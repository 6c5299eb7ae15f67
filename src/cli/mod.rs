mod registry;

pub use registry::{BuiltCommand, ProviderRegistry, RegistryError};
