//! Stand-in provider used by the `plugintest` binary and the tests.
//!
//! It exposes gRPC server reflection describing the health service, which is
//! enough for a host (or `grpcurl`) to see a live plugin without any
//! provider-specific protobuf definitions.

use crate::server::transport::{GrpcPlugin, GrpcProviderPlugin, LegacyPlugin};
use tonic_reflection::server::{
    Builder, Error as ReflectionError,
    v1::{ServerReflection, ServerReflectionServer},
};

/// Builds the reflection service served by the stand-in provider.
///
/// # Errors
///
/// Returns an error if the embedded descriptor set cannot be decoded.
pub fn reflection_service()
-> Result<ServerReflectionServer<impl ServerReflection>, ReflectionError> {
    Builder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
        .build_v1()
}

/// The stand-in provider as a gRPC-only plugin.
///
/// # Errors
///
/// See [`reflection_service`].
pub fn reflection_plugin() -> Result<impl GrpcPlugin + LegacyPlugin, ReflectionError> {
    let service = reflection_service()?;
    Ok(GrpcProviderPlugin::new(move || service.clone()))
}
