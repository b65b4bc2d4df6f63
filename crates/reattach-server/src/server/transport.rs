//! gRPC-only plugin adapter.
//!
//! [`GrpcProviderPlugin`] wraps a service factory so that the service can only
//! be exposed over gRPC, and only as a server: asking it for the host-side
//! client ([`GrpcPlugin::grpc_client`]) is refused.
//!
//! The serve loops only accept [`GrpcPlugin`] implementors, so the legacy
//! net/rpc capability ([`LegacyPlugin`]) is never reached from them. It still
//! exists and always refuses, so a host probing the old broker path gets a
//! deterministic error instead of a half-working transport.

use core::convert::Infallible;
use reattach_core::{Error, Result};
use tonic::{
    body::Body,
    codegen::{Service, http},
    server::NamedService,
    transport::{Channel, Server, server::Router},
};

/// A plugin that can register itself on a gRPC server.
pub trait GrpcPlugin: Send + Sync + 'static {
    /// Binds a fresh service instance into `server`'s registry.
    fn register(&self, server: &mut Server) -> Router;

    /// Builds the host-side client over `channel`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedTransport`] for plugins that only implement the
    /// server side.
    fn grpc_client(&self, channel: Channel) -> Result<Infallible>;
}

/// Handle to the multiplexed connection broker of the legacy net/rpc
/// transport. Nothing in this workspace produces one over the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxBroker;

/// The legacy net/rpc plugin capability, kept only to refuse it.
pub trait LegacyPlugin {
    /// # Errors
    ///
    /// Always [`Error::UnsupportedTransport`].
    fn server(&self, broker: &MuxBroker) -> Result<Infallible>;

    /// # Errors
    ///
    /// Always [`Error::UnsupportedTransport`].
    fn client(&self, broker: &MuxBroker) -> Result<Infallible>;
}

/// Exposes the services produced by `factory` over gRPC and nothing else.
pub struct GrpcProviderPlugin<F> {
    factory: F,
}

impl<F> GrpcProviderPlugin<F> {
    pub const fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, S> GrpcPlugin for GrpcProviderPlugin<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
        + NamedService
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    fn register(&self, server: &mut Server) -> Router {
        tracing::trace!(service = S::NAME, "registering plugin service");
        server.add_service((self.factory)())
    }

    fn grpc_client(&self, _channel: Channel) -> Result<Infallible> {
        Err(Error::UnsupportedTransport)
    }
}

impl<F> LegacyPlugin for GrpcProviderPlugin<F> {
    fn server(&self, _broker: &MuxBroker) -> Result<Infallible> {
        Err(Error::UnsupportedTransport)
    }

    fn client(&self, _broker: &MuxBroker) -> Result<Infallible> {
        Err(Error::UnsupportedTransport)
    }
}
