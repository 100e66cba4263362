/// Bus facade: context object, node factory, pump, stats.
pub mod bus;
/// Bus configuration loading.
pub mod config;
/// Common error types: topic names, type conflicts, encoding/decoding.
pub mod error;
/// Flexible logging (console and rolling file sinks).
pub mod logging;
/// Pub/Sub core: nodes, publishers, subscribers, topic registry.
pub mod pubsub;
/// Synchronous request/response on top of pub/sub.
pub mod rpc;
/// Connection layers for remote delivery (loopback, null).
pub mod transport;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Bus context and its background pump.
pub use bus::{Bus, BusStats, PumpHandle};
/// config
pub use config::BusConfig;
/// Operation errors and result types.
pub use error::{BusError, BusResult, DecodeError, EncodeError};
/// Logging bootstrap.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Pub/Sub API: Node, Publisher, Subscriber, registry introspection.
pub use pubsub::{
    AdvertiseOptions, BusMessage, Envelope, Handler, Node, Publisher, StringMsg, Subscriber,
    TopicRegistry, TopicSnapshot,
};
/// Request/response API.
pub use rpc::{serve, RpcReply, RpcRequest, RpcResponse, RpcServer};
/// Connection layers.
pub use transport::{
    ConnectionLayer, LoopbackConnections, NullConnections, RemoteLink, RemotePublisherInfo,
    TopicInfo,
};
