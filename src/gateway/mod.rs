// Action gateway: the single boundary between the orchestration core and the
// remote store. Every mutation passes through `ActionGateway::invoke`.

pub mod client;
pub mod errors;
pub mod memory;
pub mod retry;
pub mod store;

pub use client::{ActionGateway, GatewayRequest, GatewayResponse};
pub use errors::GatewayError;
pub use memory::{InMemoryStore, StoreFailure};
pub use retry::RetryPolicy;
pub use store::{Mutation, MutationKind, RemoteStore, StoreAck, StoreError};
