pub mod gateway;
pub mod path;
pub(crate) mod subscriptions;

pub use gateway::{
    GatewayError, GatewayErrorKind, RemoteChange, RemoteChangeCallback, RemoteFilter,
    RemoteGateway, RemoteQuery, RemoteSubscription,
};
pub use path::render_json_path;
