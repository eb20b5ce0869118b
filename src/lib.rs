//! Rogue Mock Server
//!
//! Hosts mock HTTP endpoints. Clients register apps, each an ordered list of
//! handlers (request predicate plus canned response). Traffic sent to an
//! app's test path is answered by the first eligible handler and recorded
//! in the app's log.
//!
//! # Features
//!
//! - **Ordered Matching**: First handler by insertion order wins; match on
//!   protocol, method and url pattern
//! - **Match Limits**: Cap how many times a handler can match, enforced
//!   atomically under concurrent traffic
//! - **Latency Simulation**: Delay a response without holding a worker
//! - **Audit Log**: Every match is logged before its response is sent
//! - **HTTPS**: Optional TLS listener so handlers can match on `https`
//!
//! # Example Configuration
//!
//! ```yaml
//! tls:
//!   port: 9443
//!   cert_path: /etc/rogue/cert.pem
//!   key_path: /etc/rogue/key.pem
//! auth:
//!   username: admin
//!   password: secret
//! apps:
//!   - id: users
//!     handlers:
//!       - id: on-get-user-1
//!         request:
//!           method: GET
//!           url: /users/:id
//!         response:
//!           status: 500
//!         maxMatches: 1
//!       - id: on-get-user-2
//!         request:
//!           method: GET
//!           url: /users/:id
//!         response:
//!           status: 200
//!           body:
//!             id: 123
//! ```

pub mod admin;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod model;
pub mod store;
pub mod tls;

pub use admin::Admin;
pub use api::ApiState;
pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use error::Error;
pub use store::{MemoryStore, Store};
