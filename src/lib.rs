#![forbid(unsafe_code)]
#![doc = r#"
LXD Gateway

Authenticated single-endpoint gateway in front of one fixed inference worker.

Crate highlights
- Two request dialects: `{prompt}` and OpenAI-style `{messages}`, normalized into one upstream `input`.
- Two response dialects: the `{success, result}` envelope and a chat-completion body, buffered or streamed as SSE.
- Per-key usage counting against a pluggable key registry (sled, Redis, memory).

Modules
- `registry`: key lookup and usage counters, lazily opened through `RegistryProvider`.
- `normalize`: inbound request shapes, effort levels and effort policy.
- `upstream`: buffered and streaming calls to the inference worker.
- `adapter`: answer extraction across the worker's response layouts.
- `envelope`: outbound bodies and SSE frames.
- `relay`: upstream byte stream to SSE frames, counting each stream exactly once.
- `server`: Actix-web routes and the request handler.
- `config`, `util`, `error`: CLI/env configuration, tracing/HTTP/CORS helpers, error taxonomy.
"#]

pub mod adapter;
pub mod config;
pub mod envelope;
pub mod error;
pub mod normalize;
pub mod registry;
pub mod relay;
pub mod server;
pub mod upstream;
pub mod util;

pub use crate::adapter::{extract_text, UpstreamResult};
pub use crate::config::GatewayConfig;
pub use crate::error::{GatewayError, GatewayResult};
pub use crate::normalize::{normalize, Dialect, Effort, EffortPolicy, InboundRequest, NormalizedInput};
pub use crate::registry::{KeyBackend, KeyRecord, KeyRegistry, KeyStore, MemoryStore, RegistryProvider};
pub use crate::server::{config_routes, AppState};
pub use crate::upstream::{UpstreamClient, UpstreamError};
