/// Backend seam, stream handles, and api error taxonomy.
pub mod backend;
/// Client-wide tunables.
pub mod config;
/// HTTP implementation of the backend seam.
pub mod http;
/// Cached identity persistence.
pub mod identity;
/// Conversation session controller.
pub mod session;
/// Frame decoding and paced reveal for streamed replies.
mod stream;

pub use backend::{
    ApiError, ApiResult, AssistantBackend, AudioClip, BoxFuture, ResponseStream, SendRequest,
    StreamHandle, StreamWorker, make_event_stream,
};
pub use config::{
    ClientConfig, DEFAULT_BASE_URL, DEFAULT_IDLE_TIMEOUT, DEFAULT_REVEAL_INTERVAL,
};
pub use http::HttpBackend;
pub use identity::{
    DEFAULT_IDENTITY_FILE, IdentityResult, IdentityStore, IdentityStoreError, StoredIdentity,
};
pub use session::{
    ChatSession, SessionError, SessionEvent, SessionResult, SessionSnapshot,
};
