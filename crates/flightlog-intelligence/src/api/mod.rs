pub mod chat_api;
pub mod docs_api;
pub mod session_api;
