pub mod api_key_manager;
pub mod arena_client;
pub mod auth_pool;
pub mod browser_fetch;
pub mod captcha_broker;
pub mod classifier;
pub mod completion_builder;
pub mod direct_client;
pub mod dispatcher;
pub mod message_processor;
pub mod model_catalog;
pub mod session_store;
pub mod stream_translator;

pub use api_key_manager::ApiKeyManager;
pub use arena_client::ArenaClient;
