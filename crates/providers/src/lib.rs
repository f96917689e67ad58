//! LLM provider adapters and routing.
//!
//! Adapters translate between OSA's canonical chat types and each
//! provider's wire format. The [`registry`] builds adapters from available
//! credentials, [`router`] walks the fallback chain, and [`tiers`] maps
//! capability tiers to concrete models.

pub mod anthropic;
pub mod mock;
pub mod openai_compat;
pub mod registry;
pub mod router;
pub mod sse;
pub mod tiers;
pub mod traits;
pub mod util;

pub use registry::ProviderRegistry;
pub use router::{CallOptions, ProviderRouter};
pub use tiers::TierMap;
pub use traits::{ChatRequest, ChatResponse, LlmCapabilities, LlmProvider, ThinkingBlock};
