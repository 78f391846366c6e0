//! Classifier gateway and its collaborators: the inference adapter seam,
//! the Ollama implementation, and the shared circuit breaker.

pub mod breaker;
pub mod gateway;
pub mod ollama;
pub mod provider;

pub use breaker::{BreakerState, BreakerTransition, CircuitBreaker};
pub use gateway::ClassifierGateway;
pub use ollama::OllamaProvider;
pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, InferenceProvider, Role};
