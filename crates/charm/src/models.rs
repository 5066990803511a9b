//! These models represent the objects passed around by the orchestration engine
//!
//! There are several different related formats we need to interact with:
//! - chat requests and history, sent from the interface to the server
//! - openai messages/tools, sent from the agent to the LLM
//! - anthropic messages/tools, sent from the agent to the LLM
//! - MCP tool listings and call envelopes, exchanged with the tool servers
//!
//! We always immediately convert those data models into the internal structs using
//! to/from helpers, so the internal models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
