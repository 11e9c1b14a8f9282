//! # Treehole Agent
//!
//! Application crate for the treehole assistant: configuration, the
//! HTTP forum and LLM clients, the disk search cache, and the three
//! front-ends (CLI, web server, email bot).
//!
//! The retrieval and synthesis logic lives in `treehole-core`; this
//! crate plugs real transports into its [`treehole_core::ForumSearcher`]
//! and [`treehole_core::ChatModel`] traits.
//!
//! Custom binaries can embed the bot with their own mailbox plumbing:
//!
//! ```rust,no_run
//! use treehole_agent::{agent::Agent, config, email};
//!
//! # async fn example(transport: Box<dyn email::MailTransport>) -> anyhow::Result<()> {
//! let config = config::load_config("./config/treehole.toml".as_ref())?;
//! let agent = Agent::from_config(&config)?;
//! email::run_bot(agent, transport, config.email).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod email;
pub mod forum;
pub mod llm;
pub mod server;
