//! # imsg-lens
//!
//! Incremental image embedding and filtered semantic search over a local
//! Messages archive.
//!
//! An embed run reads image attachments newer than a persisted watermark
//! from `chat.db`, embeds them with CLIP, and upserts one document per
//! attachment into an Elasticsearch index. The read side turns a free-text
//! query plus filters into a nearest-neighbour request (or a sorted scroll
//! when there is no query) and derives display facts from the returned
//! payloads.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌───────────────┐
//! │ archive  │──▶│ embedding │──▶│  writer  │──▶│ Elasticsearch │
//! │ chat.db  │   │   CLIP    │   │  _bulk   │   │     index     │
//! └──────────┘   └───────────┘   └──────────┘   └──────┬────────┘
//!       ▲                                              │
//!   ┌───┴────┐                         ┌───────────────┤
//!   │ cursor │                         ▼               ▼
//!   └────────┘                    ┌─────────┐    ┌──────────┐
//!                                 │  query  │──▶ │ present  │
//!                                 └─────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! imsg-lens init                          # create the index mapping
//! imsg-lens embed                         # embed new image attachments
//! imsg-lens search "beach sunset" --person John
//! imsg-lens browse --sort oldest --group-only
//! imsg-lens status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`cursor`] | Persistent watermark and counters |
//! | [`archive`] | Read image attachments from `chat.db` |
//! | [`embedding`] | Embedder backends and the batch-safe engine |
//! | [`index`] | Document index trait, Elasticsearch and in-memory backends |
//! | [`writer`] | Build and upsert image documents |
//! | [`pipeline`] | Incremental embed run |
//! | [`query`] | Filter/query resolution, `search` and `browse` |
//! | [`present`] | Relative times, chat names, sender-tagged lines |
//! | [`progress`] | Embed progress on stderr |
//! | [`status`] | Cursor and index overview |

pub mod archive;
pub mod config;
pub mod cursor;
pub mod embedding;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod present;
pub mod progress;
pub mod query;
pub mod status;
pub mod writer;
