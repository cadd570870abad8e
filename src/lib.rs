#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unused_self,
    clippy::unnecessary_wraps,
    dead_code
)]

pub mod blob;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod health;
pub mod heartbeat;
pub mod ingest;
pub mod leads;
pub mod media;
pub mod outbound;
pub mod phone;
pub mod session;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::{BridgeError, BridgeResult};
