//! Message and embed formatting for command replies.

pub mod embeds;
