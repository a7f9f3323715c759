//! kitrace CLI - reproduces stale images served by BuildKit after
//! overlapping pushes to one tag.

pub mod commands;
