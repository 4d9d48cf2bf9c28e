//! End-to-end token indexer tests
//!
//! A small ERC-20 style indexer runs through the whole stack on disk:
//! fetch and backfill from log files, live following with reorgs, restarts
//! on the log-structured backend and export/import between backends.

mod common;

mod pipeline;
mod portability;
mod restart;
