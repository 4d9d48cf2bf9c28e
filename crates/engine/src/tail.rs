//! Live chain following
//!
//! `tail` steps a [`ChainFollower`] until asked to stop. While behind it
//! steps back to back; at the tip it sleeps for the poll interval, waking
//! early if the shutdown flag flips.

use crate::follower::{ChainFollower, FollowStep};
use crate::provider::{BlockProvider, LogProvider};
use chainstore_core::error::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Options of a tail run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    /// Sleep between polls once at the tip
    pub poll_interval: Duration,
    /// Stop after this many steps
    pub max_iterations: Option<u64>,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_iterations: None,
        }
    }
}

/// What a tail run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailReport {
    /// Steps taken, including those that found nothing new
    pub iterations: u64,
    /// Blocks processed
    pub blocks: u64,
}

/// Follow the chain until `shutdown` holds `true` or the iteration limit is
/// reached.
///
/// # Errors
///
/// Returns the first error of [`ChainFollower::step`].
pub async fn tail<P>(
    follower: &mut ChainFollower<P>,
    options: &TailOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<TailReport>
where
    P: BlockProvider + LogProvider,
{
    let mut report = TailReport::default();
    let mut was_at_tip = false;

    loop {
        if *shutdown.borrow() {
            info!(target: "chainstore::tail", "Shutdown requested");
            break;
        }
        if options.max_iterations.is_some_and(|max| report.iterations >= max) {
            break;
        }

        let step = follower.step().await?;
        report.iterations += 1;

        match step {
            FollowStep::More { depth, next_block } => {
                report.blocks += 1;
                was_at_tip = false;
                debug!(target: "chainstore::tail", next_block, depth, "Stepped");
            }
            FollowStep::Tip => {
                if !was_at_tip {
                    info!(
                        target: "chainstore::tail",
                        next_block = follower.next_block(),
                        "At chain tip"
                    );
                    was_at_tip = true;
                }
                tokio::select! {
                    _ = tokio::time::sleep(options.poll_interval) => {}
                    changed = shutdown.changed() => {
                        // Sender gone: nobody can request shutdown any more.
                        if changed.is_err() {
                            tokio::time::sleep(options.poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    info!(
        target: "chainstore::tail",
        iterations = report.iterations,
        blocks = report.blocks,
        "Tail stopped"
    );
    Ok(report)
}
